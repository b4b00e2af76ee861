// source/mod.rs — 壁纸源抽象接口模块
// 定义收藏夹数据模型，以及 walker 与 pipeline 依赖的 CollectionSource trait

pub mod wallhaven;

use crate::error::ApiError;
use async_trait::async_trait;
use std::fmt;

/// 一张可下载壁纸的元数据
///
/// 构造后不可变：字段私有，只提供只读访问。
/// 构造时会校验 id 与扩展名，保证由它们拼出的文件名不会跳出输出目录。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WallpaperRecord {
    id: String,
    source_url: String,
    file_extension: String,
}

impl WallpaperRecord {
    /// 创建记录；id、扩展名为空或含非法字符时返回 `None`
    pub fn new(
        id: impl Into<String>,
        source_url: impl Into<String>,
        file_extension: impl Into<String>,
    ) -> Option<Self> {
        let id = id.into();
        let file_extension = file_extension.into().to_ascii_lowercase();
        let source_url = source_url.into();

        let id_ok = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let ext_ok = !file_extension.is_empty()
            && file_extension.len() <= 8
            && file_extension.chars().all(|c| c.is_ascii_alphanumeric());

        if !id_ok || !ext_ok || source_url.is_empty() {
            return None;
        }

        Some(Self {
            id,
            source_url,
            file_extension,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn file_extension(&self) -> &str {
        &self.file_extension
    }

    /// 保存到磁盘时使用的文件名，与 Wallhaven 原图命名一致
    /// 如：wallhaven-94x38z.jpg
    pub fn file_name(&self) -> String {
        format!("wallhaven-{}.{}", self.id, self.file_extension())
    }
}

/// 指向某个用户的某个收藏夹
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRef {
    pub username: String,
    pub collection_id: String,
}

impl CollectionRef {
    pub fn new(username: impl Into<String>, collection_id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            collection_id: collection_id.into(),
        }
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.username, self.collection_id)
    }
}

/// 分页游标
///
/// 对 walker 而言是不透明的：它只会把上一页返回的游标原样传回去。
/// 编码方式由具体的壁纸源决定（Wallhaven 用从 1 开始的页码）。
/// 游标之间可比较，walker 借此检查其单调递增。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageToken(u32);

impl PageToken {
    /// 第一页的游标
    pub fn first() -> Self {
        Self(1)
    }

    pub(crate) fn from_page_number(n: u32) -> Self {
        Self(n)
    }

    pub(crate) fn page_number(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 一页查询结果
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<WallpaperRecord>,
    /// `None` 表示已经是最后一页
    pub next_page: Option<PageToken>,
}

/// 收藏夹列表中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub id: String,
    pub label: String,
    pub count: Option<u64>,
    pub public: bool,
}

/// 收藏夹来源的抽象 Trait
///
/// WallhavenClient 是唯一的生产实现；测试里用脚本化的内存实现替代。
#[async_trait]
pub trait CollectionSource: Send + Sync {
    /// 获取收藏夹的某一页壁纸
    async fn fetch_page(
        &self,
        collection: &CollectionRef,
        page: &PageToken,
        api_key: Option<&str>,
    ) -> Result<Page, ApiError>;

    /// 列出用户的所有（可见的）收藏夹
    async fn list_collections(
        &self,
        username: &str,
        api_key: Option<&str>,
    ) -> Result<Vec<CollectionInfo>, ApiError>;
}
