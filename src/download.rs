// download.rs — 壁纸下载模块
// 把单张壁纸流式写入临时文件，完成后原子重命名到目标路径

use crate::error::DownloadFailure;
use crate::source::WallpaperRecord;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};

/// 单张壁纸的下载结果
#[derive(Debug)]
pub enum DownloadResult {
    /// 新下载并保存
    Saved(PathBuf),
    /// 目标文件已存在，未发起网络请求
    Skipped(PathBuf),
    /// 下载失败；不影响同一收藏夹中的其他壁纸
    Failed(DownloadFailure),
}

/// 临时文件序号，保证同一进程内并发下载的临时文件名互不相同
static PART_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 下载中的临时文件
///
/// 未调用 `commit` 就被丢弃时（出错返回，或整个下载 future 被取消），
/// 在 Drop 中删除临时文件，目标路径上永远不会出现半截文件。
struct PartFile {
    path: PathBuf,
    committed: bool,
}

impl PartFile {
    /// 在目标文件同目录下生成隐藏的临时文件名，如 .wallhaven-abc.jpg.1234-0.part
    /// 同目录保证 rename 不跨文件系统
    fn for_target(target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let seq = PART_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = target.with_file_name(format!(".{name}.{}-{seq}.part", std::process::id()));
        Self {
            path,
            committed: false,
        }
    }

    async fn commit(mut self, target: &Path) -> std::io::Result<()> {
        tokio::fs::rename(&self.path, target).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.committed {
            // 文件可能还没创建，忽略错误
            // Drop 不能 await，这里同步 unlink；取消时 future 可能已不在运行时里，
            // 不能依赖 spawn_blocking 调度删除
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// 壁纸下载器
///
/// 与 API 客户端共用同一个 reqwest::Client（连接池和超时设置一致）。
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// 下载单张壁纸到 `output_dir`
    ///
    /// 目标文件已存在时直接返回 `Skipped`，不访问网络，因此重复运行是幂等的。
    /// 任何失败都以 `Failed` 返回，而不是向上传播错误。
    pub async fn save(&self, record: &WallpaperRecord, output_dir: &Path) -> DownloadResult {
        let target = output_dir.join(record.file_name());

        match tokio::fs::try_exists(&target).await {
            Ok(true) => {
                tracing::debug!(id = record.id(), path = %target.display(), "already downloaded");
                return DownloadResult::Skipped(target);
            }
            Ok(false) => {}
            Err(e) => return DownloadResult::Failed(e.into()),
        }

        match self.fetch_to(record, &target).await {
            Ok(()) => {
                tracing::debug!(id = record.id(), path = %target.display(), "saved");
                DownloadResult::Saved(target)
            }
            Err(e) => {
                tracing::warn!(id = record.id(), url = record.source_url(), error = %e, "download failed");
                DownloadResult::Failed(e)
            }
        }
    }

    async fn fetch_to(&self, record: &WallpaperRecord, target: &Path) -> Result<(), DownloadFailure> {
        let mut response = self.client.get(record.source_url()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadFailure::Status(status.as_u16()));
        }
        let expected_len = response.content_length();

        // part 必须先于 file 声明：变量逆序析构，先关闭文件句柄再删除临时文件
        let part = PartFile::for_target(target);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part.path)
            .await?;
        let mut writer = BufWriter::new(file);

        // 分块写入，不把整张图片读进内存
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        if let Some(expected) = expected_len
            && written != expected
        {
            return Err(DownloadFailure::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("received {written} of {expected} bytes"),
            )));
        }

        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        drop(writer);

        part.commit(target).await?;
        Ok(())
    }
}
