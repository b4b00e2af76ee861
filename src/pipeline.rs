// pipeline.rs — 下载流水线
// 解析收藏夹名称 → 逐个收藏夹遍历 → 有界并发下载 → 汇总结果

use crate::download::{DownloadResult, Downloader};
use crate::error::{ApiError, CollectionFailure, DownloadFailure};
use crate::source::{CollectionInfo, CollectionRef, CollectionSource, WallpaperRecord};
use crate::walker::{self, RetryPolicy};
use futures::StreamExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// 一次运行的全部参数，由 CLI 与配置合并而来
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub username: String,
    /// 收藏夹名称（label）或 ID
    pub collections: Vec<String>,
    pub api_key: Option<String>,
    pub output_dir: PathBuf,
    /// 为 true 时所有壁纸直接保存在 output_dir，不按收藏夹建子目录
    pub flat: bool,
    /// 同时进行的下载数
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

/// 运行过程中的进度事件，交给调用方展示
#[derive(Debug)]
pub enum Event<'a> {
    CollectionStarted {
        info: &'a CollectionInfo,
        dir: &'a Path,
    },
    Downloaded {
        record: &'a WallpaperRecord,
        result: &'a DownloadResult,
    },
}

/// 单个收藏夹的结果
#[derive(Debug, Default)]
pub struct CollectionSummary {
    /// 收藏夹名称；解析失败时为用户输入的原始参数
    pub name: String,
    pub saved: usize,
    pub skipped: usize,
    /// 下载失败的壁纸 id 及原因
    pub failed: Vec<(String, DownloadFailure)>,
    /// 遍历被中止的原因
    pub error: Option<CollectionFailure>,
}

impl CollectionSummary {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.failed.is_empty()
    }
}

/// 整次运行的结果
#[derive(Debug, Default)]
pub struct RunSummary {
    pub collections: Vec<CollectionSummary>,
    /// 中止整个运行的错误（如认证失败）
    pub fatal: Option<ApiError>,
}

impl RunSummary {
    pub fn saved(&self) -> usize {
        self.collections.iter().map(|c| c.saved).sum()
    }

    pub fn skipped(&self) -> usize {
        self.collections.iter().map(|c| c.skipped).sum()
    }

    pub fn failed(&self) -> usize {
        self.collections.iter().map(|c| c.failed.len()).sum()
    }

    /// 没有致命错误、每个收藏夹都完整遍历、且没有下载失败
    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && self.collections.iter().all(CollectionSummary::is_complete)
    }
}

/// 把用户输入的收藏夹名称或 ID 解析为 CollectionInfo
///
/// 匹配顺序：label 完全匹配 → label 忽略大小写匹配 → ID 匹配。
/// 纯数字但不在列表中的参数仍按 ID 使用（未提供 API Key 时私有收藏夹不会出现在列表里）。
/// 返回值与输入一一对应（去重后），单个参数解析失败不影响其他参数。
pub async fn resolve_collections<S>(
    source: &S,
    username: &str,
    wanted: &[String],
    api_key: Option<&str>,
) -> Result<Vec<(String, Result<CollectionInfo, ApiError>)>, ApiError>
where
    S: CollectionSource + ?Sized,
{
    let available = source.list_collections(username, api_key).await?;
    tracing::debug!(username, count = available.len(), "listed collections");

    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(wanted.len());

    for arg in wanted {
        let found = available
            .iter()
            .find(|c| c.label == *arg)
            .or_else(|| available.iter().find(|c| c.label.eq_ignore_ascii_case(arg)))
            .or_else(|| available.iter().find(|c| c.id == *arg))
            .cloned()
            .or_else(|| {
                (!arg.is_empty() && arg.chars().all(|c| c.is_ascii_digit())).then(|| CollectionInfo {
                    id: arg.clone(),
                    label: String::new(),
                    count: None,
                    public: false,
                })
            });

        match found {
            Some(info) => {
                if seen.insert(info.id.clone()) {
                    resolved.push((arg.clone(), Ok(info)));
                }
            }
            None => resolved.push((
                arg.clone(),
                Err(ApiError::NotFound(format!("collection \"{arg}\" of user {username}"))),
            )),
        }
    }

    Ok(resolved)
}

/// 计算收藏夹的保存目录
///
/// 非 flat 模式下以收藏夹 label 作为子目录名，去掉路径分隔符等不安全字符；
/// label 为空或清洗后不可用时改用 ID。
pub fn collection_dir(output_dir: &Path, info: &CollectionInfo, flat: bool) -> PathBuf {
    if flat {
        return output_dir.to_path_buf();
    }

    let cleaned: String = info
        .label
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();

    if cleaned.is_empty() {
        output_dir.join(&info.id)
    } else {
        output_dir.join(cleaned)
    }
}

/// 下载一个收藏夹
///
/// walker 顺序产出记录，下载以 `concurrency` 为上限并发执行。
/// 遍历出错后不再有新记录，已在进行中的下载会正常完成。
#[allow(clippy::too_many_arguments)]
pub async fn download_collection<S, F>(
    source: &S,
    downloader: &Downloader,
    collection: &CollectionRef,
    dir: &Path,
    api_key: Option<&str>,
    policy: &RetryPolicy,
    concurrency: usize,
    summary: &mut CollectionSummary,
    on_event: &mut F,
) where
    S: CollectionSource + ?Sized,
    F: FnMut(Event<'_>),
{
    enum Outcome {
        Done(WallpaperRecord, DownloadResult),
        Aborted(ApiError),
    }

    let downloads = walker::enumerate(source, collection, api_key, policy)
        .map(|item| async move {
            match item {
                Ok(record) => {
                    let result = downloader.save(&record, dir).await;
                    Outcome::Done(record, result)
                }
                Err(e) => Outcome::Aborted(e),
            }
        })
        .buffer_unordered(concurrency.max(1));
    let mut downloads = std::pin::pin!(downloads);

    while let Some(outcome) = downloads.next().await {
        match outcome {
            Outcome::Done(record, result) => {
                on_event(Event::Downloaded {
                    record: &record,
                    result: &result,
                });
                match result {
                    DownloadResult::Saved(_) => summary.saved += 1,
                    DownloadResult::Skipped(_) => summary.skipped += 1,
                    DownloadResult::Failed(e) => summary.failed.push((record.id().to_string(), e)),
                }
            }
            Outcome::Aborted(e) => {
                tracing::error!(%collection, error = %e, "enumeration aborted");
                summary.error = Some(e.into());
            }
        }
    }
}

/// 执行一次完整的下载任务
///
/// 收藏夹按顺序逐个处理。认证失败中止整个运行；
/// 收藏夹不存在或重试耗尽只记录到该收藏夹的结果中，然后继续下一个。
pub async fn run<S, F>(
    source: &S,
    downloader: &Downloader,
    request: &RunRequest,
    mut on_event: F,
) -> RunSummary
where
    S: CollectionSource + ?Sized,
    F: FnMut(Event<'_>),
{
    let api_key = request.api_key.as_deref();
    let mut summary = RunSummary::default();

    let resolved =
        match resolve_collections(source, &request.username, &request.collections, api_key).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!(username = %request.username, error = %e, "cannot list collections");
                summary.fatal = Some(e);
                return summary;
            }
        };

    for (arg, resolution) in resolved {
        let info = match resolution {
            Ok(info) => info,
            Err(e) => {
                let mut failed = CollectionSummary::named(arg);
                failed.error = Some(e.into());
                summary.collections.push(failed);
                continue;
            }
        };

        let name = if info.label.is_empty() {
            info.id.clone()
        } else {
            info.label.clone()
        };
        let mut current = CollectionSummary::named(name);

        let dir = collection_dir(&request.output_dir, &info, request.flat);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            current.error = Some(CollectionFailure::CreateDir {
                path: dir,
                source: e,
            });
            summary.collections.push(current);
            continue;
        }

        on_event(Event::CollectionStarted {
            info: &info,
            dir: &dir,
        });

        let collection = CollectionRef::new(request.username.as_str(), info.id.as_str());
        download_collection(
            source,
            downloader,
            &collection,
            &dir,
            api_key,
            &request.retry,
            request.concurrency,
            &mut current,
            &mut on_event,
        )
        .await;

        tracing::info!(
            %collection,
            saved = current.saved,
            skipped = current.skipped,
            failed = current.failed.len(),
            "collection finished"
        );

        let fatal = matches!(&current.error, Some(CollectionFailure::Api(e)) if e.is_fatal());
        if fatal {
            if let Some(CollectionFailure::Api(e)) = current.error.take() {
                summary.fatal = Some(e);
            }
            summary.collections.push(current);
            break;
        }
        summary.collections.push(current);
    }

    summary
}
