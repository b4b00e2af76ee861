// walker.rs — 收藏夹遍历模块
// 逐页调用 CollectionSource，把分页结果摊平成一个惰性的记录流，
// 并在这里统一处理限流和临时错误的重试

use crate::error::ApiError;
use crate::source::{CollectionRef, CollectionSource, Page, PageToken, WallpaperRecord};
use futures::Stream;
use futures::stream;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

/// 重试策略
///
/// 限流与临时错误分开计数：限流按固定间隔（或服务端的 Retry-After）等待，
/// 临时错误按指数退避等待。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 同一页因限流最多重试几次
    pub rate_limit_retries: u32,
    /// 服务端没有给出 Retry-After 时的等待时间
    pub rate_limit_backoff: Duration,
    /// 单次限流等待的上限，Retry-After 超过它时按它截断
    pub max_rate_limit_wait: Duration,
    /// 同一页因临时错误最多重试几次
    pub transient_retries: u32,
    /// 第一次临时错误后的等待时间
    pub initial_backoff: Duration,
    /// 指数退避的上限
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// 是否给等待时间加随机抖动
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_retries: 5,
            // Wallhaven 限流窗口为每分钟 45 次请求
            rate_limit_backoff: Duration::from_secs(60),
            max_rate_limit_wait: Duration::from_secs(120),
            transient_retries: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    fn next_backoff(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(current.as_secs_f64() * self.backoff_multiplier)
            .min(self.max_backoff)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        // 实际等待时间落在 [delay, 1.5 * delay]
        let factor: f64 = rand::thread_rng().gen_range(0.0..=0.5);
        Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + factor))
    }
}

/// 获取一页，按策略重试限流和临时错误
async fn fetch_with_retry<S>(
    source: &S,
    collection: &CollectionRef,
    page: PageToken,
    api_key: Option<&str>,
    policy: &RetryPolicy,
) -> Result<Page, ApiError>
where
    S: CollectionSource + ?Sized,
{
    let mut rate_limited = 0;
    let mut transient = 0;
    let mut delay = policy.initial_backoff;

    loop {
        match source.fetch_page(collection, &page, api_key).await {
            Ok(result) => {
                if rate_limited + transient > 0 {
                    tracing::info!(%collection, %page, rate_limited, transient, "page fetched after retry");
                }
                return Ok(result);
            }
            Err(ApiError::RateLimited { retry_after }) if rate_limited < policy.rate_limit_retries => {
                rate_limited += 1;
                let wait = retry_after
                    .unwrap_or(policy.rate_limit_backoff)
                    .min(policy.max_rate_limit_wait);
                tracing::warn!(
                    %collection,
                    %page,
                    attempt = rate_limited,
                    max_attempts = policy.rate_limit_retries,
                    wait_ms = wait.as_millis() as u64,
                    "rate limited, waiting before retry"
                );
                tokio::time::sleep(wait).await;
            }
            Err(ApiError::Transient(e)) if transient < policy.transient_retries => {
                transient += 1;
                let wait = policy.with_jitter(delay);
                tracing::warn!(
                    %collection,
                    %page,
                    error = %e,
                    attempt = transient,
                    max_attempts = policy.transient_retries,
                    wait_ms = wait.as_millis() as u64,
                    "page request failed, retrying"
                );
                tokio::time::sleep(wait).await;
                delay = policy.next_backoff(delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(%collection, %page, error = %e, "retries exhausted, giving up on page");
                } else {
                    tracing::error!(%collection, %page, error = %e, "page request failed");
                }
                return Err(e);
            }
        }
    }
}

/// unfold 的内部状态
struct Walk<'a, S: ?Sized> {
    source: &'a S,
    collection: &'a CollectionRef,
    api_key: Option<&'a str>,
    policy: &'a RetryPolicy,
    next: Option<PageToken>,
    buffered: VecDeque<WallpaperRecord>,
    seen: HashSet<String>,
    /// 缓冲区清空后再交给调用方的错误
    pending_error: Option<ApiError>,
    finished: bool,
}

/// 遍历整个收藏夹
///
/// 返回的流是惰性的：只有当上一页的记录被消费完后才会请求下一页。
/// 流是有限的，只能从第一页重新开始。一旦产出错误，流随即结束。
/// 同一次遍历中重复出现的 id 只产出一次（分页在遍历期间发生偏移时可能出现）。
pub fn enumerate<'a, S>(
    source: &'a S,
    collection: &'a CollectionRef,
    api_key: Option<&'a str>,
    policy: &'a RetryPolicy,
) -> impl Stream<Item = Result<WallpaperRecord, ApiError>> + 'a
where
    S: CollectionSource + ?Sized,
{
    let walk = Walk {
        source,
        collection,
        api_key,
        policy,
        next: Some(PageToken::first()),
        buffered: VecDeque::new(),
        seen: HashSet::new(),
        pending_error: None,
        finished: false,
    };

    stream::unfold(walk, |mut walk| async move {
        loop {
            if let Some(record) = walk.buffered.pop_front() {
                return Some((Ok(record), walk));
            }
            if let Some(e) = walk.pending_error.take() {
                walk.finished = true;
                return Some((Err(e), walk));
            }
            if walk.finished {
                return None;
            }
            let page = walk.next.take()?;

            tracing::debug!(collection = %walk.collection, %page, "fetching page");
            match fetch_with_retry(walk.source, walk.collection, page, walk.api_key, walk.policy)
                .await
            {
                Ok(Page { records, next_page }) => {
                    let seen = &mut walk.seen;
                    walk.buffered
                        .extend(records.into_iter().filter(|r| seen.insert(r.id().to_string())));

                    match next_page {
                        // 游标必须严格递增，否则视为无效响应，避免死循环
                        Some(next) if next <= page => {
                            walk.pending_error = Some(ApiError::InvalidResponse(format!(
                                "next page {next} does not advance past page {page}"
                            )));
                        }
                        next => walk.next = next,
                    }
                }
                Err(e) => {
                    walk.finished = true;
                    return Some((Err(e), walk));
                }
            }
        }
    })
}
