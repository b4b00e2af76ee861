// error.rs — 错误类型定义
// API 层、下载层和配置层各自一个枚举，便于调用方按类别决定重试或中止

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 与 Wallhaven API 交互时可能出现的错误
///
/// 分类直接决定上层的处理方式：
/// - `Auth`：整个运行中止
/// - `NotFound`：跳过当前收藏夹
/// - `RateLimited` / `Transient`：由 walker 按策略重试
/// - `InvalidResponse`：响应不符合约定，不重试
#[derive(Debug, Error)]
pub enum ApiError {
    /// API Key 缺失或无效（HTTP 401/403）
    #[error("authentication failed (HTTP {status}): check your API key")]
    Auth { status: u16 },

    /// 用户或收藏夹不存在（HTTP 404）
    #[error("not found: {0}")]
    NotFound(String),

    /// 触发限流（HTTP 429），可能附带服务端建议的等待时间
    #[error("rate limited by the API")]
    RateLimited { retry_after: Option<Duration> },

    /// 网络错误、超时或 5xx
    #[error("transient error: {0}")]
    Transient(String),

    /// 状态码或响应体不符合预期
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// 是否值得重试（限流和临时错误）
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. } | ApiError::Transient(_))
    }

    /// 是否应中止整个运行，而不只是当前收藏夹
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::Auth { .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else {
            // 连接失败、超时、读取响应体中断都归为临时错误
            ApiError::Transient(e.to_string())
        }
    }
}

/// 单张壁纸下载失败的原因
///
/// 只影响当前壁纸，不会中止收藏夹的下载。
#[derive(Debug, Error)]
pub enum DownloadFailure {
    #[error("server responded with HTTP {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 导致某个收藏夹无法继续下载的错误
#[derive(Debug, Error)]
pub enum CollectionFailure {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("cannot create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 配置加载与校验错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot determine home directory: $HOME is not set")]
    NoHome,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
}
