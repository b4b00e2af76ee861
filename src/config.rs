// config.rs — 配置管理模块
// 遵循 Unix 风格：优先从 ~/.config/whcollect/config.toml 读取配置
// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值（命令行部分在 main.rs 合并）

use crate::error::ConfigError;
use crate::source::wallhaven::DEFAULT_BASE_URL;
use crate::walker::RetryPolicy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 读取 API Key 的环境变量
pub const API_KEY_ENV: &str = "WALLHAVEN_API_KEY";

/// 并发下载数的上限，避免触发 API 限流
pub const MAX_CONCURRENCY: usize = 16;

/// 展开路径中的 ~ 和 $VAR / ${VAR}
///
/// `~` 与 `$HOME` 都解析为传入的 home，其余变量读取进程环境；变量未定义时报错。
fn expand_path(path_str: &str, home: &Path) -> Result<PathBuf, ConfigError> {
    let home_str = home.to_string_lossy().into_owned();
    let expanded = shellexpand::full_with_context(
        path_str,
        || Some(home_str.clone()),
        |var: &str| -> Result<Option<String>, env::VarError> {
            if var == "HOME" {
                return Ok(Some(home_str.clone()));
            }
            env::var(var).map(Some)
        },
    )
    .map_err(|e| ConfigError::Invalid {
        key: "common.output_dir",
        message: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// 映射 config.toml 文件内容的嵌套结构体
#[derive(Debug, Deserialize, Serialize, Default, JsonSchema)]
struct ConfigFile {
    #[serde(default)]
    common: CommonConfig,
    #[serde(default)]
    api: ApiConfig,
    #[serde(default)]
    retry: RetryConfig,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct CommonConfig {
    /// 壁纸保存根目录 (支持 ~、$HOME 等环境变量，相对路径则相对于 $HOME)
    #[serde(default)]
    output_dir: Option<String>,
    /// 不按收藏夹创建子目录
    #[serde(default)]
    flat: bool,
    /// 同时进行的下载数 (1-16)
    #[serde(default = "default_concurrency")]
    concurrency: usize,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            flat: false,
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct ApiConfig {
    /// Wallhaven API Key（环境变量 WALLHAVEN_API_KEY 优先）
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default = "default_base_url")]
    base_url: String,
    /// 单次请求的超时时间（秒）
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// 重试策略
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct RetryConfig {
    #[serde(default = "default_rate_limit_retries")]
    rate_limit_retries: u32,
    /// 未收到 Retry-After 时，限流后的等待时间（秒）
    #[serde(default = "default_rate_limit_backoff_secs")]
    rate_limit_backoff_secs: u64,
    /// 单次限流等待的上限（秒），服务端给出更长的 Retry-After 时也按此截断
    #[serde(default = "default_max_rate_limit_wait_secs")]
    max_rate_limit_wait_secs: u64,
    #[serde(default = "default_transient_retries")]
    transient_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    backoff_multiplier: f64,
    #[serde(default = "default_true")]
    jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_retries: default_rate_limit_retries(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            max_rate_limit_wait_secs: default_max_rate_limit_wait_secs(),
            transient_retries: default_transient_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_true(),
        }
    }
}

impl RetryConfig {
    fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            rate_limit_retries: self.rate_limit_retries,
            rate_limit_backoff: Duration::from_secs(self.rate_limit_backoff_secs),
            max_rate_limit_wait: Duration::from_secs(self.max_rate_limit_wait_secs),
            transient_retries: self.transient_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_timeout_secs() -> u64 {
    90
}
fn default_rate_limit_retries() -> u32 {
    5
}
fn default_rate_limit_backoff_secs() -> u64 {
    60
}
fn default_max_rate_limit_wait_secs() -> u64 {
    120
}
fn default_transient_retries() -> u32 {
    4
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

/// 应用全局配置项
///
/// 由 main 构造后以参数形式向下传递，不存在进程级全局状态。
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Wallhaven API Key (优先级：ENV > TOML)
    pub api_key: Option<String>,
    /// 壁纸保存根目录
    pub output_dir: PathBuf,
    pub flat: bool,
    pub concurrency: usize,
    pub base_url: String,
    /// 单次请求的超时时间
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// 配置文件所在路径
    pub config_path: PathBuf,
}

impl AppConfig {
    /// 加载配置；`config_path` 为 None 时使用默认路径
    ///
    /// 配置文件不存在时使用默认值，存在但无法解析时报错。
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let home = home_dir()?;
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_config_path(&home));
        let file = read_config_file(&config_path)?;
        let env_key = env::var(API_KEY_ENV).ok().filter(|k| !k.trim().is_empty());

        Self::from_file(file, &home, config_path, env_key)
    }

    fn from_file(
        file: ConfigFile,
        home: &Path,
        config_path: PathBuf,
        env_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        validate(&file)?;

        // 壁纸目录：
        // 1. 配置了路径：展开 ~ 和环境变量，相对路径则相对于 $HOME
        // 2. 未配置：默认使用 $HOME/Pictures/whcollect
        let output_dir = match file.common.output_dir.as_deref() {
            Some(dir) => {
                let p = expand_path(dir, home)?;
                if p.is_absolute() { p } else { home.join(p) }
            }
            None => home.join("Pictures").join("whcollect"),
        };

        Ok(Self {
            api_key: env_key.or(file.api.api_key.filter(|k| !k.trim().is_empty())),
            output_dir,
            flat: file.common.flat,
            concurrency: file.common.concurrency,
            base_url: file.api.base_url,
            timeout: Duration::from_secs(file.api.timeout_secs),
            retry: file.retry.to_policy(),
            config_path,
        })
    }

    /// 确保默认壁纸目录存在
    pub fn ensure_output_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.output_dir)
    }

    /// 获取配置文件的 JSON Schema
    pub fn get_schema() -> String {
        let schema = schemars::schema_for!(ConfigFile);
        serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string())
    }

    /// 将当前生效的配置转换为 TOML 字符串（API Key 打码）
    pub fn to_toml(&self) -> String {
        let config_file = ConfigFile {
            common: CommonConfig {
                output_dir: Some(self.output_dir.to_string_lossy().to_string()),
                flat: self.flat,
                concurrency: self.concurrency,
            },
            api: ApiConfig {
                api_key: self.api_key.as_deref().map(mask_key),
                base_url: self.base_url.clone(),
                timeout_secs: self.timeout.as_secs(),
            },
            retry: RetryConfig {
                rate_limit_retries: self.retry.rate_limit_retries,
                rate_limit_backoff_secs: self.retry.rate_limit_backoff.as_secs(),
                max_rate_limit_wait_secs: self.retry.max_rate_limit_wait.as_secs(),
                transient_retries: self.retry.transient_retries,
                initial_backoff_ms: self.retry.initial_backoff.as_millis() as u64,
                max_backoff_ms: self.retry.max_backoff.as_millis() as u64,
                backoff_multiplier: self.retry.backoff_multiplier,
                jitter: self.retry.jitter,
            },
        };

        toml::to_string_pretty(&config_file)
            .unwrap_or_else(|_| "# Error serializing config".to_string())
    }
}

/// 修改配置文件中的单个键并写回
///
/// 直接编辑文件内容而不是 AppConfig，避免把环境变量里的 Key 写进文件。
pub fn set_value(config_path: &Path, key: &str, value: &str) -> Result<(), ConfigError> {
    let mut file = read_config_file(config_path)?;

    match key {
        "output_dir" | "dest" => file.common.output_dir = Some(value.to_string()),
        "flat" => file.common.flat = parse_value("flat", value)?,
        "concurrency" | "jobs" => file.common.concurrency = parse_value("concurrency", value)?,
        "api_key" => file.api.api_key = Some(value.to_string()),
        "base_url" => file.api.base_url = value.to_string(),
        "timeout_secs" => file.api.timeout_secs = parse_value("timeout_secs", value)?,
        _ => {
            return Err(ConfigError::Invalid {
                key: "key",
                message: format!("unknown key `{key}`"),
            });
        }
    }
    validate(&file)?;

    let toml_str = toml::to_string_pretty(&file).map_err(|e| ConfigError::Io {
        path: config_path.to_path_buf(),
        source: std::io::Error::other(e),
    })?;
    let io_err = |source| ConfigError::Io {
        path: config_path.to_path_buf(),
        source,
    };
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(config_path, toml_str).map_err(io_err)
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        message: format!("cannot parse `{value}`"),
    })
}

fn validate(file: &ConfigFile) -> Result<(), ConfigError> {
    let concurrency = file.common.concurrency;
    if concurrency == 0 || concurrency > MAX_CONCURRENCY {
        return Err(ConfigError::Invalid {
            key: "common.concurrency",
            message: format!("must be between 1 and {MAX_CONCURRENCY}, got {concurrency}"),
        });
    }
    if file.api.timeout_secs == 0 {
        return Err(ConfigError::Invalid {
            key: "api.timeout_secs",
            message: "must be greater than zero".to_string(),
        });
    }
    if !(file.api.base_url.starts_with("http://") || file.api.base_url.starts_with("https://")) {
        return Err(ConfigError::Invalid {
            key: "api.base_url",
            message: format!("not an http(s) URL: {}", file.api.base_url),
        });
    }
    if !(file.retry.backoff_multiplier >= 1.0 && file.retry.backoff_multiplier.is_finite()) {
        return Err(ConfigError::Invalid {
            key: "retry.backoff_multiplier",
            message: format!("must be at least 1.0, got {}", file.retry.backoff_multiplier),
        });
    }
    Ok(())
}

/// 辅助函数：解析 TOML 配置文件，文件不存在时返回默认值
fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .ok_or(ConfigError::NoHome)
}

fn default_config_path(home: &Path) -> PathBuf {
    home.join(".config").join("whcollect").join("config.toml")
}

fn mask_key(key: &str) -> String {
    let visible: String = key.chars().take(4).collect();
    format!("{visible}****")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_str(content: &str, env_key: Option<&str>) -> Result<AppConfig, ConfigError> {
        let file: ConfigFile = toml::from_str(content).unwrap();
        AppConfig::from_file(
            file,
            Path::new("/home/alice"),
            PathBuf::from("/home/alice/.config/whcollect/config.toml"),
            env_key.map(str::to_string),
        )
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = from_str("", None).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/home/alice/Pictures/whcollect"));
        assert_eq!(config.concurrency, 4);
        assert!(!config.flat);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.timeout, Duration::from_secs(90));
        assert_eq!(config.retry.rate_limit_retries, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.retry.max_rate_limit_wait, Duration::from_secs(120));
        assert!(config.api_key.is_none());
    }

    #[test]
    fn file_values_are_applied() {
        let config = from_str(
            r#"
            [common]
            output_dir = "walls"
            flat = true
            concurrency = 8

            [api]
            api_key = "from-file"
            timeout_secs = 30

            [retry]
            transient_retries = 1
            max_backoff_ms = 500
            jitter = false
            "#,
            None,
        )
        .unwrap();

        assert_eq!(config.output_dir, PathBuf::from("/home/alice/walls"));
        assert!(config.flat);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.api_key.as_deref(), Some("from-file"));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.retry.transient_retries, 1);
        assert_eq!(config.retry.max_backoff, Duration::from_millis(500));
        assert!(!config.retry.jitter);
    }

    #[test]
    fn env_key_wins_over_file() {
        let config = from_str("[api]\napi_key = \"from-file\"", Some("from-env")).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("from-env"));
    }

    #[test]
    fn absolute_output_dir_is_kept() {
        let config = from_str("[common]\noutput_dir = \"/srv/walls\"", None).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/srv/walls"));
    }

    #[test]
    fn output_dir_expands_tilde_and_variables() {
        let config = from_str("[common]\noutput_dir = \"$HOME/walls\"", None).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/home/alice/walls"));

        let config = from_str("[common]\noutput_dir = \"${HOME}/walls\"", None).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/home/alice/walls"));

        let config = from_str("[common]\noutput_dir = \"~/walls\"", None).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/home/alice/walls"));
    }

    #[test]
    fn undefined_variable_in_output_dir_is_rejected() {
        let result = from_str(
            "[common]\noutput_dir = \"$WHCOLLECT_TEST_UNDEFINED_VAR/walls\"",
            None,
        );
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                key: "common.output_dir",
                ..
            })
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for content in [
            "[common]\nconcurrency = 0",
            "[common]\nconcurrency = 64",
            "[api]\ntimeout_secs = 0",
            "[api]\nbase_url = \"ftp://example.com\"",
            "[retry]\nbackoff_multiplier = 0.5",
        ] {
            assert!(
                matches!(from_str(content, None), Err(ConfigError::Invalid { .. })),
                "{content}"
            );
        }
    }

    #[test]
    fn missing_file_means_defaults_and_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.toml");
        assert!(read_config_file(&missing).is_ok());

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "[common\nflat = ").unwrap();
        assert!(matches!(
            read_config_file(&broken),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn set_value_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        set_value(&path, "concurrency", "6").unwrap();
        set_value(&path, "flat", "true").unwrap();
        set_value(&path, "api_key", "abc123").unwrap();

        let file = read_config_file(&path).unwrap();
        assert_eq!(file.common.concurrency, 6);
        assert!(file.common.flat);
        assert_eq!(file.api.api_key.as_deref(), Some("abc123"));

        assert!(set_value(&path, "concurrency", "0").is_err());
        assert!(set_value(&path, "nope", "1").is_err());
        assert!(set_value(&path, "flat", "maybe").is_err());
        // 失败的修改不会写入文件
        assert_eq!(read_config_file(&path).unwrap().common.concurrency, 6);
    }

    #[test]
    fn dump_masks_api_key() {
        let config = from_str("[api]\napi_key = \"abcdefgh\"", None).unwrap();
        let dumped = config.to_toml();
        assert!(dumped.contains("abcd****"));
        assert!(!dumped.contains("abcdefgh"));
    }

    #[test]
    fn schema_describes_sections() {
        let schema = AppConfig::get_schema();
        assert!(schema.contains("concurrency"));
        assert!(schema.contains("rate_limit_retries"));
    }
}
