// wallhaven.rs — Wallhaven API 异步客户端模块
// 负责与 Wallhaven API 交互：列出收藏夹、分页读取收藏夹中的壁纸

use super::{CollectionInfo, CollectionRef, CollectionSource, Page, PageToken, WallpaperRecord};
use crate::error::ApiError;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Wallhaven API 默认地址
pub const DEFAULT_BASE_URL: &str = "https://wallhaven.cc/api/v1";

/// 传递 API Key 的请求头
/// 不放进查询参数，避免 Key 随 URL 出现在错误信息和日志里
const API_KEY_HEADER: &str = "X-API-Key";

/// 收藏夹内容接口的响应
///
/// 远端 schema 不受我们控制，所以这里只把 `data` 读成原始 JSON，
/// 再逐条宽松解析，单条数据异常不会导致整页失败。
#[derive(Deserialize, Debug, Default)]
struct CollectionPageResponse {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    meta: Option<Meta>,
}

/// 分页信息
#[derive(Deserialize, Debug, Default)]
struct Meta {
    #[serde(default)]
    current_page: Option<Value>,
    #[serde(default)]
    last_page: Option<Value>,
}

/// 单张壁纸：只取需要的字段，其余字段由 serde 忽略
#[derive(Deserialize, Debug)]
struct Wallpaper {
    #[serde(default)]
    id: Option<String>,
    /// 原图直链，如 https://w.wallhaven.cc/full/94/wallhaven-94x38z.jpg
    #[serde(default)]
    path: Option<String>,
    /// MIME 类型，如 "image/png"
    #[serde(default)]
    file_type: Option<String>,
}

/// 收藏夹列表接口的响应
#[derive(Deserialize, Debug, Default)]
struct CollectionListResponse {
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Deserialize, Debug)]
struct Collection {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    count: Option<Value>,
    #[serde(default)]
    public: Option<Value>,
}

/// 创建共享的 HTTP 客户端
///
/// API 请求与图片下载共用同一个连接池。所有请求都有总超时，
/// 保证任何一次网络调用都不会无限阻塞。
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(15).min(timeout))
        .user_agent(concat!("whcollect/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Wallhaven API 异步客户端
pub struct WallhavenClient {
    /// HTTP 客户端（内部有连接池，应复用）
    client: reqwest::Client,

    /// API 基础 URL，末尾不带 `/`
    base_url: String,
}

impl WallhavenClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// 在基础 URL 后追加路径段，每段都会被百分号编码
    /// 用户名里的 `/`、`?`、`#` 因此不会改变请求的路径或查询
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ApiError::InvalidResponse(format!("bad base URL {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidResponse(format!("bad base URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// 发送 GET 请求并把 HTTP 状态映射为 ApiError
    async fn get(
        &self,
        url: Url,
        query: &[(&str, String)],
        api_key: Option<&str>,
        what: &str,
    ) -> Result<reqwest::Response, ApiError> {
        tracing::debug!(%url, "API request");
        let mut request = self.client.get(url).query(query);
        if let Some(key) = api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        tracing::debug!(what, status = status.as_u16(), "API response");

        if status.is_success() {
            return Ok(response);
        }

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Auth {
                status: status.as_u16(),
            },
            StatusCode::NOT_FOUND => ApiError::NotFound(what.to_string()),
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited {
                retry_after: parse_retry_after(&response),
            },
            StatusCode::REQUEST_TIMEOUT => ApiError::Transient(format!("HTTP {status}")),
            s if s.is_server_error() => ApiError::Transient(format!("HTTP {s}")),
            s => ApiError::InvalidResponse(format!("unexpected HTTP {s} for {what}")),
        })
    }
}

#[async_trait]
impl CollectionSource for WallhavenClient {
    async fn fetch_page(
        &self,
        collection: &CollectionRef,
        page: &PageToken,
        api_key: Option<&str>,
    ) -> Result<Page, ApiError> {
        let url = self.endpoint(&[
            "collections",
            &collection.username,
            &collection.collection_id,
        ])?;
        let query = [("page", page.page_number().to_string())];

        let response = self
            .get(url, &query, api_key, &format!("collection {collection}"))
            .await?;
        let body: CollectionPageResponse = response.json().await?;

        Ok(parse_page(body, *page))
    }

    async fn list_collections(
        &self,
        username: &str,
        api_key: Option<&str>,
    ) -> Result<Vec<CollectionInfo>, ApiError> {
        let url = self.endpoint(&["collections", username])?;

        let response = self
            .get(url, &[], api_key, &format!("user {username}"))
            .await?;
        let body: CollectionListResponse = response.json().await?;

        Ok(body
            .data
            .into_iter()
            .filter_map(|raw| {
                let parsed = serde_json::from_value::<Collection>(raw)
                    .map_err(|e| tracing::warn!(error = %e, "skipping malformed collection entry"))
                    .ok()?;
                let id = parsed.id.as_ref().and_then(value_to_id)?;
                Some(CollectionInfo {
                    label: parsed.label.unwrap_or_default(),
                    count: parsed.count.as_ref().and_then(value_to_u64),
                    // API 用 0/1 表示是否公开
                    public: parsed
                        .public
                        .as_ref()
                        .map(|v| v.as_bool().unwrap_or(value_to_u64(v) == Some(1)))
                        .unwrap_or(false),
                    id,
                })
            })
            .collect())
    }
}

/// 把一页原始响应转换为 Page
fn parse_page(body: CollectionPageResponse, requested: PageToken) -> Page {
    let records = body
        .data
        .into_iter()
        .filter_map(|raw| {
            let wallpaper = match serde_json::from_value::<Wallpaper>(raw) {
                Ok(w) => w,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed wallpaper entry");
                    return None;
                }
            };
            let (Some(id), Some(path)) = (wallpaper.id, wallpaper.path) else {
                tracing::warn!("skipping wallpaper entry without id or path");
                return None;
            };
            let extension = extension_for(&path, wallpaper.file_type.as_deref());
            let record = WallpaperRecord::new(id.as_str(), path, extension);
            if record.is_none() {
                tracing::warn!(id = %id, "skipping wallpaper entry with unusable id");
            }
            record
        })
        .collect();

    let meta = body.meta.unwrap_or_default();
    let current = meta
        .current_page
        .as_ref()
        .and_then(value_to_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(requested.page_number());
    let last = meta
        .last_page
        .as_ref()
        .and_then(value_to_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(current);

    let next_page = (current < last).then(|| PageToken::from_page_number(current + 1));

    Page { records, next_page }
}

/// 推断文件扩展名：优先取 URL 后缀，其次 MIME 类型，最后默认 jpg
fn extension_for(path: &str, file_type: Option<&str>) -> String {
    let from_url = path
        .split(['?', '#'])
        .next()
        .and_then(|p| p.rsplit('/').next())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| is_plain_extension(ext));

    if let Some(ext) = from_url {
        return ext;
    }

    match file_type {
        Some("image/png") => "png",
        Some("image/gif") => "gif",
        Some("image/webp") => "webp",
        _ => "jpg",
    }
    .to_string()
}

fn is_plain_extension(ext: &str) -> bool {
    !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

/// 解析 `Retry-After` 头（秒数格式）
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// 数字或数字字符串都接受
fn value_to_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_id(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> WallhavenClient {
        let http = build_http_client(Duration::from_secs(5)).unwrap();
        WallhavenClient::new(http, server.uri())
    }

    fn collection() -> CollectionRef {
        CollectionRef::new("alice", "42")
    }

    #[tokio::test]
    async fn fetch_page_parses_records_and_next_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/alice/42"))
            .and(query_param("page", "1"))
            .and(header("X-API-Key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "94x38z", "path": "https://w.wallhaven.cc/full/94/wallhaven-94x38z.jpg", "file_type": "image/jpeg", "resolution": "3840x2160"},
                    {"id": "k7q1ed", "path": "https://w.wallhaven.cc/full/k7/wallhaven-k7q1ed.png", "file_type": "image/png"}
                ],
                "meta": {"current_page": 1, "last_page": 3, "per_page": 24, "total": 50}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let page = client_for(&server)
            .fetch_page(&collection(), &PageToken::first(), Some("secret"))
            .await
            .unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].id(), "94x38z");
        assert_eq!(page.records[0].file_extension(), "jpg");
        assert_eq!(page.records[1].file_extension(), "png");
        assert_eq!(page.next_page, Some(PageToken::from_page_number(2)));
    }

    #[tokio::test]
    async fn last_page_has_no_next_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/alice/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [],
                "meta": {"current_page": 3, "last_page": 3}
            })))
            .mount(&server)
            .await;

        let page = client_for(&server)
            .fetch_page(&collection(), &PageToken::from_page_number(3), None)
            .await
            .unwrap();

        assert!(page.records.is_empty());
        assert_eq!(page.next_page, None);
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/alice/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "ok1", "path": "https://w.wallhaven.cc/full/ok/wallhaven-ok1.jpg"},
                    {"id": "nopath"},
                    {"path": "https://w.wallhaven.cc/full/xx/wallhaven-noid.jpg"},
                    {"id": 12345, "path": "https://x/y.jpg"},
                    {"id": "../../evil", "path": "https://x/y.jpg"},
                    "not an object",
                    {"id": "ok2", "path": "https://w.wallhaven.cc/full/ok/noext", "file_type": "image/png"}
                ]
            })))
            .mount(&server)
            .await;

        let page = client_for(&server)
            .fetch_page(&collection(), &PageToken::first(), None)
            .await
            .unwrap();

        let ids: Vec<_> = page.records.iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["ok1", "ok2"]);
        assert_eq!(page.records[1].file_extension(), "png");
        // 没有 meta 视为只有一页
        assert_eq!(page.next_page, None);
    }

    #[tokio::test]
    async fn status_codes_map_to_error_taxonomy() {
        let cases = [
            (401, "auth"),
            (403, "auth"),
            (404, "not_found"),
            (500, "transient"),
            (503, "transient"),
            (418, "invalid"),
        ];

        for (status, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let err = client_for(&server)
                .fetch_page(&collection(), &PageToken::first(), Some("k"))
                .await
                .unwrap_err();

            let kind = match err {
                ApiError::Auth { .. } => "auth",
                ApiError::NotFound(_) => "not_found",
                ApiError::Transient(_) => "transient",
                ApiError::InvalidResponse(_) => "invalid",
                ApiError::RateLimited { .. } => "rate_limited",
            };
            assert_eq!(kind, expected, "HTTP {status}");
        }
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch_page(&collection(), &PageToken::first(), None)
            .await
            .unwrap_err();

        match err {
            ApiError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch_page(&collection(), &PageToken::first(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::InvalidResponse(_)), "{err:?}");
    }

    #[tokio::test]
    async fn api_key_is_not_sent_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        client_for(&server)
            .fetch_page(&collection(), &PageToken::first(), None)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("x-api-key"));
    }

    #[tokio::test]
    async fn list_collections_parses_labels_and_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": 15, "label": "Default", "views": 38, "public": 1, "count": 10},
                    {"id": 16, "label": "Space", "public": 0, "count": "3"},
                    {"label": "broken"}
                ]
            })))
            .mount(&server)
            .await;

        let list = client_for(&server)
            .list_collections("alice", None)
            .await
            .unwrap();

        assert_eq!(
            list,
            vec![
                CollectionInfo {
                    id: "15".into(),
                    label: "Default".into(),
                    count: Some(10),
                    public: true,
                },
                CollectionInfo {
                    id: "16".into(),
                    label: "Space".into(),
                    count: Some(3),
                    public: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn path_segments_are_percent_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;
        let client = client_for(&server);

        client.list_collections("a/b?c#d", None).await.unwrap();
        client
            .fetch_page(
                &CollectionRef::new("../x", "1?page=9"),
                &PageToken::first(),
                None,
            )
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url.path(), "/collections/a%2Fb%3Fc%23d");
        assert_eq!(requests[0].url.query(), None);
        assert_eq!(requests[1].url.path(), "/collections/..%2Fx/1%3Fpage=9");
        assert_eq!(requests[1].url.query(), Some("page=1"));
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let http = build_http_client(Duration::from_secs(5)).unwrap();
        let client = WallhavenClient::new(http, "https://wallhaven.cc/api/v1/");
        let url = client.endpoint(&["collections", "alice"]).unwrap();
        assert_eq!(url.as_str(), "https://wallhaven.cc/api/v1/collections/alice");
    }

    #[test]
    fn extension_prefers_url_suffix() {
        assert_eq!(extension_for("https://x/a/b.PNG?x=1", Some("image/jpeg")), "png");
        assert_eq!(extension_for("https://x/a/b", Some("image/webp")), "webp");
        assert_eq!(extension_for("https://x/a/b.we/ird", None), "jpg");
    }
}
