//! Remote repository service access
//!
//! [`RemoteSource`] is the seam between the transfer engine and the hub:
//! a cheap metadata query plus a ranged body stream. [`HfRemote`] speaks
//! Hugging Face Hub `resolve` URLs over `reqwest`.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode, redirect};
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Plain redirects followed while resolving metadata
const MAX_METADATA_REDIRECTS: usize = 5;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Address of one file in a hub repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub repo: String,
    pub file: String,
    pub revision: String,
}

impl RemoteFile {
    pub fn new(repo: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            file: file.into(),
            revision: "main".to_string(),
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }
}

/// What the hub advertises about a file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteMetadata {
    pub size: u64,
    pub validator: Option<String>,
    /// Content checksum, when the hub exposes one
    pub sha256: Option<String>,
}

/// A response body positioned at `offset`
pub struct RemoteBody {
    /// Where the stream starts; 0 when the server ignored the range
    pub offset: u64,
    pub stream: BoxStream<'static, Result<Vec<u8>, TransportError>>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying (connection reset, timeout, 5xx, 429)
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help (404, 401, 403)
    #[error("{0}")]
    Permanent(String),

    /// The server refused the requested byte range
    #[error("range not satisfiable")]
    RangeRejected,
}

/// Trait for fetching files from a remote repository
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Size and validator, without transferring the body
    async fn metadata(&self, file: &RemoteFile) -> Result<RemoteMetadata, TransportError>;

    /// Open the body at `offset`. `validator` lets the server restart from
    /// zero when the resource changed since the partial was written.
    async fn open(
        &self,
        file: &RemoteFile,
        offset: u64,
        validator: Option<&str>,
    ) -> Result<RemoteBody, TransportError>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Hugging Face Hub client
pub struct HfRemote {
    endpoint: String,
    token: Option<String>,
    /// Metadata client: redirects off so `x-linked-*` headers stay visible
    head_client: Client,
    client: Client,
}

impl HfRemote {
    /// Build from the environment (`HF_ENDPOINT`, `HF_TOKEN`, token cache)
    pub fn from_env() -> Result<Self, TransportError> {
        let endpoint = std::env::var("HF_ENDPOINT")
            .ok()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Self::new(endpoint, resolve_token())
    }

    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self, TransportError> {
        let user_agent = concat!("swap-manager/", env!("CARGO_PKG_VERSION"));
        let head_client = Client::builder()
            .user_agent(user_agent)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| TransportError::Permanent(format!("failed to create HTTP client: {}", e)))?;
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Permanent(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            head_client,
            client,
        })
    }

    pub fn url(&self, file: &RemoteFile) -> String {
        let path: Vec<String> = file
            .file
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect();
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint,
            file.repo,
            urlencoding::encode(&file.revision),
            path.join("/")
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

/// Hub token from `HF_TOKEN`, else the local token cache
fn resolve_token() -> Option<String> {
    std::env::var("HF_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| hf_hub::Cache::from_env().token())
}

fn classify_status(status: StatusCode, file: &RemoteFile) -> TransportError {
    match status {
        StatusCode::NOT_FOUND => TransportError::Permanent(format!(
            "{} not found in {} (revision {})",
            file.file, file.repo, file.revision
        )),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Permanent(format!(
            "access to {} denied ({}); set HF_TOKEN for gated repositories",
            file.repo, status
        )),
        StatusCode::RANGE_NOT_SATISFIABLE => TransportError::RangeRejected,
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            TransportError::Transient(format!("server returned {}", s))
        }
        s => TransportError::Permanent(format!("unexpected status {}", s)),
    }
}

fn request_error(e: reqwest::Error) -> TransportError {
    TransportError::Transient(e.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Strip weak markers and quotes from an entity tag
pub fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_start_matches("W/").trim_matches('"').to_string()
}

fn has_linked_metadata(headers: &HeaderMap) -> bool {
    headers.contains_key("x-linked-size") || headers.contains_key("x-linked-etag")
}

/// `Location` of a redirect, resolved against the requested URL
fn redirect_target(base: &reqwest::Url, headers: &HeaderMap) -> Option<reqwest::Url> {
    header_str(headers, header::LOCATION.as_str()).and_then(|loc| base.join(loc).ok())
}

fn is_sha256(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Extract size, validator and checksum from hub response headers
pub fn parse_metadata(headers: &HeaderMap) -> Option<RemoteMetadata> {
    let validator = header_str(headers, "x-linked-etag")
        .or_else(|| header_str(headers, header::ETAG.as_str()))
        .map(normalize_etag)
        .filter(|v| !v.is_empty());
    let size = header_str(headers, "x-linked-size")
        .or_else(|| header_str(headers, header::CONTENT_LENGTH.as_str()))
        .and_then(|v| v.trim().parse::<u64>().ok())?;
    let sha256 = validator
        .as_deref()
        .filter(|v| is_sha256(v))
        .map(str::to_lowercase);

    Some(RemoteMetadata {
        size,
        validator,
        sha256,
    })
}

#[async_trait]
impl RemoteSource for HfRemote {
    async fn metadata(&self, file: &RemoteFile) -> Result<RemoteMetadata, TransportError> {
        let mut url = reqwest::Url::parse(&self.url(file))
            .map_err(|e| TransportError::Permanent(format!("invalid hub URL: {}", e)))?;

        for _ in 0..=MAX_METADATA_REDIRECTS {
            tracing::debug!(url = %url, "Querying remote metadata");
            let response = self
                .authorize(self.head_client.head(url.clone()))
                .send()
                .await
                .map_err(request_error)?;

            let status = response.status();
            if status.is_redirection() && !has_linked_metadata(response.headers()) {
                // Renamed repositories answer with a plain redirect; its own
                // Content-Length describes the redirect, not the file
                url = redirect_target(&url, response.headers()).ok_or_else(|| {
                    TransportError::Permanent(format!(
                        "hub redirected {} without a location",
                        file.file
                    ))
                })?;
                continue;
            }
            if !(status.is_success() || status.is_redirection()) {
                return Err(classify_status(status, file));
            }

            return parse_metadata(response.headers()).ok_or_else(|| {
                TransportError::Permanent(format!("hub did not report a size for {}", file.file))
            });
        }

        Err(TransportError::Permanent(format!(
            "too many redirects resolving {}",
            file.file
        )))
    }

    async fn open(
        &self,
        file: &RemoteFile,
        offset: u64,
        validator: Option<&str>,
    ) -> Result<RemoteBody, TransportError> {
        let url = self.url(file);
        let mut req = self.authorize(self.client.get(&url));
        if offset > 0 {
            req = req.header(header::RANGE, format!("bytes={}-", offset));
            if let Some(validator) = validator {
                req = req.header(header::IF_RANGE, format!("\"{}\"", validator));
            }
        }

        let response = req.send().await.map_err(request_error)?;
        let start = match response.status() {
            StatusCode::PARTIAL_CONTENT => offset,
            StatusCode::OK => 0,
            status => return Err(classify_status(status, file)),
        };

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(request_error))
            .boxed();

        Ok(RemoteBody {
            offset: start,
            stream,
        })
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_url_encodes_file_segments() {
        let remote = HfRemote::new("https://hub.example/", None).unwrap();
        let file = RemoteFile::new("owner/repo", "sub dir/model Q4.gguf");
        assert_eq!(
            remote.url(&file),
            "https://hub.example/owner/repo/resolve/main/sub%20dir/model%20Q4.gguf"
        );
    }

    #[test]
    fn test_parse_lfs_metadata() {
        let sha = "a".repeat(64);
        let mut headers = HeaderMap::new();
        headers.insert("x-linked-etag", HeaderValue::from_str(&format!("\"{}\"", sha)).unwrap());
        headers.insert("x-linked-size", HeaderValue::from_static("5000"));
        headers.insert(header::ETAG, HeaderValue::from_static("W/\"other\""));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("1111"));

        let meta = parse_metadata(&headers).unwrap();
        assert_eq!(meta.size, 5000);
        assert_eq!(meta.validator.as_deref(), Some(sha.as_str()));
        assert_eq!(meta.sha256.as_deref(), Some(sha.as_str()));
    }

    #[test]
    fn test_parse_plain_metadata() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, HeaderValue::from_static("W/\"abc-123\""));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));

        let meta = parse_metadata(&headers).unwrap();
        assert_eq!(meta.size, 42);
        assert_eq!(meta.validator.as_deref(), Some("abc-123"));
        assert!(meta.sha256.is_none());

        assert!(parse_metadata(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_redirect_target_resolves_relative_location() {
        let base = reqwest::Url::parse("https://hub.example/old/repo/resolve/main/f.gguf").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LOCATION,
            HeaderValue::from_static("/new/repo/resolve/main/f.gguf"),
        );
        assert!(!has_linked_metadata(&headers));
        assert_eq!(
            redirect_target(&base, &headers).unwrap().as_str(),
            "https://hub.example/new/repo/resolve/main/f.gguf"
        );

        headers.insert("x-linked-size", HeaderValue::from_static("10"));
        assert!(has_linked_metadata(&headers));
        assert!(redirect_target(&base, &HeaderMap::new()).is_none());
    }

    #[test]
    fn test_status_classification() {
        let file = RemoteFile::new("o/r", "f.gguf");
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, &file),
            TransportError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &file),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &file),
            TransportError::Transient(_)
        ));
        assert_eq!(
            classify_status(StatusCode::RANGE_NOT_SATISFIABLE, &file),
            TransportError::RangeRejected
        );
    }
}
