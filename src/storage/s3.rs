use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use std::io::Read;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

use super::{ObjectMeta, ObjectStore, StoreError, StoreErrorCode, validate_key};

/// Per-request timeout for object downloads
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only client for an S3-compatible HTTP endpoint.
///
/// Objects are addressed path-style as `{endpoint}/{bucket}/{key}`; access is
/// anonymous or via a bearer token (presigning gateways, CDN fronts).
pub struct S3LikeObjectStore {
    endpoint: Url,
    bucket: String,
    bearer_token: Option<String>,
    max_bytes: Option<u64>,
    // Built on first use: a blocking client must not be created on the async reactor.
    client: OnceLock<Client>,
}

impl S3LikeObjectStore {
    pub fn new(endpoint: &str, bucket: impl Into<String>) -> Result<Self, StoreError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| StoreError::new(StoreErrorCode::Validation, format!("endpoint: {}", e)))?;
        match endpoint.scheme() {
            "http" | "https" => {}
            other => {
                return Err(StoreError::new(
                    StoreErrorCode::Validation,
                    format!("unsupported endpoint scheme: {}", other),
                ));
            }
        }
        Ok(Self {
            endpoint,
            bucket: bucket.into(),
            bearer_token: None,
            max_bytes: None,
            client: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|t| !t.is_empty());
        self
    }

    /// Refuse bodies larger than `limit` without buffering them.
    #[must_use]
    pub fn with_max_bytes(mut self, limit: u64) -> Self {
        self.max_bytes = Some(limit);
        self
    }

    pub fn object_url(&self, key: &str) -> Result<Url, StoreError> {
        validate_key(key)?;
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                StoreError::new(StoreErrorCode::Validation, "endpoint cannot be a base URL")
            })?;
            segments.pop_if_empty().push(&self.bucket);
            segments.extend(key.split('/'));
        }
        Ok(url)
    }

    fn client(&self) -> Result<&Client, StoreError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StoreError::new(StoreErrorCode::Network, e.to_string()))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn send(&self, method: reqwest::Method, key: &str) -> Result<Response, StoreError> {
        let url = self.object_url(key)?;
        let mut req = self.client()?.request(method, url);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        req.send()
            .map_err(|e| StoreError::new(StoreErrorCode::Network, e.to_string()))
    }
}

/// Read a response body, stopping one byte past `limit`.
fn read_capped(
    key: &str,
    declared: Option<u64>,
    body: impl Read,
    limit: Option<u64>,
) -> Result<Vec<u8>, StoreError> {
    if let (Some(size), Some(limit)) = (declared, limit)
        && size > limit
    {
        return Err(StoreError::too_large(key, size, limit));
    }
    let cap = limit.map_or(u64::MAX, |limit| limit.saturating_add(1));
    let mut bytes = Vec::new();
    body.take(cap)
        .read_to_end(&mut bytes)
        .map_err(|e| StoreError::new(StoreErrorCode::Network, e.to_string()))?;
    if let Some(limit) = limit
        && bytes.len() as u64 > limit
    {
        return Err(StoreError::too_large(key, bytes.len() as u64, limit));
    }
    Ok(bytes)
}

/// Map a non-success status to a store error
fn status_error(key: &str, status: StatusCode) -> StoreError {
    let code = if status == StatusCode::NOT_FOUND {
        StoreErrorCode::NotFound
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StoreErrorCode::Network
    } else {
        StoreErrorCode::Rejected
    };
    StoreError::new(code, format!("{} returned {}", key, status))
}

impl ObjectStore for S3LikeObjectStore {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    fn bucket(&self) -> String {
        self.bucket.clone()
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let resp = self.send(reqwest::Method::HEAD, key)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(key, status));
        }
        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        Ok(Some(ObjectMeta {
            key: key.to_string(),
            size,
        }))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let started = Instant::now();
        let resp = self.send(reqwest::Method::GET, key)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(key, status));
        }
        let declared = resp.content_length();
        let bytes = read_capped(key, declared, resp, self.max_bytes)?;
        debug!(
            key = %key,
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "downloaded object"
        );
        Ok(bytes)
    }
}
