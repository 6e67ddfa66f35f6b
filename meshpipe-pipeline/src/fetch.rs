//! Remote asset download with retry

use crate::error::{FetchError, Result};
use meshpipe_core::Clock;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Bytes returned by a [`Fetcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAsset {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Single download attempt
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &Url) -> std::result::Result<FetchedAsset, FetchError>;
}

/// Map an HTTP error status to its fetch error kind
pub fn status_error(url: &Url, status: u16) -> FetchError {
    let url = url.to_string();
    match status {
        403 => FetchError::AuthExpired { url },
        404 => FetchError::NotFound { url },
        429 | 503 => FetchError::RateLimited { url, status },
        _ => FetchError::Http { url, status },
    }
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("meshpipe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| crate::error::PipelineError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn transport_error(url: &Url, error: &reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout { url: url.to_string() }
        } else {
            FetchError::Connection {
                url: url.to_string(),
                message: error.to_string(),
            }
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &Url) -> std::result::Result<FetchedAsset, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| Self::transport_error(url, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .map_err(|e| Self::transport_error(url, &e))?
            .to_vec();
        Ok(FetchedAsset { bytes, content_type })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_secs(2),
        }
    }
}

pub fn parse_url(raw: &str) -> std::result::Result<Url, FetchError> {
    let url = Url::parse(raw).map_err(|e| FetchError::InvalidUrl {
        url: raw.to_string(),
        message: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FetchError::InvalidUrl {
            url: raw.to_string(),
            message: format!("unsupported scheme {other}"),
        }),
    }
}

/// Fetch `url`, retrying transient failures with growing delays.
///
/// Not-found and unknown HTTP errors fail on the first attempt.
pub fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    url: &Url,
    policy: RetryPolicy,
    clock: &dyn Clock,
) -> std::result::Result<FetchedAsset, FetchError> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 1;
    loop {
        match fetcher.fetch(url) {
            Ok(asset) => return Ok(asset),
            Err(error) => {
                let factor = match error.backoff_factor() {
                    Some(factor) if attempt < attempts => factor,
                    _ => return Err(error),
                };
                warn!(
                    %url,
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Download failed, retrying"
                );
                clock.sleep(delay);
                delay = delay.mul_f64(factor);
                attempt += 1;
            }
        }
    }
}

/// Extension for a response without one in its URL path
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    match mime.as_str() {
        "model/gltf-binary" => Some("glb"),
        "model/gltf+json" => Some("gltf"),
        "model/obj" | "text/plain" => Some("obj"),
        "model/mtl" => Some("mtl"),
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        _ => None,
    }
}

/// Local file name for a downloaded asset: the last URL path segment with
/// query parameters dropped
pub fn file_name_for(url: &Url, content_type: Option<&str>) -> String {
    let base = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string();
    if Path::new(&base).extension().is_some() {
        return base;
    }
    match content_type.and_then(extension_for_content_type) {
        Some(ext) => format!("{base}.{ext}"),
        None => base,
    }
}

/// Download `raw` into `dir` and return the written path
pub fn download_to(
    fetcher: &dyn Fetcher,
    raw: &str,
    dir: &Path,
    policy: RetryPolicy,
    clock: &dyn Clock,
) -> Result<PathBuf> {
    let url = parse_url(raw)?;
    let asset = fetch_with_retry(fetcher, &url, policy, clock)?;
    let path = dir.join(file_name_for(&url, asset.content_type.as_deref()));
    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, &asset.bytes)?;
    info!(%url, path = %path.display(), bytes = asset.bytes.len(), "Downloaded asset");
    Ok(path)
}
