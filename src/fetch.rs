//! Conditional HTTP GET with `ETag` / `Last-Modified` revalidation and request throttling.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use crate::error::HttpStatusError;

pub const ACCEPT_GITHUB_JSON: &str = "application/vnd.github+json";
pub const ACCEPT_OCTET_STREAM: &str = "application/octet-stream";

/// Revalidation data for one URL, persisted in `releases.json` / `assets.json`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchCache {
    #[serde(rename = "ETag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(rename = "Last-Modified", default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(rename = "last-request", default, skip_serializing_if = "Option::is_none")]
    pub last_request: Option<DateTime<Utc>>,
    /// Response body for metadata fetches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// For asset downloads: the release the downloaded file belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}

/// Result of [`Fetcher::fetch_if_newer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Updated,
    NotModified,
}

/// Where the body of a successful response goes.
#[derive(Debug, Clone, Copy)]
pub enum FetchTarget<'a> {
    /// Parsed and stored in [`FetchCache::data`].
    Data,
    /// Streamed to this file.
    File(&'a Path),
}

/// A response as seen by the fetch layer. Header names are lower case.
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Performs blocking GET requests.
pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse>;
}

/// [`HttpClient`] backed by `reqwest`.
pub struct ReqwestClient {
    client: Client,
    token: Option<String>,
}

impl ReqwestClient {
    /// Creates a client. `GITHUB_TOKEN`, if set, is sent as bearer token.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("getrel/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Could not create HTTP client")?;
        let token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        Ok(Self { client, token })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().with_context(|| format!("GET {url} failed"))?;
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        Ok(HttpResponse {
            status: response.status().as_u16(),
            headers,
            body: Box::new(response),
        })
    }
}

/// Issues conditional requests and keeps the throttles.
#[derive(Clone)]
pub struct Fetcher {
    client: Arc<dyn HttpClient>,
    /// Minimum time since the last request for the same URL.
    pub fetch_delay: TimeDelta,
    /// Minimum age of the cached `Last-Modified` before asking again.
    pub update_delay: TimeDelta,
}

impl Fetcher {
    pub fn new(
        client: Arc<dyn HttpClient>,
        fetch_delay: TimeDelta,
        update_delay: TimeDelta,
    ) -> Self {
        Self { client, fetch_delay, update_delay }
    }

    /// Retrieves `url` unless it is too early to ask or the server says it has not changed.
    ///
    /// Throttled calls return [`FetchOutcome::NotModified`] without network access. A
    /// download to a file that does not exist (anymore) is never throttled and sent
    /// without revalidation headers. `cache.last_request` is stamped on every request
    /// actually sent, whatever its outcome.
    ///
    /// # Errors
    /// Transport failures and statuses other than 2xx / 304 ([`HttpStatusError`]).
    pub fn fetch_if_newer(
        &self,
        url: &str,
        cache: &mut FetchCache,
        target: FetchTarget<'_>,
        accept: Option<&str>,
    ) -> Result<FetchOutcome> {
        let now = Utc::now();
        let have_copy = match target {
            FetchTarget::Data => true,
            FetchTarget::File(path) => path.exists(),
        };

        if have_copy {
            if let Some(last_request) = cache.last_request {
                let ago = now - last_request;
                if ago < self.fetch_delay {
                    debug!(
                        "Not fetching {url}, last request was {ago} ago (< {})",
                        self.fetch_delay
                    );
                    return Ok(FetchOutcome::NotModified);
                }
            }
            if let Some(modified) = cache.last_modified.as_deref().and_then(parse_http_date) {
                let age = now - modified;
                if age < self.update_delay {
                    debug!("Not fetching {url}, last modified {age} ago (< {})", self.update_delay);
                    return Ok(FetchOutcome::NotModified);
                }
            }
        }

        let mut headers = Vec::new();
        if let Some(accept) = accept {
            headers.push(("Accept".to_string(), accept.to_string()));
        }
        if have_copy {
            if let Some(etag) = &cache.etag {
                headers.push(("If-None-Match".to_string(), etag.clone()));
            }
            if let Some(modified) = &cache.last_modified {
                headers.push(("If-Modified-Since".to_string(), modified.clone()));
            }
        }

        let response = self.client.get(url, &headers);
        cache.last_request = Some(now);
        let mut response = response?;

        if response.status == 304 {
            debug!("{url}: Not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if !(200..300).contains(&response.status) {
            return Err(HttpStatusError { url: url.to_string(), status: response.status }.into());
        }

        if let Some(etag) = response.header("etag") {
            cache.etag = Some(etag.to_string());
        }
        if let Some(modified) = response.header("last-modified") {
            cache.last_modified = Some(modified.to_string());
        }

        match target {
            FetchTarget::File(path) => {
                debug!("{url}: Downloading to {}", path.display());
                download_to(&mut response.body, path)?;
            }
            FetchTarget::Data => {
                debug!("{url}: Downloading data to cache");
                let mut bytes = Vec::new();
                response
                    .body
                    .read_to_end(&mut bytes)
                    .with_context(|| format!("Failed to read response from {url}"))?;
                cache.data = Some(decode_body(bytes));
            }
        }
        Ok(FetchOutcome::Updated)
    }
}

/// JSON if possible, otherwise the text, otherwise the raw bytes.
fn decode_body(bytes: Vec<u8>) -> Value {
    if let Ok(value) = serde_json::from_slice(&bytes) {
        return value;
    }
    match String::from_utf8(bytes) {
        Ok(text) => Value::String(text),
        Err(e) => Value::Array(e.into_bytes().into_iter().map(Value::from).collect()),
    }
}

/// Streams `body` into a temporary file next to `path`, then moves it into place.
fn download_to(body: &mut dyn Read, path: &Path) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in {}", parent.display()))?;
    let size = std::io::copy(body, &mut temp_file)
        .with_context(|| format!("Failed to download {}", path.display()))?;
    temp_file.as_file().sync_all()?;
    temp_file
        .persist(path)
        .with_context(|| format!("Failed to move download to {}", path.display()))?;
    debug!("Downloaded {} ({size} bytes)", path.display());
    Ok(())
}

/// Parses an HTTP date such as `Wed, 21 Oct 2015 07:28:00 GMT`.
pub fn parse_http_date(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(text).ok().map(|date| date.with_timezone(&Utc))
}
