//! Code fetch — resolves a skill locator to the exact bytes that will be
//! fingerprinted, displayed, and executed.
//!
//! Two schemes are supported: `http(s)` (HTTPS required except for loopback
//! hosts, bounded body size) and `data:` URIs (base64 or percent-encoded).
//! Whatever is fetched here is pinned into the store; nothing downstream
//! ever re-fetches.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use reqwest::Client;
use tracing::info;

/// Maximum skill code size: 1 MB.
const MAX_CODE_SIZE: usize = 1024 * 1024;

/// HTTP read timeout in seconds.
const READ_TIMEOUT_SECS: u64 = 30;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug)]
pub enum FetchError {
    /// The locator did not parse or uses a refused scheme.
    BadLocator(String),
    /// The HTTP request failed or returned a non-success status.
    Upstream(String),
    /// The body exceeded [`MAX_CODE_SIZE`].
    TooLarge(usize),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadLocator(e) => write!(f, "bad skill locator: {e}"),
            Self::Upstream(e) => write!(f, "code fetch failed: {e}"),
            Self::TooLarge(n) => write!(f, "code too large: {n} bytes (max {MAX_CODE_SIZE})"),
        }
    }
}

impl std::error::Error for FetchError {}

pub struct CodeFetcher {
    client: Client,
}

impl CodeFetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// Fetches the code bytes behind `locator`.
    pub async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(rest) = locator.strip_prefix("data:") {
            return decode_data_uri(rest);
        }

        let parsed =
            url::Url::parse(locator).map_err(|e| FetchError::BadLocator(e.to_string()))?;
        let host = parsed.host_str().unwrap_or("");
        let is_local = host == "localhost" || host == "127.0.0.1" || host == "::1";
        match parsed.scheme() {
            "https" => {}
            "http" if is_local => {}
            other => {
                return Err(FetchError::BadLocator(format!(
                    "scheme '{other}' not allowed (https, http to loopback, or data:)"
                )))
            }
        }

        info!("Fetching skill code from {locator}");
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| FetchError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Upstream(format!("HTTP {}", response.status())));
        }
        if let Some(len) = response.content_length() {
            if len as usize > MAX_CODE_SIZE {
                return Err(FetchError::TooLarge(len as usize));
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Upstream(e.to_string()))?;
        if bytes.len() > MAX_CODE_SIZE {
            return Err(FetchError::TooLarge(bytes.len()));
        }
        Ok(bytes.to_vec())
    }
}

impl Default for CodeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes the part of a `data:` URI after the scheme:
/// `[<mediatype>][;base64],<payload>`.
fn decode_data_uri(rest: &str) -> Result<Vec<u8>, FetchError> {
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| FetchError::BadLocator("data: URI missing ','".to_string()))?;
    let bytes = if header.ends_with(";base64") || header == "base64" {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| FetchError::BadLocator(format!("bad base64 payload: {e}")))?
    } else {
        percent_decode(payload)?
    };
    if bytes.len() > MAX_CODE_SIZE {
        return Err(FetchError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Minimal percent decoding for `data:` payloads. `+` is literal per
/// RFC 2397 (this is not form encoding).
fn percent_decode(s: &str) -> Result<Vec<u8>, FetchError> {
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next();
            let lo = bytes.next();
            let (Some(hi), Some(lo)) = (hi, lo) else {
                return Err(FetchError::BadLocator("truncated percent escape".to_string()));
            };
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| FetchError::BadLocator("bad percent escape".to_string()))?;
            out.push(hex);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}
