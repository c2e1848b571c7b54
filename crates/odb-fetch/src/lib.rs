//! URL fetcher: bounded HTTP GET + visible-text extraction.
//!
//! Every failure degrades to a short explanatory string, so the result is always usable as
//! prompt material.

pub mod extract;

use std::time::Duration;

use async_trait::async_trait;
use odb_core::{errors::Error, model::client::ContentFetcher, Result};

use extract::{truncate_chars, visible_text};

#[derive(Clone, Copy, Debug)]
pub struct FetchLimits {
    /// Cap on extracted text, in characters.
    pub max_chars: usize,
    /// Cap on the raw body, in bytes.
    pub max_bytes: usize,
    pub max_redirects: usize,
    pub timeout: Duration,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_chars: 4000,
            max_bytes: 2_000_000,
            max_redirects: 3,
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UrlFetcher {
    limits: FetchLimits,
    http: reqwest::Client,
}

/// Raw body plus whether the byte cap cut it short.
struct Body {
    bytes: Vec<u8>,
    cut: bool,
}

impl UrlFetcher {
    pub fn new(limits: FetchLimits) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(limits.timeout)
            .redirect(reqwest::redirect::Policy::limited(limits.max_redirects))
            .user_agent(concat!("odb/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::External(format!("http client build failed: {e}")))?;
        Ok(Self { limits, http })
    }

    async fn fetch_body(&self, url: &str) -> std::result::Result<Body, reqwest::Error> {
        let mut resp = self.http.get(url).send().await?.error_for_status()?;

        let mut bytes = Vec::new();
        let mut cut = false;
        while let Some(chunk) = resp.chunk().await? {
            let room = self.limits.max_bytes - bytes.len();
            if chunk.len() > room {
                bytes.extend_from_slice(&chunk[..room]);
                trim_partial_char(&mut bytes);
                cut = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(Body { bytes, cut })
    }
}

/// Drop a multi-byte character left incomplete by the byte cap.
fn trim_partial_char(bytes: &mut Vec<u8>) {
    // Back up to the start of the last character (at most 3 continuation bytes).
    let mut start = bytes.len().saturating_sub(1);
    while start > 0 && bytes.len() - start < 4 && bytes[start] & 0xC0 == 0x80 {
        start -= 1;
    }
    if let Err(e) = std::str::from_utf8(&bytes[start..]) {
        // `error_len() == None` means the input ended mid-character.
        if e.error_len().is_none() {
            bytes.truncate(start + e.valid_up_to());
        }
    }
}

#[async_trait]
impl ContentFetcher for UrlFetcher {
    async fn fetch_text(&self, url: &str) -> String {
        let body = match self.fetch_body(url).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(url, error = %e, "url fetch failed");
                return format!("(failed to fetch URL: {e})");
            }
        };

        let html = String::from_utf8_lossy(&body.bytes);
        let mut text = visible_text(&html);
        if body.cut {
            tracing::info!(url, max_bytes = self.limits.max_bytes, "response body cut");
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&format!(
                "...(cut: body exceeded {} bytes)",
                self.limits.max_bytes
            ));
        }
        truncate_chars(&text, self.limits.max_chars)
    }
}
