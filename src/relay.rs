use std::io;

use axum::body::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use reqwest::header::{
    CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, REFERER, USER_AGENT,
};
use thiserror::Error;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use crate::normalize::IMAGE_SLIDER;

pub const RELAY_CHUNK_SIZE: usize = 4096;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
// The media CDN rejects hot-linked requests without a same-site referer.
pub const UPSTREAM_REFERER: &str = "https://www.douyin.com/";

const IMAGE_EXTENSIONS: [&str; 4] = [".jpg", ".jpeg", ".png", ".webp"];

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("image albums cannot be relayed as a single file")]
    UnsupportedContent,
    #[error("outbound fetch failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("image conversion failed: {0}")]
    Conversion(String),
}

/// Value of the `Sec-Fetch-Dest` header sent with an outbound media fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDest {
    Video,
    Image,
    Audio,
}

impl FetchDest {
    pub fn for_filename(filename: &str) -> Self {
        let lower = filename.to_lowercase();
        if IMAGE_EXTENSIONS.iter().any(|ext| lower.contains(ext)) {
            Self::Image
        } else if lower.contains(".mp3") {
            Self::Audio
        } else {
            Self::Video
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Image => "image",
            Self::Audio => "audio",
        }
    }
}

pub fn browser_headers(dest: FetchDest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(REFERER, HeaderValue::from_static(UPSTREAM_REFERER));
    headers.insert(
        HeaderName::from_static("sec-fetch-dest"),
        HeaderValue::from_static(dest.as_str()),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("cors"),
    );
    headers
}

pub struct RelayedMedia {
    pub content_type: Option<String>,
    pub content_disposition: String,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

/// Streams `source_url` back to the caller in chunks of at most
/// [`RELAY_CHUNK_SIZE`] bytes. One attempt; timeouts come from `client`.
pub async fn relay(
    client: &reqwest::Client,
    source_url: &str,
    filename: &str,
) -> Result<RelayedMedia, RelayError> {
    if source_url == IMAGE_SLIDER {
        return Err(RelayError::UnsupportedContent);
    }

    let dest = FetchDest::for_filename(filename);
    debug!("Relaying {:?} as {} ({})", source_url, filename, dest.as_str());

    let response = client
        .get(source_url)
        .headers(browser_headers(dest))
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(RelayError::Transport)?;

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);

    let reader = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
    let body = ReaderStream::with_capacity(reader, RELAY_CHUNK_SIZE).boxed();

    Ok(RelayedMedia {
        content_type,
        content_disposition: build_content_disposition(filename),
        body,
    })
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

pub fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}
