use chrono::DateTime;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::document::{Doc, Extract, ExtractionError};

/// Marks an album post that has no single playable video. The client renders
/// a slider for it and the relay refuses to download it.
pub const IMAGE_SLIDER: &str = "IMAGE_SLIDER";

pub const PLACEHOLDER_COVER: &str = "https://placehold.co/300x400/png?text=No+Preview";

const DETAIL_KEY: &str = "aweme_detail";
const COVER_FIELDS: [&str; 3] = ["cover", "dynamic_cover", "origin_cover"];
const UNRENDERABLE_IMAGE_FORMATS: [&str; 2] = [".heic", ".heif"];
const DEFAULT_DESCRIPTION: &str = "No title";
const DEFAULT_AUTHOR: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaRecord {
    pub id: Option<String>,
    pub desc: String,
    pub author: String,
    pub cover: String,
    pub video_url: String,
    pub music_url: String,
    pub date: String,
    pub share_url: String,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
}

/// Turns one raw upstream item into a [`MediaRecord`].
///
/// Returns `None` when the item does not have the expected shape; the reason
/// is logged and never propagated.
pub fn normalize(raw: &Value) -> Option<MediaRecord> {
    match extract(raw) {
        Ok(record) => Some(record),
        Err(error) => {
            warn!("Could not extract a media record from upstream item: {error}");
            None
        }
    }
}

fn extract(raw: &Value) -> Extract<MediaRecord> {
    let mut item = Doc::new(raw)?;
    if let Some(detail) = item.object(DETAIL_KEY)? {
        item = detail;
    }

    let video = item
        .object("video")?
        .ok_or(ExtractionError::Missing("video"))?;
    let images = item.array("images")?;

    let cover = select_cover(images.first(), video)?
        .unwrap_or(PLACEHOLDER_COVER)
        .to_string();

    let video_url = match video.object("play_addr")? {
        Some(play_addr) => play_addr.first_url()?,
        None => None,
    };
    let video_url = match video_url {
        Some(url) => url.to_string(),
        None if !images.is_empty() => IMAGE_SLIDER.to_string(),
        None => String::new(),
    };

    let music_url = match item.object_or_empty("music")?.object("play_url")? {
        Some(play_url) => play_url.first_url()?.unwrap_or_default().to_string(),
        None => String::new(),
    };

    let statistics = item.object_or_empty("statistics")?;

    Ok(MediaRecord {
        id: item.identifier("aweme_id")?,
        desc: item.str_or("desc", DEFAULT_DESCRIPTION)?,
        author: item
            .object_or_empty("author")?
            .str_or("nickname", DEFAULT_AUTHOR)?,
        cover,
        video_url,
        music_url,
        date: format_date(item.i64_or("create_time", 0)?)?,
        share_url: item.str_or("share_url", "")?,
        likes: statistics.u64_or("digg_count", 0)?,
        comments: statistics.u64_or("comment_count", 0)?,
        shares: statistics.u64_or("share_count", 0)?,
    })
}

/// Picks the first browser-renderable cover URL. An album's first image
/// outranks every field of the video object, and within one source the URL
/// list order decides.
fn select_cover<'a>(album_first: Option<&'a Value>, video: Doc<'a>) -> Extract<Option<&'a str>> {
    let mut candidates = Vec::with_capacity(COVER_FIELDS.len() + 1);
    if let Some(first_image) = album_first {
        candidates.extend(Doc::optional(first_image, "images[0]")?);
    }
    for field in COVER_FIELDS {
        candidates.extend(video.object(field)?);
    }

    for candidate in candidates {
        for url in candidate.url_list()? {
            if is_browser_renderable(url) {
                return Ok(Some(url));
            }
        }
    }

    Ok(None)
}

fn is_browser_renderable(url: &str) -> bool {
    let lower = url.to_lowercase();
    !UNRENDERABLE_IMAGE_FORMATS
        .iter()
        .any(|format| lower.contains(format))
}

fn format_date(epoch_seconds: i64) -> Extract<String> {
    DateTime::from_timestamp(epoch_seconds, 0)
        .map(|timestamp| timestamp.format("%Y-%m-%d").to_string())
        .ok_or(ExtractionError::Timestamp(epoch_seconds))
}
