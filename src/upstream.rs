use std::time::Duration;

use reqwest::{
    StatusCode,
    header::{CONTENT_TYPE, USER_AGENT},
};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::{Credential, non_empty};

pub const DEFAULT_BASE_URL: &str = "https://api.tikhub.io";

pub(crate) const SINGLE_VIDEO_PATH: &str = "/api/v1/douyin/app/v3/fetch_one_video_by_share_url";
pub(crate) const SEC_USER_ID_PATH: &str = "/api/v1/douyin/web/get_sec_user_id";
pub(crate) const USER_POSTS_PATH: &str = "/api/v1/douyin/app/v3/fetch_user_post_videos";
const USER_INFO_PATH: &str = "/api/v1/tikhub/user/get_user_info";
const USER_PAGE_SIZE: u32 = 20;
const KEY_CHECK_TIMEOUT_SECONDS: u64 = 10;
const CLIENT_USER_AGENT: &str = concat!("douyin-relay/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no API key is configured")]
    MissingCredential,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("responded with HTTP {0}")]
    Status(StatusCode),
}

/// Opaque pagination token. The listing API returns it as a number that can
/// exceed what a JavaScript client represents exactly, so it always leaves
/// this process as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self("0".to_string())
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawCursor {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match RawCursor::deserialize(deserializer)? {
            RawCursor::Text(text) => match non_empty(&text) {
                Some(text) => Self(text.to_string()),
                None => Self::default(),
            },
            RawCursor::Number(number) => Self(number.to_string()),
        })
    }
}

#[derive(Debug, Default)]
pub struct UserPage {
    pub items: Vec<Value>,
    pub has_more: bool,
    pub max_cursor: Cursor,
}

#[derive(Debug)]
pub enum KeyCheck {
    Valid(Value),
    Rejected(String),
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct UserPostsData {
    aweme_list: Option<Vec<Value>>,
    has_more: Option<Value>,
    max_cursor: Option<Cursor>,
}

#[derive(Clone)]
pub struct TikHubClient {
    http: reqwest::Client,
    base_url: String,
    credential: Credential,
}

impl TikHubClient {
    pub fn new(http: reqwest::Client, base_url: &str, credential: Credential) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn authorized_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Envelope<T>, UpstreamError> {
        let token = self
            .credential
            .current()
            .await
            .ok_or(UpstreamError::MissingCredential)?;

        debug!("Calling aggregation API {path}");
        let response = self
            .http
            .get(self.endpoint(path))
            .bearer_auth(token)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header(CONTENT_TYPE, "application/json")
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status()));
        }

        Ok(response.json().await?)
    }

    /// Raw item for one share link; an absent `data` member reads as an
    /// empty document so the normalizer decides what is missing.
    pub async fn fetch_one_video(&self, share_url: &str) -> Result<Value, UpstreamError> {
        let envelope = self
            .authorized_get::<Value>(SINGLE_VIDEO_PATH, &[("share_url", share_url)])
            .await?;
        Ok(envelope.data.unwrap_or_else(|| Value::Object(Map::new())))
    }

    pub async fn get_sec_user_id(&self, profile_url: &str) -> Result<Option<String>, UpstreamError> {
        let envelope = self
            .authorized_get::<Value>(SEC_USER_ID_PATH, &[("url", profile_url)])
            .await?;
        Ok(envelope
            .data
            .as_ref()
            .and_then(Value::as_str)
            .and_then(non_empty)
            .map(ToString::to_string))
    }

    pub async fn fetch_user_posts(
        &self,
        sec_user_id: &str,
        cursor: &Cursor,
    ) -> Result<UserPage, UpstreamError> {
        let count = USER_PAGE_SIZE.to_string();
        let envelope = self
            .authorized_get::<UserPostsData>(
                USER_POSTS_PATH,
                &[
                    ("sec_user_id", sec_user_id),
                    ("count", &count),
                    ("max_cursor", cursor.as_str()),
                ],
            )
            .await?;

        let Some(data) = envelope.data else {
            return Ok(UserPage::default());
        };

        Ok(UserPage {
            items: data.aweme_list.unwrap_or_default(),
            has_more: is_truthy(data.has_more.as_ref()),
            max_cursor: data.max_cursor.unwrap_or_default(),
        })
    }

    /// Validates a candidate key without touching the stored credential.
    pub async fn check_key(&self, api_key: &str) -> Result<KeyCheck, UpstreamError> {
        let response = self
            .http
            .get(self.endpoint(USER_INFO_PATH))
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .timeout(Duration::from_secs(KEY_CHECK_TIMEOUT_SECONDS))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(KeyCheck::Valid(response.json().await?));
        }

        let message = match response.json::<Value>().await {
            Ok(body) => ["msg", "message"]
                .iter()
                .find_map(|key| body.get(key).and_then(Value::as_str))
                .unwrap_or("Invalid API key")
                .to_string(),
            Err(_) => format!("HTTP {}: invalid API key", status.as_u16()),
        };
        Ok(KeyCheck::Rejected(message))
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|value| value != 0.0),
        _ => false,
    }
}
