use std::{path::PathBuf, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::{
    config::{Credential, TOKEN_KEY, non_empty, persist_settings_value},
    error::ApiError,
    normalize::{MediaRecord, normalize},
    relay::{relay, sanitize_ascii_filename},
    thumbnail::fetch_and_convert_to_png,
    upstream::{Cursor, KeyCheck, TikHubClient},
};

const DEFAULT_DOWNLOAD_NAME: &str = "file.mp4";
const DEFAULT_THUMBNAIL_NAME: &str = "thumbnail.png";
pub const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

#[derive(Clone)]
pub struct AppState {
    pub upstream: TikHubClient,
    pub credential: Credential,
    pub media_client: reqwest::Client,
    pub media_timeout: Duration,
    pub settings_path: PathBuf,
    pub static_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct UrlRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct UserPageRequest {
    #[serde(default)]
    sec_user_id: String,
    #[serde(default)]
    max_cursor: Option<Cursor>,
}

#[derive(Debug, Deserialize)]
struct ApiKeyRequest {
    #[serde(default)]
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    url: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct DataResponse<T> {
    success: bool,
    data: T,
}

#[derive(Debug, Serialize)]
struct SecUserIdResponse {
    success: bool,
    sec_user_id: String,
}

#[derive(Debug, Serialize)]
struct UserPageResponse {
    success: bool,
    data: Vec<MediaRecord>,
    has_more: bool,
    max_cursor: Cursor,
}

#[derive(Debug, Serialize)]
struct CurrentKeyResponse {
    success: bool,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct FailureResponse {
    success: bool,
    error: String,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    success: bool,
    message: &'static str,
}

/// API routes, with everything else served from the static asset directory
/// (`/` resolves to its `index.html`).
pub fn router(state: AppState) -> Router {
    let assets = ServeDir::new(&state.static_dir);

    Router::new()
        .route("/api/health", get(health))
        .route("/get-info", post(get_info))
        .route("/get-user-id", post(get_user_id))
        .route("/fetch-user-page", post(fetch_user_page))
        .route("/proxy-download", get(proxy_download))
        .route("/download-thumbnail", get(download_thumbnail))
        .route("/api/get-current-key", get(get_current_key))
        .route("/api/check-key", post(check_key))
        .route("/api/save-settings", post(save_settings))
        .fallback_service(assets)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_info(
    State(state): State<AppState>,
    Json(payload): Json<UrlRequest>,
) -> Result<Json<DataResponse<MediaRecord>>, ApiError> {
    let url = non_empty(&payload.url).ok_or_else(|| ApiError::bad_request("Enter a share link."))?;

    let raw = state.upstream.fetch_one_video(url).await?;
    let record = normalize(&raw)
        .ok_or_else(|| ApiError::not_found("No media data was found for this link."))?;

    Ok(Json(DataResponse {
        success: true,
        data: record,
    }))
}

/// An unresolvable profile link answers 200 with `success: false`.
async fn get_user_id(
    State(state): State<AppState>,
    Json(payload): Json<UrlRequest>,
) -> Result<Response, ApiError> {
    let url =
        non_empty(&payload.url).ok_or_else(|| ApiError::bad_request("Enter a profile link."))?;

    Ok(match state.upstream.get_sec_user_id(url).await? {
        Some(sec_user_id) => Json(SecUserIdResponse {
            success: true,
            sec_user_id,
        })
        .into_response(),
        None => Json(FailureResponse {
            success: false,
            error: "Could not resolve the user ID. The link is wrong or blocked.".to_string(),
        })
        .into_response(),
    })
}

async fn fetch_user_page(
    State(state): State<AppState>,
    Json(payload): Json<UserPageRequest>,
) -> Result<Json<UserPageResponse>, ApiError> {
    let sec_user_id = non_empty(&payload.sec_user_id)
        .ok_or_else(|| ApiError::bad_request("Missing sec_user_id."))?;
    let cursor = payload.max_cursor.unwrap_or_default();

    let page = state.upstream.fetch_user_posts(sec_user_id, &cursor).await?;
    let total = page.items.len();
    let records: Vec<MediaRecord> = page.items.iter().filter_map(normalize).collect();
    if records.len() < total {
        warn!(
            "Dropped {} of {} items from user page at cursor {}",
            total - records.len(),
            total,
            cursor.as_str()
        );
    }

    Ok(Json(UserPageResponse {
        success: true,
        data: records,
        has_more: page.has_more,
        max_cursor: page.max_cursor,
    }))
}

async fn proxy_download(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Response, ApiError> {
    let url = query
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("Missing media URL."))?;
    let name = query
        .name
        .as_deref()
        .and_then(non_empty)
        .unwrap_or(DEFAULT_DOWNLOAD_NAME);

    let relayed = relay(&state.media_client, url, name).await?;

    let mut headers = attachment_headers(name, &relayed.content_disposition)?;
    if let Some(content_type) = relayed
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        headers.insert(CONTENT_TYPE, content_type);
    }

    Ok((headers, Body::from_stream(relayed.body)).into_response())
}

async fn download_thumbnail(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Response, ApiError> {
    let url = query
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("Missing image URL."))?;
    let name = query
        .name
        .as_deref()
        .and_then(non_empty)
        .unwrap_or(DEFAULT_THUMBNAIL_NAME);

    let thumbnail =
        fetch_and_convert_to_png(&state.media_client, url, name, state.media_timeout).await?;

    let mut headers = attachment_headers(&thumbnail.filename, &thumbnail.content_disposition)?;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));

    Ok((headers, thumbnail.data).into_response())
}

fn attachment_headers(filename: &str, content_disposition: &str) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(content_disposition)
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(filename))
            .map_err(|_| ApiError::internal("Could not build the file name header."))?,
    );
    Ok(headers)
}

async fn get_current_key(State(state): State<AppState>) -> Json<CurrentKeyResponse> {
    let api_key = state.credential.current().await;
    Json(CurrentKeyResponse {
        success: api_key.is_some(),
        api_key: api_key.unwrap_or_default(),
    })
}

async fn check_key(
    State(state): State<AppState>,
    Json(payload): Json<ApiKeyRequest>,
) -> Result<Response, ApiError> {
    let api_key =
        non_empty(&payload.api_key).ok_or_else(|| ApiError::bad_request("Enter an API key."))?;

    Ok(match state.upstream.check_key(api_key).await? {
        KeyCheck::Valid(data) => Json(DataResponse {
            success: true,
            data,
        })
        .into_response(),
        KeyCheck::Rejected(error) => Json(FailureResponse {
            success: false,
            error,
        })
        .into_response(),
    })
}

async fn save_settings(
    State(state): State<AppState>,
    Json(payload): Json<ApiKeyRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let api_key = non_empty(&payload.api_key)
        .ok_or_else(|| ApiError::bad_request("The API key is empty."))?
        .to_string();

    state.credential.replace(api_key.clone()).await;
    persist_settings_value(&state.settings_path, TOKEN_KEY, &api_key)
        .await
        .map_err(|error| ApiError::internal(format!("Could not write settings file: {error}")))?;
    info!("Saved a new aggregation API key to {}", state.settings_path.display());

    Ok(Json(MessageResponse {
        success: true,
        message: "Settings saved.",
    }))
}
