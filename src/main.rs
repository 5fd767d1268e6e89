mod config;
mod document;
mod error;
mod normalize;
mod relay;
mod routes;
#[cfg(test)]
mod test_support;
mod thumbnail;
mod upstream;

use std::{collections::HashSet, sync::Arc};

use axum::http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{Credential, Settings},
    error::ApiError,
    routes::{AppState, DOWNLOAD_FILENAME_HEADER},
    upstream::TikHubClient,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "douyin_relay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let settings = Settings::from_env()?;
    let credential = Credential::new(settings.token.clone());

    let api_client = reqwest::Client::builder()
        .timeout(settings.api_timeout)
        .build()
        .map_err(|error| ApiError::internal(format!("Could not build HTTP client: {error}")))?;
    // No total timeout here: a long video must be able to stream for longer
    // than a single stalled read is allowed to take.
    let media_client = reqwest::Client::builder()
        .connect_timeout(settings.media_timeout)
        .read_timeout(settings.media_timeout)
        .build()
        .map_err(|error| ApiError::internal(format!("Could not build media client: {error}")))?;

    info!(
        "Using aggregation API at {} (settings file {}, assets from {})",
        settings.upstream_base_url,
        settings.settings_path.display(),
        settings.static_dir.display()
    );

    let state = AppState {
        upstream: TikHubClient::new(api_client, &settings.upstream_base_url, credential.clone()),
        credential,
        media_client,
        media_timeout: settings.media_timeout,
        settings_path: settings.settings_path.clone(),
        static_dir: settings.static_dir.clone(),
    };

    let cors = build_cors_layer()?;
    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not bind {}: {error}",
                settings.bind_addr
            ))
        })?;

    info!("Relay ready on http://{}", settings.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

fn build_cors_layer() -> Result<CorsLayer, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Falling back to local development origins.");
        vec![
            "http://127.0.0.1:5000".to_string(),
            "http://localhost:5000".to_string(),
        ]
    } else {
        configured
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins.iter().collect::<Vec<_>>()
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
