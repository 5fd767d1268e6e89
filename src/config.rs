use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{error::ApiError, upstream::DEFAULT_BASE_URL};

pub const TOKEN_KEY: &str = "TIKHUB_TOKEN";

const DEFAULT_SETTINGS_PATH: &str = ".env";
const DEFAULT_STATIC_DIR: &str = "static";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_API_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_MEDIA_TIMEOUT_SECONDS: u64 = 20;

/// Bearer credential for the aggregation API.
///
/// Readers take a snapshot per outbound call; the settings route is the only
/// writer and swaps the whole value in place.
#[derive(Clone, Default)]
pub struct Credential(Arc<RwLock<Option<String>>>);

impl Credential {
    pub fn new(initial: Option<String>) -> Self {
        Self(Arc::new(RwLock::new(initial)))
    }

    pub async fn current(&self) -> Option<String> {
        self.0.read().await.clone()
    }

    pub async fn replace(&self, value: String) {
        *self.0.write().await = Some(value);
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub upstream_base_url: String,
    pub settings_path: PathBuf,
    pub static_dir: PathBuf,
    pub api_timeout: Duration,
    pub media_timeout: Duration,
    pub token: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ApiError> {
        let settings_path = std::env::var("SETTINGS_PATH")
            .ok()
            .and_then(|value| non_empty(&value).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));

        let token = match read_string_env(TOKEN_KEY) {
            Some(token) => Some(token),
            None => read_settings_value(&settings_path, TOKEN_KEY).map_err(|error| {
                ApiError::internal(format!(
                    "Could not read settings file {}: {error}",
                    settings_path.display()
                ))
            })?,
        };

        if token.is_some() {
            info!("Aggregation API key loaded.");
        } else {
            warn!("{TOKEN_KEY} is not configured. Upstream calls will fail until a key is saved.");
        }

        Ok(Self {
            bind_addr: resolve_bind_addr(),
            upstream_base_url: read_string_env("UPSTREAM_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            settings_path,
            static_dir: PathBuf::from(
                read_string_env("STATIC_DIR").unwrap_or_else(|| DEFAULT_STATIC_DIR.to_string()),
            ),
            api_timeout: Duration::from_secs(
                read_u64_env("API_TIMEOUT_SECONDS").unwrap_or(DEFAULT_API_TIMEOUT_SECONDS),
            ),
            media_timeout: Duration::from_secs(
                read_u64_env("MEDIA_TIMEOUT_SECONDS").unwrap_or(DEFAULT_MEDIA_TIMEOUT_SECONDS),
            ),
            token,
        })
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

/// Reads `key` from a dotenv-style settings file. A missing file reads as unset.
pub fn read_settings_value(path: &Path, key: &str) -> Result<Option<String>, dotenvy::Error> {
    let entries = match dotenvy::from_path_iter(path) {
        Ok(entries) => entries,
        Err(error) if error.not_found() => return Ok(None),
        Err(error) => return Err(error),
    };

    let mut found = None;
    for entry in entries {
        let (name, value) = entry?;
        if name == key {
            found = non_empty(&value).map(ToString::to_string);
        }
    }
    Ok(found)
}

/// Writes `key=value` into the settings file, replacing any previous entry
/// for `key` and keeping every other line untouched.
pub async fn persist_settings_value(path: &Path, key: &str, value: &str) -> std::io::Result<()> {
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(error) if error.kind() == ErrorKind::NotFound => String::new(),
        Err(error) => return Err(error),
    };

    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| !assigns(line, key))
        .map(ToString::to_string)
        .collect();
    lines.push(format!("{key}={value}"));

    let mut payload = lines.join("\n");
    payload.push('\n');
    tokio::fs::write(path, payload).await
}

fn assigns(line: &str, key: &str) -> bool {
    let line = line.trim_start();
    let line = line.strip_prefix("export ").unwrap_or(line);
    line.split_once('=').is_some_and(|(name, _)| name.trim() == key)
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_file_reads_as_unset() {
        let dir = tempfile::tempdir().unwrap();
        let value = read_settings_value(&dir.path().join(".env"), TOKEN_KEY).unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn settings_file_follows_dotenv_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let contents = "# keys\nTIKHUB_TOKEN=abc123 # prod key\nexport PORT=\"5001\"\n";
        tokio::fs::write(&path, contents).await.unwrap();

        assert_eq!(
            read_settings_value(&path, TOKEN_KEY).unwrap().as_deref(),
            Some("abc123")
        );
        assert_eq!(read_settings_value(&path, "PORT").unwrap().as_deref(), Some("5001"));
        assert_eq!(read_settings_value(&path, "MISSING").unwrap(), None);
    }

    #[tokio::test]
    async fn blank_token_reads_as_unset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        tokio::fs::write(&path, "TIKHUB_TOKEN=\"  \"\n").await.unwrap();

        assert_eq!(read_settings_value(&path, TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn persisting_replaces_only_the_token_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        tokio::fs::write(&path, "PORT=5001\nexport TIKHUB_TOKEN=old\n# keep\n")
            .await
            .unwrap();

        persist_settings_value(&path, TOKEN_KEY, "new-key").await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "PORT=5001\n# keep\nTIKHUB_TOKEN=new-key\n");
        assert_eq!(
            read_settings_value(&path, TOKEN_KEY).unwrap().as_deref(),
            Some("new-key")
        );
    }

    #[tokio::test]
    async fn credential_is_replaced_in_place() {
        let credential = Credential::new(None);
        let shared = credential.clone();
        assert_eq!(shared.current().await, None);

        credential.replace("k1".to_string()).await;
        assert_eq!(shared.current().await.as_deref(), Some("k1"));
    }
}
