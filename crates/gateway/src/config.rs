use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use config::{Config, Environment, File};
use gateway_core::{GatewaySettings, SessionSettings};
use remote_api::RemoteConfig;
use serde::Deserialize;

const SETTINGS_FILE: &str = "gateway";
const ENV_PREFIX: &str = "GATEWAY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,
    pub remote_api_url: String,
    pub remote_api_version: String,
    pub oauth_url: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub transport_addr: String,
    pub admin_bind: String,
    pub persist_cursor: bool,
    pub poll_wait_seconds: u64,
    pub poll_mode: u32,
    pub log_filter: String,
    pub restart_delay_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let remote = RemoteConfig::default();
        Self {
            database_url: "sqlite://./data/gateway.db".into(),
            remote_api_url: remote.api_url,
            remote_api_version: remote.api_version,
            oauth_url: remote.oauth_url,
            oauth_client_id: remote.client_id,
            oauth_client_secret: remote.client_secret,
            transport_addr: "127.0.0.1:5347".into(),
            admin_bind: "127.0.0.1:8088".into(),
            persist_cursor: true,
            poll_wait_seconds: 30,
            poll_mode: 2,
            log_filter: "info".into(),
            restart_delay_seconds: 5,
        }
    }
}

impl Settings {
    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            api_url: self.remote_api_url.clone(),
            api_version: self.remote_api_version.clone(),
            oauth_url: self.oauth_url.clone(),
            client_id: self.oauth_client_id.clone(),
            client_secret: self.oauth_client_secret.clone(),
            poll_wait_seconds: self.poll_wait_seconds,
            poll_mode: self.poll_mode,
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            session: SessionSettings {
                persist_cursor: self.persist_cursor,
                ..SessionSettings::default()
            },
            ..GatewaySettings::default()
        }
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_seconds)
    }
}

/// Reads `gateway.toml` from the working directory (if any), then applies
/// `GATEWAY__*` environment overrides.
pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(SETTINGS_FILE)
}

pub fn load_settings_from(file: &str) -> anyhow::Result<Settings> {
    Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to read settings from '{file}'"))?
        .try_deserialize()
        .context("invalid gateway settings")
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url);
    format!("sqlite://{}", path.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(parent) = sqlite_path(database_url)
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
    else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(&parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
