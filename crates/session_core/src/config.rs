use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use tracing::warn;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub server_url: String,
    /// Overrides the websocket endpoint derived from `server_url`.
    pub ws_url: Option<String>,
    pub auth_token: Option<String>,
    pub connect_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub history_timeout_ms: u64,
    pub reaction_window: usize,
    pub reaction_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_url: None,
            auth_token: None,
            connect_timeout_ms: 10_000,
            close_timeout_ms: 2_000,
            history_timeout_ms: 15_000,
            reaction_window: 32,
            reaction_capacity: 64,
        }
    }
}

impl SessionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }

    pub fn resolved_ws_url(&self) -> anyhow::Result<String> {
        match &self.ws_url {
            Some(url) => Ok(url.clone()),
            None => derive_ws_url(&self.server_url),
        }
    }
}

pub fn load_settings() -> SessionSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Reads `path` when present, then applies `APP__*` overrides from `env`.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> SessionSettings {
    let mut settings = SessionSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<SessionSettings>(&raw) {
            Ok(file_cfg) => settings = file_cfg,
            Err(err) => warn!(path = %path.display(), error = %err, "config: ignoring unreadable settings file"),
        }
    }

    apply_env_overrides(&mut settings, env);
    settings
}

fn apply_env_overrides(settings: &mut SessionSettings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = env("APP__AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }

    if let Some(parsed) = env("APP__CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.connect_timeout_ms = parsed;
    }
    if let Some(parsed) = env("APP__CLOSE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.close_timeout_ms = parsed;
    }
    if let Some(parsed) = env("APP__HISTORY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.history_timeout_ms = parsed;
    }
    if let Some(parsed) = env("APP__REACTION_WINDOW").and_then(|v| v.parse().ok()) {
        settings.reaction_window = parsed;
    }
    if let Some(parsed) = env("APP__REACTION_CAPACITY").and_then(|v| v.parse().ok()) {
        settings.reaction_capacity = parsed;
    }
}

pub fn derive_ws_url(server_url: &str) -> anyhow::Result<String> {
    let mut url =
        Url::parse(server_url).with_context(|| format!("invalid server_url: {server_url}"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => bail!("server_url must start with http:// or https://"),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("cannot use {scheme} scheme for {server_url}"))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}
