use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use url::Url;

use crate::connection::ConnectionSettings;

pub const DEFAULT_SETTINGS_PATH: &str = "chat.toml";
const ENV_PREFIX: &str = "CHAT__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSettings {
    pub server_url: String,
    pub tenant: String,
    /// Own address; when unset the self row of the member list supplies it.
    pub identity: Option<String>,
    pub csrf_token: Option<String>,
    pub session_cookie: Option<String>,
    pub poll_interval_ms: u64,
    pub fallback_after_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub unread_refresh_ms: u64,
    pub typing_idle_ms: u64,
    pub typing_display_ms: u64,
    pub echo_timeout_ms: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            tenant: String::new(),
            identity: None,
            csrf_token: None,
            session_cookie: None,
            poll_interval_ms: 5_000,
            fallback_after_ms: 2_000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            unread_refresh_ms: 6_000,
            typing_idle_ms: 1_000,
            typing_display_ms: 3_000,
            echo_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    server_url: Option<String>,
    tenant: Option<String>,
    identity: Option<String>,
    csrf_token: Option<String>,
    session_cookie: Option<String>,
    poll_interval_ms: Option<u64>,
    fallback_after_ms: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    unread_refresh_ms: Option<u64>,
    typing_idle_ms: Option<u64>,
    typing_display_ms: Option<u64>,
    echo_timeout_ms: Option<u64>,
}

/// Defaults, then the TOML file at `path` if it exists, then `CHAT__*`
/// environment overrides.
pub fn load_settings(path: impl AsRef<Path>) -> Result<ChatSettings> {
    let path = path.as_ref();
    let mut settings = ChatSettings::default();

    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let file: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("failed to parse settings file {}", path.display()))?;
        apply_file(&mut settings, file);
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

fn apply_file(settings: &mut ChatSettings, file: FileSettings) {
    if let Some(v) = file.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file.tenant {
        settings.tenant = v;
    }
    if file.identity.is_some() {
        settings.identity = file.identity;
    }
    if file.csrf_token.is_some() {
        settings.csrf_token = file.csrf_token;
    }
    if file.session_cookie.is_some() {
        settings.session_cookie = file.session_cookie;
    }
    let knobs = [
        (file.poll_interval_ms, &mut settings.poll_interval_ms),
        (file.fallback_after_ms, &mut settings.fallback_after_ms),
        (file.reconnect_initial_ms, &mut settings.reconnect_initial_ms),
        (file.reconnect_max_ms, &mut settings.reconnect_max_ms),
        (file.unread_refresh_ms, &mut settings.unread_refresh_ms),
        (file.typing_idle_ms, &mut settings.typing_idle_ms),
        (file.typing_display_ms, &mut settings.typing_display_ms),
        (file.echo_timeout_ms, &mut settings.echo_timeout_ms),
    ];
    for (value, slot) in knobs {
        if let Some(value) = value {
            *slot = value;
        }
    }
}

fn apply_env_overrides(settings: &mut ChatSettings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("TENANT") {
        settings.tenant = v;
    }
    if let Some(v) = var("IDENTITY") {
        settings.identity = Some(v);
    }
    if let Some(v) = var("CSRF_TOKEN") {
        settings.csrf_token = Some(v);
    }
    if let Some(v) = var("SESSION_COOKIE") {
        settings.session_cookie = Some(v);
    }

    // Unparseable numbers keep the previous value.
    let knobs = [
        ("POLL_INTERVAL_MS", &mut settings.poll_interval_ms),
        ("FALLBACK_AFTER_MS", &mut settings.fallback_after_ms),
        ("RECONNECT_INITIAL_MS", &mut settings.reconnect_initial_ms),
        ("RECONNECT_MAX_MS", &mut settings.reconnect_max_ms),
        ("UNREAD_REFRESH_MS", &mut settings.unread_refresh_ms),
        ("TYPING_IDLE_MS", &mut settings.typing_idle_ms),
        ("TYPING_DISPLAY_MS", &mut settings.typing_display_ms),
        ("ECHO_TIMEOUT_MS", &mut settings.echo_timeout_ms),
    ];
    for (name, slot) in knobs {
        if let Some(parsed) = var(name).and_then(|v| v.trim().parse::<u64>().ok()) {
            *slot = parsed;
        }
    }
}

impl ChatSettings {
    pub fn validate(&self) -> Result<()> {
        self.http_base_url()?;
        Ok(())
    }

    /// `server_url` without a trailing slash, checked to be http or https.
    pub fn http_base_url(&self) -> Result<String> {
        let trimmed = self.server_url.trim().trim_end_matches('/');
        let parsed = Url::parse(trimmed)
            .with_context(|| format!("invalid server_url: {}", self.server_url))?;
        match parsed.scheme() {
            "http" | "https" => Ok(trimmed.to_string()),
            other => Err(anyhow!(
                "server_url must start with http:// or https://, got {other}://"
            )),
        }
    }

    pub fn ws_base_url(&self) -> Result<String> {
        let base = self.http_base_url()?;
        if let Some(rest) = base.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = base.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            Err(anyhow!("server_url must start with http:// or https://"))
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
            fallback_after: Duration::from_millis(self.fallback_after_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn unread_refresh(&self) -> Duration {
        Duration::from_millis(self.unread_refresh_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn typing_display(&self) -> Duration {
        Duration::from_millis(self.typing_display_ms)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
