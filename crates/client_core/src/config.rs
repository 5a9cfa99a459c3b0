use std::{
    fs,
    path::Path,
    time::Duration,
};

use serde::Deserialize;
use tracing::warn;

use crate::retry::Backoff;

pub const CONFIG_FILE_NAME: &str = "chatsync.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server_url: String,
    pub page_size: u32,
    pub fingerprint_window_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub stream_reconnect_attempts: u32,
    pub database_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            page_size: 20,
            fingerprint_window_secs: 120,
            retry_max_attempts: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4_000,
            stream_reconnect_attempts: 5,
            database_url: "sqlite://./data/chatsync.db".into(),
        }
    }
}

impl SyncConfig {
    pub fn transport_backoff(&self) -> Backoff {
        Backoff::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::new(
            self.stream_reconnect_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn fingerprint_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.fingerprint_window_secs).unwrap_or(i64::MAX))
    }

    fn sanitize(mut self) -> Self {
        self.page_size = self.page_size.clamp(1, 100);
        self.retry_max_attempts = self.retry_max_attempts.max(1);
        self.stream_reconnect_attempts = self.stream_reconnect_attempts.max(1);
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            self.retry_max_delay_ms = self.retry_base_delay_ms;
        }
        self.server_url = self.server_url.trim_end_matches('/').to_string();
        self
    }
}

/// Reads `chatsync.toml` from the working directory, then applies
/// `CHATSYNC__*` environment overrides.
pub fn load_config() -> SyncConfig {
    load_config_from(Path::new(CONFIG_FILE_NAME), |key| std::env::var(key).ok())
}

pub fn load_config_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> SyncConfig {
    let mut config = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<SyncConfig>(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), "config: ignoring malformed file: {err}");
                SyncConfig::default()
            }
        },
        Err(_) => SyncConfig::default(),
    };

    if let Some(v) = env("CHATSYNC__SERVER_URL") {
        config.server_url = v;
    }
    if let Some(v) = env("CHATSYNC__DATABASE_URL") {
        config.database_url = v;
    }
    override_number(&env, "CHATSYNC__PAGE_SIZE", &mut config.page_size);
    override_number(
        &env,
        "CHATSYNC__FINGERPRINT_WINDOW_SECS",
        &mut config.fingerprint_window_secs,
    );
    override_number(
        &env,
        "CHATSYNC__RETRY_MAX_ATTEMPTS",
        &mut config.retry_max_attempts,
    );
    override_number(
        &env,
        "CHATSYNC__RETRY_BASE_DELAY_MS",
        &mut config.retry_base_delay_ms,
    );
    override_number(
        &env,
        "CHATSYNC__RETRY_MAX_DELAY_MS",
        &mut config.retry_max_delay_ms,
    );
    override_number(
        &env,
        "CHATSYNC__STREAM_RECONNECT_ATTEMPTS",
        &mut config.stream_reconnect_attempts,
    );

    config.sanitize()
}

fn override_number<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = env(key) {
        match raw.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key, value = %raw, "config: ignoring non-numeric override"),
        }
    }
}

/// Turns plain file paths into `sqlite://` URLs. `Storage::new` creates the
/// parent directory.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return SyncConfig::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
