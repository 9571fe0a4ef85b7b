use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub database_url: String,
    pub recovery_enabled: bool,
    pub batch_window_ms: u64,
    pub batch_size_limit: usize,
    pub events_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/offline.db".into(),
            recovery_enabled: true,
            batch_window_ms: 100,
            batch_size_limit: 200,
            events_buffer: 100,
        }
    }
}

impl SyncSettings {
    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            recovery_enabled: self.recovery_enabled,
            batch_window: Duration::from_millis(self.batch_window_ms),
            batch_size_limit: self.batch_size_limit.max(1),
            events_buffer: self.events_buffer.max(1),
        }
    }
}

/// Runtime knobs of the sequential event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerConfig {
    pub recovery_enabled: bool,
    pub batch_window: Duration,
    pub batch_size_limit: usize,
    pub events_buffer: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        SyncSettings::default().handler_config()
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    database_url: Option<String>,
    recovery_enabled: Option<bool>,
    batch_window_ms: Option<u64>,
    batch_size_limit: Option<usize>,
    events_buffer: Option<usize>,
}

pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| {
        std::env::var(key).ok()
    })
}

/// Defaults, then the toml file at `path` if it parses, then `APP__*`
/// variables from `env`.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.database_url {
                    settings.database_url = v;
                }
                if let Some(v) = file_cfg.recovery_enabled {
                    settings.recovery_enabled = v;
                }
                if let Some(v) = file_cfg.batch_window_ms {
                    settings.batch_window_ms = v;
                }
                if let Some(v) = file_cfg.batch_size_limit {
                    settings.batch_size_limit = v;
                }
                if let Some(v) = file_cfg.events_buffer {
                    settings.events_buffer = v;
                }
            }
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable settings file: {err}"),
        }
    }

    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__RECOVERY_ENABLED") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.recovery_enabled = parsed;
        }
    }
    if let Some(v) = env("APP__BATCH_WINDOW_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.batch_window_ms = parsed;
        }
    }
    if let Some(v) = env("APP__BATCH_SIZE_LIMIT") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.batch_size_limit = parsed;
        }
    }
    if let Some(v) = env("APP__EVENTS_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.events_buffer = parsed;
        }
    }

    settings
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("chat_sync_{name}_{suffix}.toml"));
        fs::write(&path, contents).expect("write settings");
        path
    }

    #[test]
    fn missing_file_and_env_yield_defaults() {
        let settings = load_settings_from(Path::new("/nonexistent/sync.toml"), |_| None);
        assert_eq!(settings, SyncSettings::default());
        assert_eq!(
            settings.handler_config().batch_window,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn env_overrides_file_values() {
        let path = temp_file(
            "override",
            "database_url = \"sqlite://file.db\"\nbatch_window_ms = 250\nrecovery_enabled = false\n",
        );
        let env_values: HashMap<&str, &str> = [
            ("APP__BATCH_WINDOW_MS", "40"),
            ("APP__EVENTS_BUFFER", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let settings = load_settings_from(&path, |key| env_values.get(key).map(|v| v.to_string()));
        assert_eq!(settings.database_url, "sqlite://file.db");
        assert!(!settings.recovery_enabled);
        assert_eq!(settings.batch_window_ms, 40);
        assert_eq!(settings.events_buffer, 100);

        fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn handler_config_never_uses_zero_capacities() {
        let settings = SyncSettings {
            batch_size_limit: 0,
            events_buffer: 0,
            ..SyncSettings::default()
        };
        let config = settings.handler_config();
        assert_eq!(config.batch_size_limit, 1);
        assert_eq!(config.events_buffer, 1);
    }
}
