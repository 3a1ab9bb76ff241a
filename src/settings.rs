//! Hot-reloadable settings.
//!
//! Components that must honour operator changes without a restart (the
//! throttle, the retriever, the orchestrator's timeouts) hold an
//! `Arc<dyn SettingsSource>` and call [`SettingsSource::current`] on every
//! request instead of copying values at construction.
//!
//! [`LiveSettings`] backs the source with the TOML file: a background task
//! polls the file's modification time and swaps in the new [`Config`] once
//! it parses and validates. A broken edit is logged and ignored.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use crate::config::{self, Config};

/// A process-wide source of the current configuration.
pub trait SettingsSource: Send + Sync {
    /// The configuration in effect right now.
    fn current(&self) -> Arc<Config>;
}

/// Settings that can be replaced at runtime.
pub struct LiveSettings {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl LiveSettings {
    /// Settings with no backing file; change them with [`LiveSettings::replace`].
    pub fn fixed(config: Config) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
            last_modified: Mutex::new(None),
        }
    }

    /// Load settings from `path` and remember it for [`LiveSettings::reload`].
    pub fn load(path: &Path) -> Result<Self> {
        let config = config::load_config(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            current: RwLock::new(Arc::new(config)),
            last_modified: Mutex::new(modified_time(path)),
        })
    }

    /// Swap in a new configuration.
    pub fn replace(&self, config: Config) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(config);
    }

    /// Re-read the backing file if it changed since the last load.
    ///
    /// Returns `Ok(true)` when new settings were applied. On a parse or
    /// validation error the previous settings stay in effect.
    pub fn reload(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };

        let modified = modified_time(path);
        {
            let mut last = self.last_modified.lock().unwrap_or_else(|e| e.into_inner());
            if modified.is_some() && *last == modified {
                return Ok(false);
            }
            // A broken edit is reported once, not on every poll.
            *last = modified;
        }

        let config = config::load_config(path)?;
        self.replace(config);
        Ok(true)
    }

    /// Poll the backing file on an interval taken from the current settings.
    pub fn spawn_watcher(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let secs = self.current().server.reload_interval_secs.max(1);
                tokio::time::sleep(Duration::from_secs(secs)).await;
                match self.reload() {
                    Ok(true) => tracing::info!("settings reloaded"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "settings reload failed; keeping previous settings"),
                }
            }
        })
    }
}

impl SettingsSource for LiveSettings {
    fn current(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_replace_is_visible_to_readers() {
        let settings = LiveSettings::fixed(Config::default());
        let before = settings.current();
        let mut next = Config::default();
        next.throttle.ask.rate = 2;
        settings.replace(next);
        assert_eq!(before.throttle.ask.rate, 30);
        assert_eq!(settings.current().throttle.ask.rate, 2);
    }

    #[test]
    fn test_reload_applies_file_changes_and_keeps_previous_on_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pagewise.toml");
        std::fs::write(&path, "[throttle.ask]\nrate = 3\nwindow_secs = 60\n").unwrap();
        let settings = LiveSettings::load(&path).unwrap();
        assert_eq!(settings.current().throttle.ask.rate, 3);

        // Force the next reload to see a different mtime.
        *settings.last_modified.lock().unwrap() = None;
        std::fs::write(&path, "[throttle.ask]\nrate = 7\nwindow_secs = 60\n").unwrap();
        assert!(settings.reload().unwrap());
        assert_eq!(settings.current().throttle.ask.rate, 7);

        *settings.last_modified.lock().unwrap() = None;
        std::fs::write(&path, "[throttle.ask]\nrate = 7\nwindow_secs = 0\n").unwrap();
        assert!(settings.reload().is_err());
        assert_eq!(settings.current().throttle.ask.rate, 7);
    }

    #[test]
    fn test_fixed_settings_never_reload() {
        let settings = LiveSettings::fixed(Config::default());
        assert!(!settings.reload().unwrap());
    }
}
