use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::message::DEFAULT_COLLECTION;

pub const SETTINGS_DIRECTORY_NAME: &str = "tandem";
pub const SETTINGS_FILE_NAME: &str = "sync.json";
pub const ENV_PREFIX: &str = "TANDEM_";

pub const DEFAULT_SUBSCRIBE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_UPDATE_CAPACITY: usize = 64;

/// Deadlines and buffers for one synchronizer. A timeout of 0 disables it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_update_capacity")]
    pub update_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            subscribe_timeout_ms: DEFAULT_SUBSCRIBE_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            update_capacity: DEFAULT_UPDATE_CAPACITY,
        }
    }
}

impl SyncSettings {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".tandem"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Defaults, then the JSON file at `path`, then `TANDEM_*` variables.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        let settings = figment.extract::<Self>().context(ExtractSnafu {
            stage: "extract-sync-settings",
            path: path.to_path_buf(),
        })?;
        Ok(settings.normalized())
    }

    /// Like [`Self::load`], but falls back to defaults when extraction fails.
    /// A missing file still honours `TANDEM_*` variables.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!("sync settings not found at {:?}, using defaults and environment", path);
        }

        match Self::load(path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(
                    "failed to load sync settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                Self::default()
            }
        }
    }

    pub fn subscribe_timeout(&self) -> Option<Duration> {
        millis_to_timeout(self.subscribe_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        millis_to_timeout(self.write_timeout_ms)
    }

    pub fn with_subscribe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.subscribe_timeout_ms = timeout_to_millis(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout_ms = timeout_to_millis(timeout);
        self
    }

    pub fn normalized(mut self) -> Self {
        self.collection = if self.collection.trim().is_empty() {
            default_collection()
        } else {
            self.collection.trim().to_string()
        };
        // broadcast::channel panics on zero capacity.
        self.update_capacity = self.update_capacity.max(1);
        self
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to read sync settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

fn millis_to_timeout(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

fn timeout_to_millis(timeout: Option<Duration>) -> u64 {
    timeout
        .map(|timeout| duration_millis(timeout).max(1))
        .unwrap_or(0)
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_string()
}

fn default_subscribe_timeout_ms() -> u64 {
    DEFAULT_SUBSCRIBE_TIMEOUT_MS
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

fn default_update_capacity() -> usize {
    DEFAULT_UPDATE_CAPACITY
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn file_values_override_defaults_and_are_normalized() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                SETTINGS_FILE_NAME,
                r#"{ "collection": "  direct ", "subscribe_timeout_ms": 250, "update_capacity": 0 }"#,
            )?;

            let path = jail.directory().join(SETTINGS_FILE_NAME);
            let settings = SyncSettings::load(&path).expect("settings load");
            assert_eq!(settings.collection, "direct");
            assert_eq!(settings.subscribe_timeout(), Some(Duration::from_millis(250)));
            assert_eq!(settings.write_timeout_ms, DEFAULT_WRITE_TIMEOUT_MS);
            assert_eq!(settings.update_capacity, 1);
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_the_file() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(SETTINGS_FILE_NAME, r#"{ "collection": "from_file" }"#)?;
            jail.set_env("TANDEM_COLLECTION", "from_env");
            jail.set_env("TANDEM_WRITE_TIMEOUT_MS", 0);

            let path = jail.directory().join(SETTINGS_FILE_NAME);
            let settings = SyncSettings::load(&path).expect("settings load");
            assert_eq!(settings.collection, "from_env");
            assert_eq!(settings.write_timeout(), None);
            Ok(())
        });
    }

    #[test]
    fn missing_file_still_applies_the_environment() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("TANDEM_COLLECTION", "env_only");

            let missing = jail.directory().join("missing.json");
            assert_eq!(SyncSettings::load(&missing).expect("load").collection, "env_only");
            assert_eq!(SyncSettings::load_or_default(&missing).collection, "env_only");
            Ok(())
        });
    }

    #[test]
    fn zero_disables_a_deadline() {
        let settings = SyncSettings::default().with_write_timeout(None);
        assert_eq!(settings.write_timeout(), None);
        assert_eq!(settings.write_timeout_ms, 0);

        let settings = settings.with_write_timeout(Some(Duration::from_millis(40)));
        assert_eq!(settings.write_timeout(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn oversized_durations_saturate() {
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
        assert_eq!(duration_millis(Duration::from_micros(2_500)), 2);
        assert_eq!(
            SyncSettings::default()
                .with_subscribe_timeout(Some(Duration::MAX))
                .subscribe_timeout_ms,
            u64::MAX
        );
    }

    #[test]
    fn unreadable_files_fall_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(SETTINGS_FILE_NAME, r#"{ "subscribe_timeout_ms": "soon" }"#)?;

            let path = jail.directory().join(SETTINGS_FILE_NAME);
            assert!(SyncSettings::load(&path).is_err());
            assert_eq!(SyncSettings::load_or_default(&path), SyncSettings::default());
            Ok(())
        });
    }
}
