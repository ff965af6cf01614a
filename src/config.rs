use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    database: String,
    staging_dir: String,
    /// Name of the destination collection (album) everything lands in.
    pub collection: String,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub leases: LeaseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    source: SourceConfig,
    destination: DestinationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub fetch_workers: usize,
    pub delivery_workers: usize,
    pub fetch_batch_size: u64,
    pub delivery_batch_size: u64,
    pub finalize_batch_size: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fetch_workers: 4,
            delivery_workers: 2,
            fetch_batch_size: 8,
            delivery_batch_size: 8,
            finalize_batch_size: 32,
        }
    }
}

/// How long a claimed item stays leased before the sweep may take it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    #[serde(with = "humantime_duration")]
    pub fetch: Duration,
    #[serde(with = "humantime_duration")]
    pub delivery: Duration,
    #[serde(with = "humantime_duration")]
    pub finalize: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(10 * 60),
            delivery: Duration::from_secs(10 * 60),
            finalize: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub fetch_limit: u32,
    pub delivery_limit: u32,
    pub finalize_release_attempts: u32,
    #[serde(with = "humantime_duration")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_duration")]
    pub backoff_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 5,
            delivery_limit: 5,
            finalize_release_attempts: 3,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(with = "humantime_duration")]
    pub discovery_interval: Duration,
    #[serde(with = "humantime_duration")]
    pub sweep_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// A directory tree, e.g. an exported photo library
    LocalDirectory { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationConfig {
    LocalDirectory { path: String },
    /// Google Photos, authorized by an OAuth "authorized user" JSON file
    GooglePhotos { token_file: String },
}

impl Config {
    /// Load config from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&contents)
            .wrap_err_with(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|path| path.join("photo-migrator").join("config.toml"))
    }

    /// Load config from the default location
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path().ok_or_else(|| eyre!("Config file not found"))?;
        Self::from_file(&config_path)
    }

    /// Write a default config file unless one exists already.
    pub fn create_default() -> Result<PathBuf> {
        let path = Self::config_path().ok_or_else(|| eyre!("No config directory available"))?;
        if path.exists() {
            tracing::info!("Config already exists at {}", path.display());
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents =
            toml::to_string_pretty(&Self::default()).wrap_err("Failed to render default config")?;
        std::fs::write(&path, contents)
            .wrap_err_with(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(path)
    }

    fn validate(&self) -> Result<()> {
        if self.workers.fetch_workers == 0 || self.workers.delivery_workers == 0 {
            return Err(eyre!("Worker pools need at least one worker each"));
        }
        if self.workers.fetch_batch_size == 0
            || self.workers.delivery_batch_size == 0
            || self.workers.finalize_batch_size == 0
        {
            return Err(eyre!("Batch sizes must be at least 1"));
        }
        if self.retry.fetch_limit == 0
            || self.retry.delivery_limit == 0
            || self.retry.finalize_release_attempts == 0
        {
            return Err(eyre!("Retry limits must be at least 1"));
        }
        if [self.leases.fetch, self.leases.delivery, self.leases.finalize]
            .iter()
            .any(Duration::is_zero)
        {
            return Err(eyre!("Lease durations must be non-zero"));
        }
        if self.collection.trim().is_empty() {
            return Err(eyre!("Collection name must not be empty"));
        }
        Ok(())
    }

    /// Expand ~ to home directory
    pub fn expand_path(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }

    pub fn database_path(&self) -> PathBuf {
        self.expand_path(&self.database)
    }

    pub fn staging_path(&self) -> PathBuf {
        self.expand_path(&self.staging_dir)
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    pub fn destination(&self) -> &DestinationConfig {
        &self.destination
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: "~/.local/share/photo-migrator/work_items.sqlite".to_string(),
            staging_dir: "~/.local/share/photo-migrator/staging".to_string(),
            collection: "Migrated".to_string(),
            workers: WorkerConfig::default(),
            leases: LeaseConfig::default(),
            retry: RetryConfig::default(),
            schedule: ScheduleConfig::default(),
            source: SourceConfig::LocalDirectory {
                path: "~/Pictures/export".to_string(),
            },
            destination: DestinationConfig::GooglePhotos {
                token_file: "~/.config/photo-migrator/gcloud.json".to_string(),
            },
        }
    }
}

/// `"90s"`, `"10m"`, `"1h 30m"` style durations.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        database = "/var/lib/migrator/items.sqlite"
        staging_dir = "/var/lib/migrator/staging"
        collection = "From iCloud"

        [source]
        type = "local_directory"
        path = "/mnt/icloud-export"

        [destination]
        type = "google_photos"
        token_file = "~/auth/gcloud.json"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();

        assert_eq!(config.collection, "From iCloud");
        assert_eq!(config.workers.fetch_workers, 4);
        assert_eq!(config.retry.fetch_limit, 5);
        assert_eq!(config.leases.delivery, Duration::from_secs(600));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/migrator/items.sqlite")
        );
        assert_eq!(
            config.source(),
            &SourceConfig::LocalDirectory {
                path: "/mnt/icloud-export".into()
            }
        );
    }

    #[test]
    fn test_humantime_sections() {
        let toml = format!(
            "{MINIMAL}\n[leases]\nfetch = \"90s\"\ndelivery = \"2m\"\n\n[retry]\nfetch_limit = 7\nbackoff_base = \"1s\"\n"
        );
        let config = Config::from_toml(&toml).unwrap();

        assert_eq!(config.leases.fetch, Duration::from_secs(90));
        assert_eq!(config.leases.delivery, Duration::from_secs(120));
        assert_eq!(config.leases.finalize, Duration::from_secs(60));
        assert_eq!(config.retry.fetch_limit, 7);
        assert_eq!(config.retry.backoff_base, Duration::from_secs(1));
        assert_eq!(config.retry.delivery_limit, 5);
    }

    #[test]
    fn test_rejects_zero_limits() {
        let toml = format!("{MINIMAL}\n[retry]\nfetch_limit = 0\n");
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed = Config::from_toml(&rendered).unwrap();
        assert_eq!(parsed.destination(), Config::default().destination());
        assert_eq!(parsed.schedule.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_expand_home() {
        let config = Config::default();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.expand_path("~/x/y"), home.join("x/y"));
        }
        assert_eq!(config.expand_path("/abs"), PathBuf::from("/abs"));
    }
}
