use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "reaper.toml";

/// Environment variable prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "REAPER__";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// DSN of the backing key-value store (`memory://`, `file:///path`, `s3://host/bucket`)
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("file:///.data/datasets"),
        }
    }
}

impl StorageConfig {
    /// Storage configuration backed by a process-local in-memory store
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("memory://"),
        }
    }
}

/// Retry policy applied by the store adapter to transient backend failures.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per store call, including the first one
    ///
    /// Env: REAPER__SWEEP__RETRY__MAX_ATTEMPTS
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound for the backoff delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Factor applied to the delay after every failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }

        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            anyhow::bail!(
                "retry.backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            );
        }

        if self.initial_delay > self.max_delay {
            anyhow::bail!(
                "retry.initial_delay ({:?}) cannot exceed retry.max_delay ({:?})",
                self.initial_delay,
                self.max_delay
            );
        }

        Ok(())
    }
}

/// Behaviour of dataset deletion and garbage collection runs.
///
/// ## Safety Defaults
///
/// - `verify_after_delete`: true (a key that survives its delete is reported)
/// - `revalidate_before_delete`: true (orphans are re-checked against the catalog)
/// - `dry_run`: false
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SweepConfig {
    /// Maximum number of in-flight key deletions within one dataset.
    ///
    /// Env: REAPER__SWEEP__DELETE_CONCURRENCY
    #[serde(default = "default_delete_concurrency")]
    pub delete_concurrency: usize,

    /// Maximum number of datasets processed at once by batch operations.
    ///
    /// Env: REAPER__SWEEP__DATASET_CONCURRENCY
    #[serde(default = "default_dataset_concurrency")]
    pub dataset_concurrency: usize,

    /// Enumerate only the dataset prefix instead of the whole store.
    ///
    /// Env: REAPER__SWEEP__SCOPED_LISTING
    #[serde(default = "default_true")]
    pub scoped_listing: bool,

    /// Re-enumerate the namespace after deleting and report survivors.
    ///
    /// Env: REAPER__SWEEP__VERIFY_AFTER_DELETE
    #[serde(default = "default_true")]
    pub verify_after_delete: bool,

    /// Re-read the catalog right before sweeping orphans.
    ///
    /// Env: REAPER__SWEEP__REVALIDATE_BEFORE_DELETE
    #[serde(default = "default_true")]
    pub revalidate_before_delete: bool,

    /// Report what would be deleted without deleting anything.
    ///
    /// Env: REAPER__SWEEP__DRY_RUN
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_delete_concurrency() -> usize {
    16
}

fn default_dataset_concurrency() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            delete_concurrency: default_delete_concurrency(),
            dataset_concurrency: default_dataset_concurrency(),
            scoped_listing: true,
            verify_after_delete: true,
            revalidate_before_delete: true,
            dry_run: false,
            retry: RetryConfig::default(),
        }
    }
}

impl SweepConfig {
    /// Validate the sweep configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.delete_concurrency == 0 {
            anyhow::bail!("sweep.delete_concurrency must be positive");
        }

        if self.dataset_concurrency == 0 {
            anyhow::bail!("sweep.dataset_concurrency must be positive");
        }

        self.retry.validate()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Backing store configuration
    pub storage: StorageConfig,
    /// Deletion and garbage collection behaviour
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl Configuration {
    /// Load configuration from defaults, `reaper.toml` and `REAPER__` env vars.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Path::new(DEFAULT_CONFIG_FILE))
            .extract()
            .map_err(Box::new)
    }

    /// Load configuration from an explicit TOML file, still honouring env overrides.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(path).extract().map_err(Box::new)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.dsn.is_empty() {
            anyhow::bail!("Storage DSN cannot be empty");
        }

        self.sweep.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = Configuration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.dsn, "file:///.data/datasets");
        assert_eq!(config.sweep.delete_concurrency, 16);
        assert_eq!(config.sweep.dataset_concurrency, 4);
        assert!(config.sweep.scoped_listing);
        assert!(config.sweep.verify_after_delete);
        assert!(config.sweep.revalidate_before_delete);
        assert!(!config.sweep.dry_run);
    }

    #[test]
    fn test_retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(5));
        assert_eq!(retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_configless_operation() {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .extract::<Configuration>()
            .unwrap();

        assert_eq!(config.sweep, SweepConfig::default());
    }

    #[test]
    fn test_toml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "reaper.toml",
                r#"
                [storage]
                dsn = "memory://"

                [sweep]
                delete_concurrency = 2
                dry_run = true

                [sweep.retry]
                initial_delay = "250ms"
                "#,
            )?;
            jail.set_env("REAPER__SWEEP__DATASET_CONCURRENCY", "9");

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.storage.dsn, "memory://");
            assert_eq!(config.sweep.delete_concurrency, 2);
            assert_eq!(config.sweep.dataset_concurrency, 9);
            assert!(config.sweep.dry_run);
            assert!(config.sweep.verify_after_delete);
            assert_eq!(config.sweep.retry.initial_delay, Duration::from_millis(250));
            assert_eq!(config.sweep.retry.max_attempts, 3);
            Ok(())
        });
    }

    #[test]
    fn test_load_from_explicit_path() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[storage]\ndsn = \"file:///tmp/x\"\n")?;

            let config = Configuration::load_from_path(Path::new("custom.toml")).map_err(|e| *e)?;
            assert_eq!(config.storage.dsn, "file:///tmp/x");
            Ok(())
        });
    }

    #[test]
    fn test_zero_concurrency_is_invalid() {
        let config = SweepConfig {
            delete_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SweepConfig {
            dataset_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_retry_policies() {
        let zero_attempts = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(zero_attempts.validate().is_err());

        let shrinking = RetryConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());

        let inverted = RetryConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let single_attempt = RetryConfig {
            max_attempts: 1,
            ..Default::default()
        };
        assert!(single_attempt.validate().is_ok());
    }

    #[test]
    fn test_empty_storage_dsn_is_invalid() {
        let config = Configuration {
            storage: StorageConfig { dsn: String::new() },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
