//! Configuration schema and loading for Gas Town.

use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const CONFIG_FILE: &str = "gastown.toml";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level Gas Town configuration, loaded from `gastown.toml`.
///
/// Resolution order: `GASTOWN_WORKSPACE` env → `~/.gastown`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory - computed at load time, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to gastown.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Mail orchestration daemon settings (`[mail]`).
    #[serde(default)]
    pub mail: MailConfig,

    /// Daemon restart and flush cadence settings (`[reliability]`).
    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::new(),
            config_path: PathBuf::new(),
            mail: MailConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

// ── Mail ─────────────────────────────────────────────────────────

/// Mail orchestration configuration (`[mail]` section).
///
/// Immutable after the orchestrator is constructed; edits require a daemon
/// restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// Enable the mail orchestration daemon. Default: `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Poll cadence for the orchestrator loop, in seconds. Default: `30`.
    #[serde(default = "default_mail_poll_secs")]
    pub poll_interval_secs: u64,
    /// Failed delivery attempts before a message is dead-lettered. Default: `3`.
    #[serde(default = "default_mail_max_retries")]
    pub max_retries: u32,
    /// Delay before a failed message becomes eligible for retry, in seconds.
    /// Default: `300` (5 minutes).
    #[serde(default = "default_mail_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Bound on a single delivery attempt, in seconds. Default: `30`.
    #[serde(default = "default_mail_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
    /// Maximum messages accepted from the source per poll cycle. Default: `64`.
    #[serde(default = "default_mail_fetch_limit")]
    pub fetch_limit: usize,
}

fn default_true() -> bool {
    true
}

fn default_mail_poll_secs() -> u64 {
    30
}

fn default_mail_max_retries() -> u32 {
    3
}

fn default_mail_retry_delay_secs() -> u64 {
    300
}

fn default_mail_delivery_timeout_secs() -> u64 {
    30
}

fn default_mail_fetch_limit() -> usize {
    64
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            poll_interval_secs: default_mail_poll_secs(),
            max_retries: default_mail_max_retries(),
            retry_delay_secs: default_mail_retry_delay_secs(),
            delivery_timeout_secs: default_mail_delivery_timeout_secs(),
            fetch_limit: default_mail_fetch_limit(),
        }
    }
}

// ── Reliability ──────────────────────────────────────────────────

/// Reliability settings for daemon supervision (`[reliability]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Initial backoff for daemon component restarts, in seconds.
    #[serde(default = "default_daemon_backoff_secs")]
    pub daemon_initial_backoff_secs: u64,
    /// Max backoff for daemon component restarts, in seconds.
    #[serde(default = "default_daemon_backoff_max_secs")]
    pub daemon_max_backoff_secs: u64,
    /// How often the daemon flushes its status snapshot, in seconds.
    #[serde(default = "default_state_flush_secs")]
    pub state_flush_secs: u64,
}

fn default_daemon_backoff_secs() -> u64 {
    2
}

fn default_daemon_backoff_max_secs() -> u64 {
    60
}

fn default_state_flush_secs() -> u64 {
    5
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            daemon_initial_backoff_secs: default_daemon_backoff_secs(),
            daemon_max_backoff_secs: default_daemon_backoff_max_secs(),
            state_flush_secs: default_state_flush_secs(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".gastown"))
}

fn resolve_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("GASTOWN_WORKSPACE") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    default_config_dir()
}

impl Config {
    /// Load `gastown.toml`, creating the directory tree and a default config
    /// on first run.
    pub async fn load_or_init() -> Result<Self> {
        let dir = resolve_config_dir()?;
        Self::load_or_init_at(&dir).await
    }

    /// Like [`Config::load_or_init`], rooted at an explicit directory.
    pub async fn load_or_init_at(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let workspace_dir = dir.join("workspace");

        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        fs::create_dir_all(&workspace_dir)
            .await
            .context("Failed to create workspace directory")?;

        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            toml::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            let rendered = toml::to_string_pretty(&config)?;
            fs::write(&config_path, rendered)
                .await
                .context("Failed to write default config")?;
            config
        };

        // Set computed paths that are skipped during serialization
        config.config_path = config_path;
        config.workspace_dir = workspace_dir;
        config.validate()?;
        tracing::debug!(
            path = %config.config_path.display(),
            workspace = %config.workspace_dir.display(),
            "Config loaded"
        );
        Ok(config)
    }

    /// Persist the config back to disk (write-tmp-then-rename).
    pub async fn save(&self) -> Result<()> {
        let rendered = toml::to_string_pretty(self)?;
        let tmp = self.config_path.with_extension("toml.tmp");
        fs::write(&tmp, rendered)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.config_path)
            .await
            .with_context(|| format!("Failed to replace {}", self.config_path.display()))?;
        Ok(())
    }

    /// Validate values that would cause runtime failures, instead of failing
    /// at arbitrary points later.
    pub fn validate(&self) -> Result<()> {
        if self.mail.poll_interval_secs == 0 {
            anyhow::bail!("mail.poll_interval_secs must be at least 1");
        }
        if self.mail.max_retries == 0 {
            anyhow::bail!("mail.max_retries must be at least 1");
        }
        if self.mail.delivery_timeout_secs == 0 {
            anyhow::bail!("mail.delivery_timeout_secs must be at least 1");
        }
        if self.reliability.daemon_max_backoff_secs < self.reliability.daemon_initial_backoff_secs {
            anyhow::bail!(
                "reliability.daemon_max_backoff_secs must be >= reliability.daemon_initial_backoff_secs"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert!(config.mail.enabled);
        assert_eq!(config.mail.poll_interval_secs, 30);
        assert_eq!(config.mail.max_retries, 3);
        assert_eq!(config.mail.retry_delay_secs, 300);
        assert_eq!(config.mail.delivery_timeout_secs, 30);
        assert_eq!(config.reliability.daemon_initial_backoff_secs, 2);
    }

    #[test]
    fn partial_toml_falls_back_to_field_defaults() {
        let config: Config = toml::from_str(
            r#"
            [mail]
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.mail.max_retries, 5);
        assert_eq!(config.mail.poll_interval_secs, 30);
        assert!(config.mail.enabled);
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let mut config = Config::default();
        config.mail.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_max_retries() {
        let mut config = Config::default();
        config.mail.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_backoff_bounds() {
        let mut config = Config::default();
        config.reliability.daemon_initial_backoff_secs = 120;
        config.reliability.daemon_max_backoff_secs = 60;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn load_or_init_creates_default_config_and_workspace() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("gastown-home");

        let config = Config::load_or_init_at(&dir).await.unwrap();
        assert!(dir.join("gastown.toml").exists());
        assert!(config.workspace_dir.ends_with("workspace"));
        assert!(config.workspace_dir.exists());
        assert!(config.mail.enabled);
    }

    #[tokio::test]
    async fn load_or_init_reads_existing_config() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("gastown-home");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("gastown.toml"),
            "[mail]\npoll_interval_secs = 7\nretry_delay_secs = 60\n",
        )
        .await
        .unwrap();

        let config = Config::load_or_init_at(&dir).await.unwrap();
        assert_eq!(config.mail.poll_interval_secs, 7);
        assert_eq!(config.mail.retry_delay_secs, 60);
        // Untouched sections keep their defaults.
        assert_eq!(config.mail.max_retries, 3);
    }

    #[tokio::test]
    async fn load_or_init_rejects_invalid_persisted_config() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("gastown-home");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("gastown.toml"), "[mail]\nmax_retries = 0\n")
            .await
            .unwrap();

        assert!(Config::load_or_init_at(&dir).await.is_err());
    }

    #[tokio::test]
    async fn save_round_trips_through_disk() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("gastown-home");
        let mut config = Config::load_or_init_at(&dir).await.unwrap();
        config.mail.poll_interval_secs = 12;
        config.save().await.unwrap();

        let reloaded = Config::load_or_init_at(&dir).await.unwrap();
        assert_eq!(reloaded.mail.poll_interval_secs, 12);
    }
}
