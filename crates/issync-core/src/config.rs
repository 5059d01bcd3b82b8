//! Configuration for issync
//!
//! Stored in .issync/config.toml. The sync engine never reads this file;
//! callers build [`crate::sync::SyncOptions`] from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Remote repository identifier (`owner/name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Repository {
    pub owner: String,
    pub name: String,
}

impl std::str::FromStr for Repository {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            crate::Error::Configuration(format!("repository must be 'owner/name', got '{s}'"))
        };
        let (owner, name) = s.trim().split_once('/').ok_or_else(invalid)?;
        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !valid(owner) || !valid(name) {
            return Err(invalid());
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl TryFrom<String> for Repository {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Repository> for String {
    fn from(repo: Repository) -> Self {
        repo.to_string()
    }
}

impl std::fmt::Display for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Which phases a sync run performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Pull,
    Push,
    #[default]
    Bidirectional,
}

impl std::str::FromStr for SyncDirection {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pull" => Ok(SyncDirection::Pull),
            "push" => Ok(SyncDirection::Push),
            "bidirectional" | "both" => Ok(SyncDirection::Bidirectional),
            _ => Err(crate::Error::Configuration(format!(
                "unknown sync direction '{s}' (expected pull, push or bidirectional)"
            ))),
        }
    }
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::Pull => write!(f, "pull"),
            SyncDirection::Push => write!(f, "push"),
            SyncDirection::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

/// issync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote sync settings
    pub sync: SyncConfig,

    /// Display settings
    pub display: DisplayConfig,
}

/// Remote sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote repository (`owner/name`); sync refuses to run without it
    pub repository: Option<Repository>,

    /// Default direction for `issync sync`
    pub direction: SyncDirection,

    /// Sync automatically after local mutations
    pub auto_sync: bool,

    /// Minimum minutes between automatic syncs
    pub interval_minutes: u32,

    /// Finish time of the last successful sync
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            repository: None,
            direction: SyncDirection::Bidirectional,
            auto_sync: false,
            interval_minutes: 15,
            last_synced_at: None,
        }
    }
}

impl SyncConfig {
    /// Whether an automatic sync is due at `now`
    pub fn auto_sync_due(&self, now: DateTime<Utc>) -> bool {
        if !self.auto_sync || self.repository.is_none() {
            return false;
        }
        match self.last_synced_at {
            Some(last) => now - last >= chrono::Duration::minutes(i64::from(self.interval_minutes)),
            None => true,
        }
    }
}

/// Display configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Use colors in output
    pub colors: bool,

    /// Date format for display
    pub date_format: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            colors: true,
            date_format: "%Y-%m-%d %H:%M".to_string(),
        }
    }
}

impl Config {
    /// Load config from a TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Configuration(format!("Invalid config: {}", e)))?;
        Ok(config)
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            crate::Error::Configuration(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The configured repository, or a configuration error
    pub fn repository(&self) -> crate::Result<&Repository> {
        self.sync.repository.as_ref().ok_or_else(|| {
            crate::Error::Configuration(
                "no repository configured; run 'issync config set sync.repository owner/name'"
                    .into(),
            )
        })
    }

    /// Generate a default config file with comments
    pub fn default_with_comments() -> String {
        r#"# issync configuration

[sync]
# Remote repository to mirror issues with (owner/name)
# repository = "owner/name"

# Default sync direction: pull, push or bidirectional
direction = "bidirectional"

# Sync automatically after local changes
auto_sync = false

# Minimum minutes between automatic syncs
interval_minutes = 15

[display]
# Use colors in output
colors = true

# Date format for display (strftime format)
date_format = "%Y-%m-%d %H:%M"
"#
        .to_string()
    }
}
