//! Issue data model for issync
//!
//! One record per locally tracked issue, optionally linked to a remote
//! tracker issue by number.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::remote::RemoteState;

/// Maximum title length, in characters.
pub const MAX_TITLE_LEN: usize = 1000;

/// Local issue state
///
/// Richer than the remote tracker's open/closed pair; see [`crate::mapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum State {
    #[default]
    Open,
    InProgress,
    Closed,
}

impl State {
    pub fn is_open(&self) -> bool {
        matches!(self, State::Open | State::InProgress)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, State::Closed)
    }
}

impl std::str::FromStr for State {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(State::Open),
            "in_progress" | "in-progress" | "inprogress" => Ok(State::InProgress),
            "closed" => Ok(State::Closed),
            _ => Err(crate::Error::Validation(format!("unknown state '{s}'"))),
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Open => write!(f, "open"),
            State::InProgress => write!(f, "in_progress"),
            State::Closed => write!(f, "closed"),
        }
    }
}

/// Outcome of the last sync attempt for an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Synced,
    /// A push is pending or in flight.
    Syncing,
    Error,
}

impl std::str::FromStr for SyncStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "synced" => Ok(SyncStatus::Synced),
            "syncing" => Ok(SyncStatus::Syncing),
            "error" => Ok(SyncStatus::Error),
            _ => Err(crate::Error::Validation(format!("unknown sync status '{s}'"))),
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// Field values both sides agreed on at `last_synced_at`.
///
/// Lets the merge tell which side actually changed a given field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBase {
    pub title: String,
    pub body: String,
    pub state: RemoteState,
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

/// Core issue structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Store-assigned identifier, never reused
    pub local_id: u64,

    /// Remote tracker issue number, once linked
    pub remote_id: Option<u64>,

    pub title: String,

    #[serde(default)]
    pub body: String,

    pub state: State,

    #[serde(default)]
    pub labels: BTreeSet<String>,

    pub created_at: DateTime<Utc>,

    /// Bumped on every local content change
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub sync_status: SyncStatus,

    pub last_synced_at: Option<DateTime<Utc>>,

    /// Message from the last failed sync attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_base: Option<SyncBase>,
}

impl Issue {
    /// Create a new, unlinked issue
    pub fn new(local_id: u64, title: String, body: String) -> Self {
        let now = Utc::now();
        Self {
            local_id,
            remote_id: None,
            title,
            body,
            state: State::Open,
            labels: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::Synced,
            last_synced_at: None,
            sync_error: None,
            sync_base: None,
        }
    }

    /// Whether a push should pick this issue up
    pub fn needs_push(&self) -> bool {
        self.remote_id.is_none() || self.sync_status != SyncStatus::Synced
    }

    /// Whether the issue was edited locally after its last sync
    pub fn changed_since_sync(&self) -> bool {
        match self.last_synced_at {
            Some(synced) => self.updated_at > synced,
            None => true,
        }
    }

    /// Record a content change: bump `updated_at` and request a push.
    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.sync_status = SyncStatus::Syncing;
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.remote_id {
            Some(remote) => write!(
                f,
                "#{} (remote #{}) [{}] {}",
                self.local_id, remote, self.state, self.title
            ),
            None => write!(f, "#{} [{}] {}", self.local_id, self.state, self.title),
        }
    }
}

/// Validate an issue title: non-empty after trimming, at most [`MAX_TITLE_LEN`] chars.
pub fn validate_title(title: &str) -> crate::Result<()> {
    if title.trim().is_empty() {
        return Err(crate::Error::Validation("title must not be empty".into()));
    }
    let len = title.chars().count();
    if len > MAX_TITLE_LEN {
        return Err(crate::Error::Validation(format!(
            "title is {len} characters, maximum is {MAX_TITLE_LEN}"
        )));
    }
    Ok(())
}

/// Validate a label set: no blank labels.
pub fn validate_labels<'a>(labels: impl IntoIterator<Item = &'a String>) -> crate::Result<()> {
    for label in labels {
        if label.trim().is_empty() {
            return Err(crate::Error::Validation("labels must not be blank".into()));
        }
    }
    Ok(())
}
