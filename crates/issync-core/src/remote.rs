//! Remote issue tracker contract
//!
//! The sync engine only talks to the tracker through [`RemoteProvider`].
//! Authentication is the provider's business and is assumed to be set up
//! before the engine runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::config::Repository;

/// Issue state as the remote tracker knows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RemoteState {
    #[default]
    Open,
    Closed,
}

impl std::fmt::Display for RemoteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteState::Open => write!(f, "open"),
            RemoteState::Closed => write!(f, "closed"),
        }
    }
}

/// An issue as fetched from the remote tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteIssue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub state: RemoteState,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Payload for creating a remote issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRemoteIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Full field set sent when updating a remote issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIssueUpdate {
    pub title: String,
    pub body: String,
    pub state: RemoteState,
    pub labels: Vec<String>,
}

/// Failures reported by a remote provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by remote tracker")]
    RateLimited,

    #[error("remote issue #{0} not found")]
    NotFound(u64),

    #[error("{0}")]
    Api(String),
}

/// Client for a remote issue tracker
pub trait RemoteProvider: Send + Sync {
    /// Fetch every issue (open and closed) of the repository
    fn fetch_all(&self, repo: &Repository) -> Result<Vec<RemoteIssue>, RemoteError>;

    /// Create an issue, returning it as the tracker stored it
    fn create(&self, repo: &Repository, issue: &NewRemoteIssue)
    -> Result<RemoteIssue, RemoteError>;

    /// Overwrite title, body, state and labels of an existing issue
    fn update(
        &self,
        repo: &Repository,
        number: u64,
        update: &RemoteIssueUpdate,
    ) -> Result<(), RemoteError>;
}

impl<P: RemoteProvider + ?Sized> RemoteProvider for &P {
    fn fetch_all(&self, repo: &Repository) -> Result<Vec<RemoteIssue>, RemoteError> {
        (**self).fetch_all(repo)
    }

    fn create(
        &self,
        repo: &Repository,
        issue: &NewRemoteIssue,
    ) -> Result<RemoteIssue, RemoteError> {
        (**self).create(repo, issue)
    }

    fn update(
        &self,
        repo: &Repository,
        number: u64,
        update: &RemoteIssueUpdate,
    ) -> Result<(), RemoteError> {
        (**self).update(repo, number, update)
    }
}

/// In-process tracker, one issue list per repository.
///
/// Timestamps are taken from the local clock at write time, like a server
/// would. Useful for dry runs and tests.
#[derive(Default)]
pub struct InMemoryRemote {
    repos: Mutex<HashMap<String, BTreeMap<u64, RemoteIssue>>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<u64, RemoteIssue>>> {
        self.repos.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an issue as-is, replacing any issue with the same number
    pub fn insert(&self, repo: &Repository, issue: RemoteIssue) {
        self.lock()
            .entry(repo.to_string())
            .or_default()
            .insert(issue.number, issue);
    }

    pub fn get(&self, repo: &Repository, number: u64) -> Option<RemoteIssue> {
        self.lock()
            .get(&repo.to_string())
            .and_then(|issues| issues.get(&number).cloned())
    }

    /// Edit an issue in place as a remote user would; bumps `updated_at`.
    pub fn edit(
        &self,
        repo: &Repository,
        number: u64,
        f: impl FnOnce(&mut RemoteIssue),
    ) -> Result<(), RemoteError> {
        let mut repos = self.lock();
        let issue = repos
            .get_mut(&repo.to_string())
            .and_then(|issues| issues.get_mut(&number))
            .ok_or(RemoteError::NotFound(number))?;
        f(issue);
        issue.updated_at = Utc::now();
        Ok(())
    }

    pub fn len(&self, repo: &Repository) -> usize {
        self.lock().get(&repo.to_string()).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, repo: &Repository) -> bool {
        self.len(repo) == 0
    }
}

impl RemoteProvider for InMemoryRemote {
    fn fetch_all(&self, repo: &Repository) -> Result<Vec<RemoteIssue>, RemoteError> {
        Ok(self
            .lock()
            .get(&repo.to_string())
            .map(|issues| issues.values().cloned().collect())
            .unwrap_or_default())
    }

    fn create(
        &self,
        repo: &Repository,
        issue: &NewRemoteIssue,
    ) -> Result<RemoteIssue, RemoteError> {
        let mut repos = self.lock();
        let issues = repos.entry(repo.to_string()).or_default();
        let number = issues.keys().next_back().map_or(1, |n| n + 1);
        let now = Utc::now();
        let created = RemoteIssue {
            number,
            title: issue.title.clone(),
            body: issue.body.clone(),
            state: RemoteState::Open,
            labels: issue.labels.clone(),
            url: format!("https://github.com/{repo}/issues/{number}"),
            created_at: now,
            updated_at: now,
            closed_at: None,
        };
        issues.insert(number, created.clone());
        Ok(created)
    }

    fn update(
        &self,
        repo: &Repository,
        number: u64,
        update: &RemoteIssueUpdate,
    ) -> Result<(), RemoteError> {
        let mut repos = self.lock();
        let issue = repos
            .get_mut(&repo.to_string())
            .and_then(|issues| issues.get_mut(&number))
            .ok_or(RemoteError::NotFound(number))?;
        let now = Utc::now();
        issue.closed_at = match (issue.state, update.state) {
            (RemoteState::Open, RemoteState::Closed) => Some(now),
            (_, RemoteState::Open) => None,
            (RemoteState::Closed, RemoteState::Closed) => issue.closed_at,
        };
        issue.title = update.title.clone();
        issue.body = update.body.clone();
        issue.state = update.state;
        issue.labels = update.labels.clone();
        issue.updated_at = now;
        Ok(())
    }
}
