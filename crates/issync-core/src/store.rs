//! JSON file store for issync issues
//!
//! The whole collection lives in `.issync/issues.json`. Every mutation
//! rewrites it through a temp file in the same directory that is then
//! renamed over the live file, so readers never see a partial write.

use crate::issue::{Issue, State, SyncStatus, validate_labels, validate_title};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;

const ISSYNC_DIR: &str = ".issync";
const ISSUES_FILE: &str = "issues.json";
const SEQUENCE_FILE: &str = "sequence";
const CONFIG_FILE: &str = "config.toml";

/// Predicate over issues for [`Store::list`]
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub state: Option<State>,
    pub label: Option<String>,
    pub sync_status: Option<SyncStatus>,
    /// `Some(true)` for issues with a remote id, `Some(false)` for unlinked ones
    pub linked: Option<bool>,
    /// Only issues that a push would pick up
    pub needs_push: bool,
}

impl IssueFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn sync_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = Some(status);
        self
    }

    pub fn linked(mut self, linked: bool) -> Self {
        self.linked = Some(linked);
        self
    }

    pub fn needs_push(mut self) -> Self {
        self.needs_push = true;
        self
    }

    pub fn matches(&self, issue: &Issue) -> bool {
        self.state.is_none_or(|s| issue.state == s)
            && self.label.as_deref().is_none_or(|l| issue.has_label(l))
            && self.sync_status.is_none_or(|s| issue.sync_status == s)
            && self.linked.is_none_or(|l| issue.remote_id.is_some() == l)
            && (!self.needs_push || issue.needs_push())
    }
}

#[derive(Clone)]
struct Inner {
    issues: BTreeMap<u64, Issue>,
    next_id: u64,
}

/// File-backed issue store
///
/// Safe to share between threads; one mutex serializes every
/// read-modify-persist sequence. Not meant for concurrent writers from
/// several processes.
pub struct Store {
    root: PathBuf,
    inner: Mutex<Inner>,
}

impl Store {
    /// Open the store rooted at `root` (the directory containing `.issync`)
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.join(ISSYNC_DIR).is_dir() {
            return Err(Error::NotInitialized);
        }
        let store = Self {
            root,
            inner: Mutex::new(Inner {
                issues: BTreeMap::new(),
                next_id: 1,
            }),
        };
        store.load()?;
        Ok(store)
    }

    /// Initialize a new store under `root`
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let dir = root.join(ISSYNC_DIR);

        if dir.exists() {
            return Err(Error::AlreadyInitialized(dir.display().to_string()));
        }

        fs::create_dir_all(&dir)?;
        fs::write(dir.join(CONFIG_FILE), crate::Config::default_with_comments())?;
        write_atomic(&dir.join(ISSUES_FILE), b"[]\n")?;

        Ok(Self {
            root,
            inner: Mutex::new(Inner {
                issues: BTreeMap::new(),
                next_id: 1,
            }),
        })
    }

    /// Find the store by walking up from `start`
    pub fn discover(start: &Path) -> Result<Self> {
        let mut current = start.to_path_buf();
        loop {
            if current.join(ISSYNC_DIR).is_dir() {
                return Self::open(current);
            }
            if !current.pop() {
                return Err(Error::NotInitialized);
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the .issync directory
    pub fn dir(&self) -> PathBuf {
        self.root.join(ISSYNC_DIR)
    }

    /// Path to issues.json
    pub fn issues_path(&self) -> PathBuf {
        self.dir().join(ISSUES_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir().join(CONFIG_FILE)
    }

    fn sequence_path(&self) -> PathBuf {
        self.dir().join(SEQUENCE_FILE)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(&self) -> Result<()> {
        let path = self.issues_path();
        let issues: Vec<Issue> = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Vec::new()
        };

        let sequence = match fs::read_to_string(self.sequence_path()) {
            Ok(content) => content.trim().parse::<u64>().unwrap_or(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let mut inner = self.lock();
        inner.issues.clear();
        for issue in issues {
            if inner.issues.contains_key(&issue.local_id) {
                return Err(Error::AlreadyExists(format!(
                    "duplicate local id {} in {}",
                    issue.local_id,
                    path.display()
                )));
            }
            inner.issues.insert(issue.local_id, issue);
        }
        let after_max = inner.issues.keys().next_back().map_or(1, |id| id + 1);
        inner.next_id = after_max.max(sequence).max(1);

        tracing::debug!(
            path = %path.display(),
            issues = inner.issues.len(),
            next_id = inner.next_id,
            "Loaded issue store"
        );
        Ok(())
    }

    /// Serialize the full collection and atomically replace issues.json
    fn persist(&self, inner: &Inner) -> Result<()> {
        let issues: Vec<&Issue> = inner.issues.values().collect();
        let mut bytes = serde_json::to_vec_pretty(&issues)?;
        bytes.push(b'\n');
        write_atomic(&self.issues_path(), &bytes)?;
        tracing::debug!(issues = issues.len(), "Persisted issue store");
        Ok(())
    }

    /// Run `f` against the in-memory state, then persist.
    ///
    /// If `f` or the write fails, the in-memory state is restored.
    fn mutate<T>(&self, f: impl FnOnce(&Self, &mut Inner) -> Result<T>) -> Result<T> {
        let mut inner = self.lock();
        let snapshot = (*inner).clone();
        let result = f(self, &mut *inner).and_then(|value| {
            self.persist(&*inner)?;
            Ok(value)
        });
        if result.is_err() {
            *inner = snapshot;
        }
        result
    }

    /// Create a new local issue
    pub fn add(&self, title: &str, body: &str) -> Result<Issue> {
        validate_title(title)?;
        self.insert_with(|id| Issue::new(id, title.to_string(), body.to_string()))
    }

    /// Allocate the next id, build an issue for it and persist it
    pub(crate) fn insert_with(&self, build: impl FnOnce(u64) -> Issue) -> Result<Issue> {
        self.mutate(|store, inner| {
            let id = inner.next_id;
            let mut issue = build(id);
            issue.local_id = id;
            check_invariants(inner, &issue)?;

            inner.next_id = id + 1;
            // high-water mark first, so an id is never handed out twice
            write_atomic(&store.sequence_path(), format!("{}\n", inner.next_id).as_bytes())?;
            inner.issues.insert(id, issue.clone());
            Ok(issue)
        })
    }

    /// Apply `f` to the current version of an issue and persist the result.
    ///
    /// Title, labels and remote-id uniqueness are re-checked afterwards;
    /// any failure leaves the stored issue untouched.
    pub(crate) fn modify(
        &self,
        local_id: u64,
        f: impl FnOnce(&mut Issue) -> Result<()>,
    ) -> Result<Issue> {
        self.mutate(|_, inner| {
            let mut issue = inner
                .issues
                .get(&local_id)
                .cloned()
                .ok_or_else(|| not_found(local_id))?;
            f(&mut issue)?;
            issue.local_id = local_id;
            check_invariants(inner, &issue)?;
            inner.issues.insert(local_id, issue.clone());
            Ok(issue)
        })
    }

    /// Get an issue by local id
    pub fn get(&self, local_id: u64) -> Result<Issue> {
        self.lock()
            .issues
            .get(&local_id)
            .cloned()
            .ok_or_else(|| not_found(local_id))
    }

    pub fn find_by_remote_id(&self, remote_id: u64) -> Option<Issue> {
        self.lock()
            .issues
            .values()
            .find(|i| i.remote_id == Some(remote_id))
            .cloned()
    }

    pub fn update_title(&self, local_id: u64, title: &str) -> Result<Issue> {
        validate_title(title)?;
        self.modify(local_id, |issue| {
            issue.title = title.to_string();
            issue.touch();
            Ok(())
        })
    }

    pub fn update_body(&self, local_id: u64, body: &str) -> Result<Issue> {
        self.modify(local_id, |issue| {
            issue.body = body.to_string();
            issue.touch();
            Ok(())
        })
    }

    pub fn update_state(&self, local_id: u64, state: State) -> Result<Issue> {
        self.modify(local_id, |issue| {
            issue.state = state;
            issue.touch();
            Ok(())
        })
    }

    /// Replace the label set
    pub fn update_labels<I, S>(&self, local_id: u64, labels: I) -> Result<Issue>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: BTreeSet<String> = labels.into_iter().map(Into::into).collect();
        validate_labels(&labels)?;
        self.modify(local_id, |issue| {
            issue.labels = labels;
            issue.touch();
            Ok(())
        })
    }

    pub fn add_label(&self, local_id: u64, label: &str) -> Result<Issue> {
        let mut labels = self.get(local_id)?.labels;
        labels.insert(label.to_string());
        self.update_labels(local_id, labels)
    }

    pub fn remove_label(&self, local_id: u64, label: &str) -> Result<Issue> {
        let mut labels = self.get(local_id)?.labels;
        if !labels.remove(label) {
            return Err(Error::NotFound(format!(
                "label '{label}' on issue #{local_id}"
            )));
        }
        self.update_labels(local_id, labels)
    }

    /// Set the sync marker without touching `updated_at`
    pub fn update_sync_status(&self, local_id: u64, status: SyncStatus) -> Result<Issue> {
        self.modify(local_id, |issue| {
            issue.sync_status = status;
            if status != SyncStatus::Error {
                issue.sync_error = None;
            }
            Ok(())
        })
    }

    /// Link an issue to a remote issue number, or unlink it with `None`.
    ///
    /// Unlinking drops the sync baseline, so the next push creates a new
    /// remote issue. Does not touch `updated_at`.
    pub fn link_remote(&self, local_id: u64, remote_id: Option<u64>) -> Result<Issue> {
        self.modify(local_id, |issue| {
            if issue.remote_id != remote_id {
                issue.last_synced_at = None;
                issue.sync_base = None;
                issue.sync_status = SyncStatus::Syncing;
            }
            issue.remote_id = remote_id;
            Ok(())
        })
    }

    /// Snapshot of matching issues, ordered by local id
    pub fn list(&self, filter: &IssueFilter) -> Vec<Issue> {
        self.lock()
            .issues
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect()
    }

    /// Delete an issue locally. What happens to its remote twin is the caller's call.
    pub fn remove(&self, local_id: u64) -> Result<Issue> {
        self.mutate(|_, inner| inner.issues.remove(&local_id).ok_or_else(|| not_found(local_id)))
    }

    pub fn len(&self) -> usize {
        self.lock().issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_found(local_id: u64) -> Error {
    Error::NotFound(format!("#{local_id}"))
}

fn check_invariants(inner: &Inner, issue: &Issue) -> Result<()> {
    validate_title(&issue.title)?;
    validate_labels(&issue.labels)?;
    if let Some(remote_id) = issue.remote_id
        && let Some(other) = inner
            .issues
            .values()
            .find(|i| i.local_id != issue.local_id && i.remote_id == Some(remote_id))
    {
        return Err(Error::AlreadyExists(format!(
            "remote issue #{remote_id} is already linked to #{}",
            other.local_id
        )));
    }
    Ok(())
}

/// Write `bytes` to a temp file next to `path`, fsync it, and rename it over `path`.
///
/// The temp file is removed if anything fails before the rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::persistence(path, std::io::ErrorKind::InvalidInput.into()))?;
    let mut temp = NamedTempFile::new_in(dir).map_err(|e| Error::persistence(path, e))?;
    temp.write_all(bytes)
        .and_then(|()| temp.flush())
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| Error::persistence(path, e))?;
    temp.persist(path)
        .map_err(|e| Error::persistence(path, e.error))?;
    Ok(())
}
