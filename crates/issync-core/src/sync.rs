//! Bidirectional sync between the local store and a remote tracker
//!
//! Pull brings remote issues into the store, merging field by field.
//! Push sends local issues that are unlinked or marked for re-sync.
//! Every issue is handled on its own: a failure is recorded in the
//! [`SyncResult`] and the run moves on to the next issue.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{Repository, SyncDirection};
use crate::issue::{Issue, SyncStatus};
use crate::mapper::{
    base_from_local, base_from_remote, local_labels_to_remote, local_state_to_remote,
    merge_state, remote_labels_to_local, remote_state_to_local,
};
use crate::remote::{NewRemoteIssue, RemoteIssue, RemoteIssueUpdate, RemoteProvider, RemoteState};
use crate::store::{IssueFilter, Store};
use crate::{Error, Result};

/// Settings for one engine instance
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Remote repository; every entry point except [`SyncEngine::pull_issues`] requires it
    pub repository: Option<Repository>,
}

impl SyncOptions {
    pub fn new(repository: Repository) -> Self {
        Self {
            repository: Some(repository),
        }
    }
}

/// Cooperative cancellation flag shared between the engine and its caller.
///
/// Once cancelled, no new per-issue operation starts; the one in flight
/// finishes and is persisted normally.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Pull,
    Push,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Pull => write!(f, "pull"),
            SyncPhase::Push => write!(f, "push"),
        }
    }
}

/// One failure recorded during a sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncIssueError {
    pub phase: SyncPhase,
    pub local_id: Option<u64>,
    pub remote_id: Option<u64>,
    pub message: String,
}

impl std::fmt::Display for SyncIssueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.local_id, self.remote_id) {
            (Some(local), Some(remote)) => write!(
                f,
                "{} issue #{} (remote #{}): {}",
                self.phase, local, remote, self.message
            ),
            (Some(local), None) => write!(f, "{} issue #{}: {}", self.phase, local, self.message),
            (None, Some(remote)) => write!(
                f,
                "{} remote issue #{}: {}",
                self.phase, remote, self.message
            ),
            (None, None) => write!(f, "{}: {}", self.phase, self.message),
        }
    }
}

/// Outcome of a sync run
///
/// Counts are authoritative even when some issues failed. `success` only
/// turns false on a phase-level failure (such as the remote fetch failing);
/// per-issue failures are listed in `errors`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub created_local: usize,
    pub updated_local: usize,
    pub created_remote: usize,
    pub updated_remote: usize,
    /// Remote issues already reflected locally
    pub skipped: usize,
    pub errors: Vec<SyncIssueError>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Default for SyncResult {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncResult {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            success: true,
            created_local: 0,
            updated_local: 0,
            created_remote: 0,
            updated_remote: 0,
            skipped: 0,
            errors: Vec::new(),
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }

    /// Fold another phase's result into this one
    pub fn merge(&mut self, other: SyncResult) {
        self.success &= other.success;
        self.created_local += other.created_local;
        self.updated_local += other.updated_local;
        self.created_remote += other.created_remote;
        self.updated_remote += other.updated_remote;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
        self.cancelled |= other.cancelled;
        self.started_at = self.started_at.min(other.started_at);
        self.finished_at = self.finished_at.max(other.finished_at);
    }

    /// Number of issues created or updated on either side
    pub fn total_changes(&self) -> usize {
        self.created_local + self.updated_local + self.created_remote + self.updated_remote
    }

    /// True when the run changed nothing and hit no errors
    pub fn is_noop(&self) -> bool {
        self.total_changes() == 0 && self.errors.is_empty()
    }

    fn fail(&mut self, phase: SyncPhase, message: String) {
        self.success = false;
        self.errors.push(SyncIssueError {
            phase,
            local_id: None,
            remote_id: None,
            message,
        });
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

impl std::fmt::Display for SyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created locally, {} updated locally, {} created remotely, {} updated remotely",
            self.created_local, self.updated_local, self.created_remote, self.updated_remote
        )?;
        match self.errors.len() {
            0 => {}
            1 => write!(f, ", 1 error")?,
            n => write!(f, ", {n} errors")?,
        }
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

enum PullOutcome {
    Created,
    Updated,
    Unchanged,
    Skipped,
}

enum PushOutcome {
    Created,
    Updated,
}

/// Orchestrates pull, push and bidirectional runs
///
/// Holds no state of its own between runs; the store is the only source of
/// truth.
pub struct SyncEngine<P> {
    store: Arc<Store>,
    provider: P,
    options: SyncOptions,
    cancel: CancelToken,
}

impl<P: RemoteProvider> SyncEngine<P> {
    pub fn new(store: Arc<Store>, provider: P, options: SyncOptions) -> Self {
        Self {
            store,
            provider,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Use a caller-owned cancellation token
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn repository(&self) -> Result<&Repository> {
        self.options.repository.as_ref().ok_or_else(|| {
            Error::Configuration("no repository configured for sync".into())
        })
    }

    /// Run the phases selected by `direction`
    pub fn run(&self, direction: SyncDirection) -> Result<SyncResult> {
        match direction {
            SyncDirection::Pull => self.pull(),
            SyncDirection::Push => self.push(),
            SyncDirection::Bidirectional => self.bidirectional(),
        }
    }

    /// Pull, then push. Both phases run even if the pull fetch fails.
    pub fn bidirectional(&self) -> Result<SyncResult> {
        self.repository()?;
        let mut result = self.pull()?;
        result.merge(self.push()?);
        Ok(result)
    }

    /// Fetch every remote issue and merge it into the store
    pub fn pull(&self) -> Result<SyncResult> {
        let repo = self.repository()?;
        if self.cancel.is_cancelled() {
            let mut result = SyncResult::new();
            result.cancelled = true;
            return Ok(result);
        }
        tracing::info!(repository = %repo, "Pull started");

        // taken before the fetch: later remote edits must not look stale
        let fetched_at = Utc::now();
        match self.provider.fetch_all(repo) {
            Ok(remote_issues) => Ok(self.pull_fetched(&remote_issues, fetched_at)),
            Err(e) => {
                tracing::error!(repository = %repo, error = %e, "Fetching remote issues failed");
                let mut result = SyncResult::new();
                result.fail(SyncPhase::Pull, format!("fetching remote issues failed: {e}"));
                Ok(result.finish())
            }
        }
    }

    /// Merge already-fetched remote issues into the store, as read now
    pub fn pull_issues(&self, remote_issues: &[RemoteIssue]) -> SyncResult {
        self.pull_fetched(remote_issues, Utc::now())
    }

    /// Merge remote issues read at `fetched_at` into the store.
    ///
    /// `fetched_at` becomes the new `last_synced_at`, so it must not be
    /// later than the moment the snapshot was taken.
    pub fn pull_fetched(&self, remote_issues: &[RemoteIssue], fetched_at: DateTime<Utc>) -> SyncResult {
        let mut result = SyncResult::new();

        for remote in remote_issues {
            if self.cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            match self.pull_one(remote, fetched_at) {
                Ok(PullOutcome::Created) => result.created_local += 1,
                Ok(PullOutcome::Updated) => result.updated_local += 1,
                Ok(PullOutcome::Unchanged) => {}
                Ok(PullOutcome::Skipped) => result.skipped += 1,
                Err(e) => {
                    let local_id = self.store.find_by_remote_id(remote.number).map(|i| i.local_id);
                    tracing::warn!(remote_id = remote.number, error = %e, "Pulling issue failed");
                    result.errors.push(SyncIssueError {
                        phase: SyncPhase::Pull,
                        local_id,
                        remote_id: Some(remote.number),
                        message: e.to_string(),
                    });
                }
            }
        }

        let result = result.finish();
        tracing::info!(
            created = result.created_local,
            updated = result.updated_local,
            skipped = result.skipped,
            errors = result.errors.len(),
            "Pull finished"
        );
        result
    }

    fn pull_one(&self, remote: &RemoteIssue, fetched_at: DateTime<Utc>) -> Result<PullOutcome> {
        let Some(local) = self.store.find_by_remote_id(remote.number) else {
            let created = self
                .store
                .insert_with(|local_id| issue_from_remote(local_id, remote, fetched_at))?;
            tracing::debug!(local_id = created.local_id, remote_id = remote.number, "Created local issue");
            return Ok(PullOutcome::Created);
        };

        if is_stale(&local, remote) {
            return Ok(PullOutcome::Skipped);
        }

        let mut outcome = PullOutcome::Unchanged;
        self.store.modify(local.local_id, |issue| {
            // the issue may have changed since the lookup
            if is_stale(issue, remote) {
                outcome = PullOutcome::Skipped;
                return Ok(());
            }
            if merge_remote(issue, remote, fetched_at) {
                outcome = PullOutcome::Updated;
            }
            Ok(())
        })?;
        Ok(outcome)
    }

    /// Push every issue that is unlinked or not yet synced
    pub fn push(&self) -> Result<SyncResult> {
        self.repository()?;
        let pending = self.store.list(&IssueFilter::all().needs_push());
        self.push_issues(&pending)
    }

    /// Push the given issues, creating or updating their remote twins
    pub fn push_issues(&self, issues: &[Issue]) -> Result<SyncResult> {
        let repo = self.repository()?;
        tracing::info!(repository = %repo, pending = issues.len(), "Push started");
        let mut result = SyncResult::new();

        for issue in issues {
            if self.cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            match self.push_one(repo, issue.local_id) {
                Ok(PushOutcome::Created) => result.created_remote += 1,
                Ok(PushOutcome::Updated) => result.updated_remote += 1,
                Err(e) => {
                    tracing::warn!(local_id = issue.local_id, error = %e, "Pushing issue failed");
                    let message = e.to_string();
                    let remote_id = self
                        .store
                        .modify(issue.local_id, |i| {
                            i.sync_status = SyncStatus::Error;
                            i.sync_error = Some(message.clone());
                            Ok(())
                        })
                        .map(|i| i.remote_id)
                        .unwrap_or(issue.remote_id);
                    result.errors.push(SyncIssueError {
                        phase: SyncPhase::Push,
                        local_id: Some(issue.local_id),
                        remote_id,
                        message,
                    });
                }
            }
        }

        let result = result.finish();
        tracing::info!(
            created = result.created_remote,
            updated = result.updated_remote,
            errors = result.errors.len(),
            "Push finished"
        );
        Ok(result)
    }

    fn push_one(&self, repo: &Repository, local_id: u64) -> Result<PushOutcome> {
        // work from the stored version, not the caller's snapshot
        let issue = self.store.update_sync_status(local_id, SyncStatus::Syncing)?;
        let pushed = base_from_local(&issue);
        // the remote write lands after this, so the next pull sees it as new
        let started_at = Utc::now();

        let (number, outcome) = match issue.remote_id {
            None => {
                let created = self.provider.create(
                    repo,
                    &NewRemoteIssue {
                        title: issue.title.clone(),
                        body: issue.body.clone(),
                        labels: local_labels_to_remote(&issue.labels),
                    },
                )?;
                // creation always opens; closing takes a second call
                if pushed.state == RemoteState::Closed
                    && let Err(e) =
                        self.provider
                            .update(repo, created.number, &update_from_local(&issue))
                {
                    // keep the link so the retry updates instead of duplicating
                    self.store.modify(local_id, |i| {
                        i.remote_id = Some(created.number);
                        i.last_synced_at = Some(started_at);
                        i.sync_base = Some(base_from_remote(&created));
                        Ok(())
                    })?;
                    return Err(e.into());
                }
                (created.number, PushOutcome::Created)
            }
            Some(number) => {
                self.provider
                    .update(repo, number, &update_from_local(&issue))?;
                (number, PushOutcome::Updated)
            }
        };

        self.store.modify(local_id, |i| {
            i.remote_id = Some(number);
            i.last_synced_at = Some(started_at);
            // an edit made while the remote call was in flight stays pending
            i.sync_status = if base_from_local(i) == pushed {
                SyncStatus::Synced
            } else {
                SyncStatus::Syncing
            };
            i.sync_error = None;
            i.sync_base = Some(pushed);
            Ok(())
        })?;
        tracing::debug!(local_id, remote_id = number, "Pushed issue");
        Ok(outcome)
    }
}

/// A remote change is already reflected when it predates the last sync.
fn is_stale(issue: &Issue, remote: &RemoteIssue) -> bool {
    issue
        .last_synced_at
        .is_some_and(|synced| remote.updated_at <= synced)
}

fn issue_from_remote(local_id: u64, remote: &RemoteIssue, synced_at: DateTime<Utc>) -> Issue {
    let mut issue = Issue::new(local_id, remote.title.clone(), remote.body.clone());
    issue.remote_id = Some(remote.number);
    issue.state = remote_state_to_local(remote.state);
    issue.labels = remote_labels_to_local(&remote.labels);
    issue.created_at = remote.created_at.min(synced_at);
    issue.updated_at = synced_at;
    issue.last_synced_at = Some(synced_at);
    issue.sync_status = SyncStatus::Synced;
    issue.sync_base = Some(base_from_remote(remote));
    issue
}

fn update_from_local(issue: &Issue) -> RemoteIssueUpdate {
    RemoteIssueUpdate {
        title: issue.title.clone(),
        body: issue.body.clone(),
        state: local_state_to_remote(issue.state),
        labels: local_labels_to_remote(&issue.labels),
    }
}

/// Timestamp facts shared by every field of one merge
struct Clocks {
    local_after_sync: bool,
    remote_after_sync: bool,
    remote_newer: bool,
}

impl Clocks {
    /// Whether the remote value of one field should replace the local one.
    ///
    /// A side only counts as having changed a field if its record moved past
    /// the last sync and the field differs from the agreed base value.
    fn take_remote<T: PartialEq>(&self, local: &T, remote: &T, base: Option<&T>) -> bool {
        if local == remote {
            return false;
        }
        let remote_changed = self.remote_after_sync && base.is_none_or(|b| b != remote);
        let local_changed = self.local_after_sync && base.is_none_or(|b| b != local);
        remote_changed && (!local_changed || self.remote_newer)
    }
}

/// Merge one remote issue into its local twin, field by field.
///
/// Returns whether any field changed. Always moves `last_synced_at` to
/// `synced_at` (when the remote snapshot was read) and records the remote
/// values as the new base.
pub(crate) fn merge_remote(issue: &mut Issue, remote: &RemoteIssue, synced_at: DateTime<Utc>) -> bool {
    let remote_labels = remote_labels_to_local(&remote.labels);
    let local_state = local_state_to_remote(issue.state);

    let (title, body, state, labels) = match issue.last_synced_at {
        // first sync: remote wins every field
        None => (
            issue.title != remote.title,
            issue.body != remote.body,
            local_state != remote.state,
            issue.labels != remote_labels,
        ),
        Some(synced) => {
            let clocks = Clocks {
                local_after_sync: issue.updated_at > synced,
                remote_after_sync: remote.updated_at > synced,
                remote_newer: remote.updated_at > issue.updated_at,
            };
            let base = issue.sync_base.as_ref();
            (
                clocks.take_remote(&issue.title, &remote.title, base.map(|b| &b.title)),
                clocks.take_remote(&issue.body, &remote.body, base.map(|b| &b.body)),
                clocks.take_remote(&local_state, &remote.state, base.map(|b| &b.state)),
                clocks.take_remote(&issue.labels, &remote_labels, base.map(|b| &b.labels)),
            )
        }
    };

    if title {
        issue.title = remote.title.clone();
    }
    if body {
        issue.body = remote.body.clone();
    }
    if state {
        issue.state = merge_state(issue.state, remote.state);
    }
    if labels {
        issue.labels = remote_labels;
    }

    let changed = title || body || state || labels;
    if changed {
        // a local edit made after the fetch keeps its later timestamp
        issue.updated_at = issue.updated_at.max(synced_at);
    }
    issue.last_synced_at = Some(synced_at);

    let remote_base = base_from_remote(remote);
    if base_from_local(issue) == remote_base {
        issue.sync_status = SyncStatus::Synced;
        issue.sync_error = None;
    } else {
        // local values won somewhere; they still have to go out
        issue.sync_status = SyncStatus::Syncing;
    }
    issue.sync_base = Some(remote_base);
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::State;
    use crate::remote::{InMemoryRemote, RemoteError};
    use chrono::Duration;
    use std::collections::{BTreeSet, HashSet};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn repo() -> Repository {
        "acme/widgets".parse().unwrap()
    }

    fn new_store() -> (TempDir, Arc<Store>) {
        let dir = TempDir::new().unwrap();
        let store = Store::init(dir.path()).unwrap();
        (dir, Arc::new(store))
    }

    fn engine<P: RemoteProvider>(store: &Arc<Store>, provider: P) -> SyncEngine<P> {
        SyncEngine::new(Arc::clone(store), provider, SyncOptions::new(repo()))
    }

    fn remote_issue(number: u64, title: &str, updated_at: DateTime<Utc>) -> RemoteIssue {
        RemoteIssue {
            number,
            title: title.to_string(),
            body: String::new(),
            state: RemoteState::Open,
            labels: Vec::new(),
            url: format!("https://github.com/acme/widgets/issues/{number}"),
            created_at: updated_at - Duration::days(1),
            updated_at,
            closed_at: None,
        }
    }

    /// Wraps the in-memory tracker and fails writes for chosen titles.
    struct FlakyRemote {
        inner: InMemoryRemote,
        failing_titles: Mutex<HashSet<String>>,
        fail_fetch: bool,
    }

    impl FlakyRemote {
        fn new() -> Self {
            Self {
                inner: InMemoryRemote::new(),
                failing_titles: Mutex::new(HashSet::new()),
                fail_fetch: false,
            }
        }

        fn fail_for(&self, title: &str) {
            self.failing_titles.lock().unwrap().insert(title.to_string());
        }

        fn check(&self, title: &str) -> std::result::Result<(), RemoteError> {
            if self.failing_titles.lock().unwrap().contains(title) {
                return Err(RemoteError::Network("connection reset".into()));
            }
            Ok(())
        }
    }

    impl RemoteProvider for FlakyRemote {
        fn fetch_all(&self, repo: &Repository) -> std::result::Result<Vec<RemoteIssue>, RemoteError> {
            if self.fail_fetch {
                return Err(RemoteError::Auth("token expired".into()));
            }
            self.inner.fetch_all(repo)
        }

        fn create(
            &self,
            repo: &Repository,
            issue: &NewRemoteIssue,
        ) -> std::result::Result<RemoteIssue, RemoteError> {
            self.check(&issue.title)?;
            self.inner.create(repo, issue)
        }

        fn update(
            &self,
            repo: &Repository,
            number: u64,
            update: &RemoteIssueUpdate,
        ) -> std::result::Result<(), RemoteError> {
            self.check(&update.title)?;
            self.inner.update(repo, number, update)
        }
    }

    #[test]
    fn test_pull_creates_local_issues() {
        let (_dir, store) = new_store();
        let engine = engine(&store, InMemoryRemote::new());
        let now = Utc::now();
        let mut remote = remote_issue(7, "Crash on start", now - Duration::minutes(5));
        remote.body = "stack trace".into();
        remote.state = RemoteState::Closed;
        remote.labels = vec!["bug".into(), "p1".into()];

        let result = engine.pull_issues(&[remote]);
        assert_eq!(result.created_local, 1);
        assert!(result.errors.is_empty());

        let issue = store.find_by_remote_id(7).unwrap();
        assert_eq!(issue.title, "Crash on start");
        assert_eq!(issue.body, "stack trace");
        assert_eq!(issue.state, State::Closed);
        assert!(issue.has_label("p1"));
        assert_eq!(issue.sync_status, SyncStatus::Synced);
        assert!(issue.last_synced_at.is_some());
        assert!(!issue.needs_push());
    }

    #[test]
    fn test_pull_invalid_remote_issue_is_recorded_and_skipped() {
        let (_dir, store) = new_store();
        let engine = engine(&store, InMemoryRemote::new());
        let now = Utc::now();
        let bad = remote_issue(1, "   ", now);
        let good = remote_issue(2, "fine", now);

        let result = engine.pull_issues(&[bad, good]);
        assert!(result.success);
        assert_eq!(result.created_local, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].remote_id, Some(1));
        assert!(result.errors[0].to_string().contains("remote issue #1"));
    }

    #[test]
    fn test_first_sync_remote_overwrites_every_field() {
        let (_dir, store) = new_store();
        let local = store.add("local title", "local body").unwrap();
        store.update_state(local.local_id, State::Closed).unwrap();
        store.update_labels(local.local_id, ["local"]).unwrap();
        store.link_remote(local.local_id, Some(3)).unwrap();

        let mut remote = remote_issue(3, "remote title", Utc::now() - Duration::hours(2));
        remote.body = "remote body".into();
        remote.labels = vec!["remote".into()];

        let engine = engine(&store, InMemoryRemote::new());
        let result = engine.pull_issues(&[remote]);
        assert_eq!(result.updated_local, 1);

        let issue = store.get(local.local_id).unwrap();
        assert_eq!(issue.title, "remote title");
        assert_eq!(issue.body, "remote body");
        assert_eq!(issue.state, State::Open);
        assert_eq!(issue.labels, BTreeSet::from(["remote".to_string()]));
        assert_eq!(issue.sync_status, SyncStatus::Synced);
        assert!(issue.last_synced_at.is_some());
    }

    /// Store an issue linked to remote #1 that last synced at `t0`.
    fn synced_issue(store: &Store, t0: DateTime<Utc>) -> Issue {
        store
            .insert_with(|id| {
                let mut issue = Issue::new(id, "orig title".into(), "orig body".into());
                issue.remote_id = Some(1);
                issue.created_at = t0 - Duration::days(1);
                issue.updated_at = t0;
                issue.last_synced_at = Some(t0);
                issue.sync_base = Some(base_from_local(&issue));
                issue
            })
            .unwrap()
    }

    #[test]
    fn test_field_level_merge_keeps_both_edits() {
        let (_dir, store) = new_store();
        let t0 = Utc::now() - Duration::hours(1);
        let issue = synced_issue(&store, t0);

        store
            .modify(issue.local_id, |i| {
                i.title = "local title".into();
                i.updated_at = t0 + Duration::seconds(1);
                i.sync_status = SyncStatus::Syncing;
                Ok(())
            })
            .unwrap();

        let mut remote = remote_issue(1, "orig title", t0 + Duration::seconds(2));
        remote.body = "remote body".into();

        let engine = engine(&store, InMemoryRemote::new());
        let result = engine.pull_issues(&[remote]);
        assert_eq!(result.updated_local, 1);

        let merged = store.get(issue.local_id).unwrap();
        assert_eq!(merged.title, "local title");
        assert_eq!(merged.body, "remote body");
        // the local title still has to reach the remote side
        assert_eq!(merged.sync_status, SyncStatus::Syncing);
        assert!(merged.needs_push());
    }

    #[test]
    fn test_same_field_conflict_newest_wins() {
        let t0 = Utc::now() - Duration::hours(1);
        let mut issue = Issue::new(1, "orig".into(), String::new());
        issue.remote_id = Some(1);
        issue.last_synced_at = Some(t0);
        issue.updated_at = t0;
        issue.sync_base = Some(base_from_local(&issue));

        // local edit is newer than the remote one
        let mut local_newer = issue.clone();
        local_newer.title = "local".into();
        local_newer.updated_at = t0 + Duration::seconds(20);
        let remote = remote_issue(1, "remote", t0 + Duration::seconds(10));
        merge_remote(&mut local_newer, &remote, Utc::now());
        assert_eq!(local_newer.title, "local");

        // remote edit is newer than the local one
        let mut remote_newer = issue.clone();
        remote_newer.title = "local".into();
        remote_newer.updated_at = t0 + Duration::seconds(5);
        merge_remote(&mut remote_newer, &remote, Utc::now());
        assert_eq!(remote_newer.title, "remote");
    }

    #[test]
    fn test_stale_remote_issue_is_skipped() {
        let (_dir, store) = new_store();
        let t0 = Utc::now() - Duration::hours(1);
        let issue = synced_issue(&store, t0);

        let mut remote = remote_issue(1, "older title", t0 - Duration::minutes(1));
        remote.body = "older body".into();

        let engine = engine(&store, InMemoryRemote::new());
        let result = engine.pull_issues(&[remote]);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.total_changes(), 0);
        assert!(result.errors.is_empty());
        assert_eq!(store.get(issue.local_id).unwrap(), issue);
    }

    #[test]
    fn test_merge_without_changes_still_moves_baseline() {
        let (_dir, store) = new_store();
        let t0 = Utc::now() - Duration::hours(1);
        let issue = synced_issue(&store, t0);

        let mut remote = remote_issue(1, "orig title", t0 + Duration::minutes(1));
        remote.body = "orig body".into();

        let engine = engine(&store, InMemoryRemote::new());
        let result = engine.pull_issues(&[remote]);
        assert_eq!(result.updated_local, 0);

        let after = store.get(issue.local_id).unwrap();
        assert!(after.last_synced_at.unwrap() > t0);
        assert_eq!(after.updated_at, issue.updated_at);
    }

    #[test]
    fn test_pull_keeps_in_progress_state() {
        let (_dir, store) = new_store();
        let t0 = Utc::now() - Duration::hours(1);
        let issue = synced_issue(&store, t0);
        store.update_state(issue.local_id, State::InProgress).unwrap();

        let mut remote = remote_issue(1, "remote title", Utc::now() + Duration::seconds(1));
        remote.body = "orig body".into();
        let engine = engine(&store, InMemoryRemote::new());
        engine.pull_issues(&[remote]);

        let merged = store.get(issue.local_id).unwrap();
        assert_eq!(merged.title, "remote title");
        assert_eq!(merged.state, State::InProgress);
    }

    #[test]
    fn test_push_creates_and_links_remote_issues() {
        let (_dir, store) = new_store();
        let open = store.add("open one", "body").unwrap();
        let closed = store.add("closed one", "").unwrap();
        store.update_state(closed.local_id, State::Closed).unwrap();
        store.update_labels(open.local_id, ["bug"]).unwrap();

        let remote = InMemoryRemote::new();
        let engine = engine(&store, &remote);
        let result = engine.push().unwrap();
        assert_eq!(result.created_remote, 2);
        assert!(result.errors.is_empty());

        let open = store.get(open.local_id).unwrap();
        let closed = store.get(closed.local_id).unwrap();
        assert_eq!(open.sync_status, SyncStatus::Synced);
        assert!(open.last_synced_at.is_some());

        let remote_open = remote.get(&repo(), open.remote_id.unwrap()).unwrap();
        assert_eq!(remote_open.labels, vec!["bug".to_string()]);
        assert_eq!(remote_open.body, "body");
        let remote_closed = remote.get(&repo(), closed.remote_id.unwrap()).unwrap();
        assert_eq!(remote_closed.state, RemoteState::Closed);
    }

    #[test]
    fn test_local_edit_is_pushed_as_update() {
        let (_dir, store) = new_store();
        let issue = store.add("draft", "").unwrap();
        let remote = InMemoryRemote::new();
        let engine = engine(&store, &remote);
        engine.push().unwrap();

        store.update_title(issue.local_id, "final").unwrap();
        let result = engine.push().unwrap();
        assert_eq!(result.updated_remote, 1);
        assert_eq!(result.created_remote, 0);

        let number = store.get(issue.local_id).unwrap().remote_id.unwrap();
        assert_eq!(remote.get(&repo(), number).unwrap().title, "final");
    }

    #[test]
    fn test_push_failure_is_isolated_per_issue() {
        let (_dir, store) = new_store();
        store.add("one", "").unwrap();
        store.add("two", "").unwrap();
        store.add("three", "").unwrap();

        let remote = FlakyRemote::new();
        remote.fail_for("two");
        let engine = engine(&store, &remote);
        let result = engine.push().unwrap();

        assert!(result.success);
        assert_eq!(result.created_remote + result.updated_remote, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].local_id, Some(2));
        assert!(result.errors[0].to_string().contains("issue #2"));

        assert_eq!(store.get(1).unwrap().sync_status, SyncStatus::Synced);
        assert_eq!(store.get(3).unwrap().sync_status, SyncStatus::Synced);
        let failed = store.get(2).unwrap();
        assert_eq!(failed.sync_status, SyncStatus::Error);
        assert!(failed.sync_error.unwrap().contains("connection reset"));
        assert!(failed.remote_id.is_none());
    }

    #[test]
    fn test_failed_issue_is_retried_next_run() {
        let (_dir, store) = new_store();
        store.add("two", "").unwrap();
        let remote = FlakyRemote::new();
        remote.fail_for("two");
        let engine = engine(&store, &remote);
        assert_eq!(engine.push().unwrap().errors.len(), 1);

        remote.failing_titles.lock().unwrap().clear();
        let result = engine.push().unwrap();
        assert_eq!(result.created_remote, 1);
        assert_eq!(store.get(1).unwrap().sync_status, SyncStatus::Synced);
        assert!(store.get(1).unwrap().sync_error.is_none());
    }

    #[test]
    fn test_bidirectional_twice_is_idempotent() {
        let (_dir, store) = new_store();
        store.add("local only", "").unwrap();
        let remote = InMemoryRemote::new();
        let earlier = Utc::now() - Duration::minutes(10);
        remote.insert(&repo(), remote_issue(1, "remote only", earlier));
        remote.insert(&repo(), remote_issue(2, "another remote", earlier));

        let engine = engine(&store, &remote);
        let first = engine.bidirectional().unwrap();
        assert_eq!(first.created_local, 2);
        assert_eq!(first.created_remote, 1);
        assert!(first.success);

        let second = engine.bidirectional().unwrap();
        assert_eq!(second.total_changes(), 0);
        assert!(second.is_noop());
        assert_eq!(store.len(), 3);
        assert_eq!(remote.len(&repo()), 3);
    }

    #[test]
    fn test_remote_edit_flows_back_on_next_run() {
        let (_dir, store) = new_store();
        let issue = store.add("title", "").unwrap();
        let remote = InMemoryRemote::new();
        let engine = engine(&store, &remote);
        engine.bidirectional().unwrap();

        let number = store.get(issue.local_id).unwrap().remote_id.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        remote
            .edit(&repo(), number, |r| {
                r.state = RemoteState::Closed;
                r.labels.push("wontfix".into());
            })
            .unwrap();

        let result = engine.bidirectional().unwrap();
        assert_eq!(result.updated_local, 1);
        assert_eq!(result.updated_remote, 0);
        let local = store.get(issue.local_id).unwrap();
        assert_eq!(local.state, State::Closed);
        assert!(local.has_label("wontfix"));
        assert_eq!(local.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_unknown_label_survives_round_trip() {
        let (_dir, store) = new_store();
        let remote = InMemoryRemote::new();
        let mut seeded = remote_issue(1, "labelled", Utc::now() - Duration::minutes(1));
        seeded.labels = vec!["area/🦀-weird".into()];
        remote.insert(&repo(), seeded);

        let engine = engine(&store, &remote);
        engine.pull().unwrap();
        let local = store.find_by_remote_id(1).unwrap();
        store.update_title(local.local_id, "relabelled").unwrap();
        engine.push().unwrap();

        assert_eq!(
            remote.get(&repo(), 1).unwrap().labels,
            vec!["area/🦀-weird".to_string()]
        );
    }

    #[test]
    fn test_missing_repository_aborts_before_remote_calls() {
        let (_dir, store) = new_store();
        store.add("pending", "").unwrap();
        let remote = InMemoryRemote::new();
        let engine = SyncEngine::new(Arc::clone(&store), &remote, SyncOptions::default());

        assert!(matches!(engine.bidirectional(), Err(Error::Configuration(_))));
        assert!(matches!(engine.push(), Err(Error::Configuration(_))));
        assert!(matches!(engine.pull(), Err(Error::Configuration(_))));
        assert!(remote.is_empty(&repo()));
        assert_eq!(store.get(1).unwrap().sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_fetch_failure_fails_pull_but_push_still_runs() {
        let (_dir, store) = new_store();
        store.add("pending", "").unwrap();
        let mut remote = FlakyRemote::new();
        remote.fail_fetch = true;
        let engine = engine(&store, &remote);

        let result = engine.bidirectional().unwrap();
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].phase, SyncPhase::Pull);
        assert_eq!(result.created_remote, 1);
    }

    #[test]
    fn test_cancelled_run_starts_no_work() {
        let (_dir, store) = new_store();
        store.add("pending", "").unwrap();
        let remote = InMemoryRemote::new();
        let cancel = CancelToken::new();
        let engine = engine(&store, &remote).with_cancel_token(cancel.clone());
        cancel.cancel();

        let result = engine.bidirectional().unwrap();
        assert!(result.cancelled);
        assert_eq!(result.total_changes(), 0);
        assert!(remote.is_empty(&repo()));
        assert!(store.get(1).unwrap().remote_id.is_none());
    }

    /// Returns the snapshot, then edits remote #1 before the pull applies it.
    struct EditAfterFetch {
        inner: InMemoryRemote,
        edited: AtomicBool,
    }

    impl RemoteProvider for EditAfterFetch {
        fn fetch_all(&self, repo: &Repository) -> std::result::Result<Vec<RemoteIssue>, RemoteError> {
            let snapshot = self.inner.fetch_all(repo)?;
            if !self.edited.swap(true, Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(2));
                self.inner
                    .edit(repo, 1, |r| r.title = "edited remotely".into())?;
            }
            Ok(snapshot)
        }

        fn create(
            &self,
            repo: &Repository,
            issue: &NewRemoteIssue,
        ) -> std::result::Result<RemoteIssue, RemoteError> {
            self.inner.create(repo, issue)
        }

        fn update(
            &self,
            repo: &Repository,
            number: u64,
            update: &RemoteIssueUpdate,
        ) -> std::result::Result<(), RemoteError> {
            self.inner.update(repo, number, update)
        }
    }

    #[test]
    fn test_remote_edit_during_pull_is_not_lost() {
        let (_dir, store) = new_store();
        let remote = EditAfterFetch {
            inner: InMemoryRemote::new(),
            edited: AtomicBool::new(false),
        };
        remote
            .inner
            .insert(&repo(), remote_issue(1, "original", Utc::now() - Duration::minutes(1)));
        let engine = engine(&store, &remote);

        let first = engine.pull().unwrap();
        assert_eq!(first.created_local, 1);
        assert_eq!(remote.inner.get(&repo(), 1).unwrap().title, "edited remotely");

        let local = store.find_by_remote_id(1).unwrap();
        assert!(local.last_synced_at.unwrap() < remote.inner.get(&repo(), 1).unwrap().updated_at);

        let second = engine.pull().unwrap();
        assert_eq!(second.skipped, 0);
        assert_eq!(second.updated_local, 1);
        assert_eq!(store.find_by_remote_id(1).unwrap().title, "edited remotely");

        let third = engine.bidirectional().unwrap();
        assert!(third.is_noop());
        let local = store.find_by_remote_id(1).unwrap();
        assert_eq!(local.title, "edited remotely");
        assert_eq!(local.sync_status, SyncStatus::Synced);
    }

    /// Cancels the shared token from inside the first create call.
    struct CancelOnCreate {
        inner: InMemoryRemote,
        cancel: CancelToken,
    }

    impl RemoteProvider for CancelOnCreate {
        fn fetch_all(&self, repo: &Repository) -> std::result::Result<Vec<RemoteIssue>, RemoteError> {
            self.inner.fetch_all(repo)
        }

        fn create(
            &self,
            repo: &Repository,
            issue: &NewRemoteIssue,
        ) -> std::result::Result<RemoteIssue, RemoteError> {
            self.cancel.cancel();
            self.inner.create(repo, issue)
        }

        fn update(
            &self,
            repo: &Repository,
            number: u64,
            update: &RemoteIssueUpdate,
        ) -> std::result::Result<(), RemoteError> {
            self.inner.update(repo, number, update)
        }
    }

    #[test]
    fn test_cancel_mid_push_finishes_current_issue_only() {
        let (_dir, store) = new_store();
        store.add("one", "").unwrap();
        store.add("two", "").unwrap();
        store.add("three", "").unwrap();

        let cancel = CancelToken::new();
        let remote = CancelOnCreate {
            inner: InMemoryRemote::new(),
            cancel: cancel.clone(),
        };
        let engine = engine(&store, &remote).with_cancel_token(cancel);

        let result = engine.push().unwrap();
        assert!(result.cancelled);
        assert_eq!(result.created_remote, 1);
        assert!(result.errors.is_empty());
        assert_eq!(remote.inner.len(&repo()), 1);

        let first = store.get(1).unwrap();
        assert!(first.remote_id.is_some());
        assert_eq!(first.sync_status, SyncStatus::Synced);
        for id in [2, 3] {
            let untouched = store.get(id).unwrap();
            assert!(untouched.remote_id.is_none());
            assert!(untouched.last_synced_at.is_none());
        }
    }

    /// Edits the local issue while its create call is in flight.
    struct EditDuringPush {
        inner: InMemoryRemote,
        store: Arc<Store>,
        edited: AtomicBool,
    }

    impl RemoteProvider for EditDuringPush {
        fn fetch_all(&self, repo: &Repository) -> std::result::Result<Vec<RemoteIssue>, RemoteError> {
            self.inner.fetch_all(repo)
        }

        fn create(
            &self,
            repo: &Repository,
            issue: &NewRemoteIssue,
        ) -> std::result::Result<RemoteIssue, RemoteError> {
            let created = self.inner.create(repo, issue)?;
            if !self.edited.swap(true, Ordering::SeqCst) {
                self.store
                    .update_title(1, "edited meanwhile")
                    .map_err(|e| RemoteError::Api(e.to_string()))?;
            }
            Ok(created)
        }

        fn update(
            &self,
            repo: &Repository,
            number: u64,
            update: &RemoteIssueUpdate,
        ) -> std::result::Result<(), RemoteError> {
            self.inner.update(repo, number, update)
        }
    }

    #[test]
    fn test_local_edit_during_push_stays_pending() {
        let (_dir, store) = new_store();
        store.add("draft", "").unwrap();
        let remote = EditDuringPush {
            inner: InMemoryRemote::new(),
            store: Arc::clone(&store),
            edited: AtomicBool::new(false),
        };
        let engine = engine(&store, &remote);

        let first = engine.push().unwrap();
        assert_eq!(first.created_remote, 1);
        let local = store.get(1).unwrap();
        let number = local.remote_id.unwrap();
        assert_eq!(local.title, "edited meanwhile");
        assert_eq!(local.sync_status, SyncStatus::Syncing);
        assert!(local.needs_push());
        assert_eq!(remote.inner.get(&repo(), number).unwrap().title, "draft");

        let second = engine.push().unwrap();
        assert_eq!(second.updated_remote, 1);
        assert_eq!(
            remote.inner.get(&repo(), number).unwrap().title,
            "edited meanwhile"
        );
        assert_eq!(store.get(1).unwrap().sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_run_dispatches_on_direction() {
        let (_dir, store) = new_store();
        store.add("pending", "").unwrap();
        let remote = InMemoryRemote::new();
        remote.insert(&repo(), remote_issue(5, "remote", Utc::now() - Duration::minutes(1)));
        let engine = engine(&store, &remote);

        let pulled = engine.run(SyncDirection::Pull).unwrap();
        assert_eq!((pulled.created_local, pulled.created_remote), (1, 0));
        let pushed = engine.run(SyncDirection::Push).unwrap();
        assert_eq!((pushed.created_local, pushed.created_remote), (0, 1));
    }

    #[test]
    fn test_result_summary() {
        let mut result = SyncResult::new();
        result.created_local = 2;
        result.updated_remote = 70;
        result.errors.push(SyncIssueError {
            phase: SyncPhase::Push,
            local_id: Some(4),
            remote_id: Some(9),
            message: "rate limited by remote tracker".into(),
        });
        assert_eq!(
            result.to_string(),
            "2 created locally, 0 updated locally, 0 created remotely, 70 updated remotely, 1 error"
        );
        assert_eq!(
            result.errors[0].to_string(),
            "push issue #4 (remote #9): rate limited by remote tracker"
        );

        let mut total = SyncResult::new();
        total.merge(result.clone());
        total.merge(result);
        assert_eq!(total.created_local, 4);
        assert_eq!(total.errors.len(), 2);
        assert!(total.success);
    }
}
