//! Translation between local and remote field vocabularies
//!
//! All functions here are pure and total: unrecognized input degrades to a
//! pass-through value instead of failing.

use std::collections::BTreeSet;

use crate::issue::{Issue, State, SyncBase};
use crate::remote::{RemoteIssue, RemoteState};

/// Remote spellings accepted for each remote state.
const REMOTE_STATE_NAMES: &[(&str, RemoteState)] = &[
    ("open", RemoteState::Open),
    ("opened", RemoteState::Open),
    ("reopened", RemoteState::Open),
    ("closed", RemoteState::Closed),
    ("completed", RemoteState::Closed),
    ("not_planned", RemoteState::Closed),
];

/// Collapse a local state onto the remote binary: only `closed` is closed.
pub fn local_state_to_remote(state: State) -> RemoteState {
    match state {
        State::Closed => RemoteState::Closed,
        State::Open | State::InProgress => RemoteState::Open,
    }
}

pub fn remote_state_to_local(state: RemoteState) -> State {
    match state {
        RemoteState::Open => State::Open,
        RemoteState::Closed => State::Closed,
    }
}

/// Parse a tracker state string (`"OPEN"`, `"closed"`, ...). Unknown values map to open.
pub fn parse_remote_state(raw: &str) -> RemoteState {
    let raw = raw.trim().to_ascii_lowercase();
    REMOTE_STATE_NAMES
        .iter()
        .find(|(name, _)| *name == raw)
        .map_or(RemoteState::Open, |(_, state)| *state)
}

/// Resolve the local state for an incoming remote state.
///
/// Keeps the richer local state when it already maps onto the remote one,
/// so `in_progress` is not flattened to `open` by a pull.
pub fn merge_state(local: State, remote: RemoteState) -> State {
    if local_state_to_remote(local) == remote {
        local
    } else {
        remote_state_to_local(remote)
    }
}

pub fn local_labels_to_remote(labels: &BTreeSet<String>) -> Vec<String> {
    labels.iter().cloned().collect()
}

/// Duplicates collapse; every distinct label survives.
pub fn remote_labels_to_local(labels: &[String]) -> BTreeSet<String> {
    labels.iter().cloned().collect()
}

/// Snapshot of the fields a remote issue carries, in sync-base form.
pub fn base_from_remote(remote: &RemoteIssue) -> SyncBase {
    SyncBase {
        title: remote.title.clone(),
        body: remote.body.clone(),
        state: remote.state,
        labels: remote_labels_to_local(&remote.labels),
    }
}

/// Snapshot of a local issue's fields as they would look on the remote side.
pub fn base_from_local(issue: &Issue) -> SyncBase {
    SyncBase {
        title: issue.title.clone(),
        body: issue.body.clone(),
        state: local_state_to_remote(issue.state),
        labels: issue.labels.clone(),
    }
}
