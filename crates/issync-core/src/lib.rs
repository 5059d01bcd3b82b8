//! issync-core: Core library for issync
//!
//! A file-backed local issue store mirrored against a remote issue tracker.
//! The store owns the data; the sync engine pulls remote changes in, pushes
//! local changes out, and resolves conflicts field by field.

pub mod config;
pub mod error;
pub mod issue;
pub mod mapper;
pub mod remote;
pub mod store;
pub mod sync;

pub use config::{Config, Repository, SyncDirection};
pub use error::Error;
pub use issue::{Issue, State, SyncStatus};
pub use remote::{InMemoryRemote, RemoteError, RemoteIssue, RemoteProvider, RemoteState};
pub use store::{IssueFilter, Store};
pub use sync::{CancelToken, SyncEngine, SyncOptions, SyncResult};

/// Result type for issync operations
pub type Result<T> = std::result::Result<T, Error>;
