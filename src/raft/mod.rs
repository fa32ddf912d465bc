//! The consensus module boundary.
//!
//! raftkv layers a key/value state machine on top of a consensus module that
//! provides leader election, log replication, and persistence. The module's
//! internals are out of scope here: the state machine only depends on the
//! [`Raft`] trait and on an ordered commit feed.
//!
//! The commit feed is a channel of [`Commit`] entries, delivered in strictly
//! increasing log-index order. After a snapshot is installed, the feed
//! resumes with the first entry above the snapshot's through-index.
//!
//! Commands submitted via [`Raft::submit`] are opaque bytes. They must be
//! deterministic: the same command sequence must yield the same state on
//! every replica, even if a command is reapplied after a crash.

mod local;

pub use local::{Cluster, Node};

use crate::error::Result;

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A leader term. Increases monotonically with every election.
pub type Term = u64;

/// A committed log entry, as delivered on the commit feed.
#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    /// Whether the entry carries a command. Invalid entries (e.g. internal
    /// consensus noops) must be skipped by the state machine.
    pub valid: bool,
    /// The entry's log index.
    pub index: Index,
    /// The encoded command.
    pub command: Vec<u8>,
}

/// A handle to the local node of a consensus module.
///
/// Implementations must be safe to call from multiple threads: the request
/// coordinator submits commands while the snapshot manager polls sizes and
/// saves snapshots.
pub trait Raft: Send + Sync {
    /// Submits a command for replication, returning the log index and term
    /// it was appended at. Returns Error::NotLeader if this node is not the
    /// current leader, in which case no append occurred. A successful submit
    /// does not imply a commit: the entry may later be displaced by a
    /// different leader's entry at the same index.
    fn submit(&self, command: Vec<u8>) -> Result<(Index, Term)>;

    /// Returns the current size in bytes of the module's durable log
    /// representation, for snapshot threshold checks.
    fn persisted_size(&self) -> u64;

    /// Atomically persists payload as the compaction point and truncates the
    /// log up to and including through.
    fn save_snapshot(&self, payload: Vec<u8>, through: Index) -> Result<()>;

    /// Returns the last saved snapshot payload, or empty if none exists.
    fn load_snapshot(&self) -> Result<Vec<u8>>;

    /// Stops the module's background activity. The commit feed is closed.
    fn shutdown(&self);
}
