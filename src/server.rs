use crate::encoding;
use crate::error::{Error, Result};
use crate::message::{Command, Envelope, Request, RequestId, Response};
use crate::raft::{Commit, Index, Raft};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info};
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The maximum time a request coordinator waits for its submitted command to
/// commit. If the deadline elapses (e.g. because this server lost leadership
/// and the entry was never committed), the client is told to retry elsewhere.
const COMMIT_TIMEOUT: Duration = Duration::from_secs(1);

/// The interval between snapshot threshold checks.
const COMPACT_INTERVAL: Duration = Duration::from_millis(10);

/// A key/value server replicated via a consensus module.
///
/// Client commands are submitted to the consensus log and applied to the
/// local store by a single apply loop, in log order, exactly once. The
/// request coordinator ([`Server::call`]) blocks until the apply loop has
/// resolved the log index the command was submitted at, and detects
/// leadership changes by comparing the request ID actually committed there
/// against its own. A snapshot manager periodically compacts the log once
/// the consensus module's persisted state exceeds a threshold.
pub struct Server {
    raft: Arc<dyn Raft>,
    shared: Arc<Mutex<Shared>>,
    /// Signals background threads to exit when dropped.
    shutdown_tx: Mutex<Option<Sender<()>>>,
}

/// State shared between request coordinators, the apply loop, and the
/// snapshot manager. Guarded by a single lock, which must never be held
/// across a blocking wait: coordinators release it before blocking on their
/// waiter channel, and the apply loop sends notifications outside it.
#[derive(Default)]
struct Shared {
    /// The key/value store. Only the apply loop mutates it.
    store: BTreeMap<String, String>,
    /// Request IDs whose effect has been applied to the store. Makes
    /// re-application of a retried command a no-op.
    executed: HashSet<RequestId>,
    /// Waiters for in-flight requests, keyed by the log index the request
    /// was submitted at. The channel carries the request ID that was
    /// actually committed at that index.
    waiters: HashMap<Index, Waiter>,
    /// The next waiter sequence number.
    waiter_seq: u64,
    /// The index of the last applied entry.
    applied_index: Index,
    /// The index of the last snapshot. Always <= applied_index.
    snapshot_index: Index,
}

/// A registered waiter. The sequence number lets a coordinator remove its
/// own entry without clobbering a newer waiter that replaced it at the same
/// index after a leadership change.
struct Waiter {
    seq: u64,
    tx: Sender<RequestId>,
}

/// A snapshot of the store at a given applied index. Encoded with a fixed
/// field order, so the payload round-trips through the consensus module's
/// snapshot storage.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Snapshot {
    applied_index: Index,
    store: BTreeMap<String, String>,
}

impl Server {
    /// Creates a new server on top of the given consensus module, restoring
    /// any prior snapshot, and spawns the apply loop and snapshot manager.
    /// Commits are consumed from the given feed in log-index order. A
    /// compact_threshold of None disables snapshotting.
    pub fn new(
        raft: Arc<dyn Raft>,
        commits: Receiver<Commit>,
        compact_threshold: Option<u64>,
    ) -> Result<Self> {
        let mut shared = Shared::default();
        let payload = raft.load_snapshot()?;
        if !payload.is_empty() {
            // A non-empty payload that fails to decode is a fatal startup
            // condition, not a normal control-flow error.
            let snapshot: Snapshot = encoding::deserialize(&payload)?;
            info!("Restored snapshot through applied index {}", snapshot.applied_index);
            shared.store = snapshot.store;
            shared.applied_index = snapshot.applied_index;
            shared.snapshot_index = snapshot.applied_index;
        }
        let shared = Arc::new(Mutex::new(shared));
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded::<()>(0);

        {
            let shared = shared.clone();
            let shutdown_rx = shutdown_rx.clone();
            std::thread::spawn(move || {
                Self::apply_loop(shared, commits, shutdown_rx).expect("apply loop failed")
            });
        }
        if let Some(threshold) = compact_threshold {
            let raft = raft.clone();
            let shared = shared.clone();
            std::thread::spawn(move || {
                Self::compact_loop(raft, shared, threshold, shutdown_rx)
                    .expect("snapshot manager failed")
            });
        }

        Ok(Self { raft, shared, shutdown_tx: Mutex::new(Some(shutdown_tx)) })
    }

    /// Stops the server's background threads and shuts down the consensus
    /// module. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.lock()?.take() {
            drop(shutdown_tx);
            self.raft.shutdown();
        }
        Ok(())
    }

    /// Processes a client request.
    pub fn call(&self, request: Request) -> Result<Response> {
        match request {
            Request::Get { key, request_id } => {
                let value = self.execute(Envelope { request_id, command: Command::Get { key } })?;
                Ok(Response::Get { value: value.unwrap_or_default() })
            }
            Request::Put { key, value, request_id } => {
                self.execute(Envelope { request_id, command: Command::Put { key, value } })?;
                Ok(Response::Put)
            }
            Request::Append { key, value, request_id } => {
                self.execute(Envelope { request_id, command: Command::Append { key, value } })?;
                Ok(Response::Append)
            }
        }
    }

    /// Submits an envelope to the consensus log and blocks until the entry
    /// at the returned index commits. Returns the current value for Get
    /// commands, None for writes. Fails with Error::NotLeader if this node
    /// is not the leader, if a different command committed at the awaited
    /// index (the log position was taken over by a new leader), or if the
    /// commit deadline elapsed.
    fn execute(&self, envelope: Envelope) -> Result<Option<String>> {
        let command = envelope.encode()?;
        let (seq, index, wait_rx) = {
            let mut shared = self.shared.lock()?;
            // Submit while holding the lock, so the apply loop can't resolve
            // the index before the waiter is registered.
            let (index, _term) = self.raft.submit(command)?;
            // Fast path: a retry of an already-applied operation answers
            // immediately from the store.
            if shared.executed.contains(&envelope.request_id) {
                debug!("Request {} already executed, answering from store", envelope.request_id);
                return Ok(Self::value(&shared, &envelope.command));
            }
            let seq = shared.waiter_seq;
            shared.waiter_seq += 1;
            let (tx, rx) = crossbeam::channel::bounded(1);
            // Replace any stale waiter at this index: its submission was
            // displaced, and dropping its channel resolves it as NotLeader.
            shared.waiters.insert(index, Waiter { seq, tx });
            (seq, index, rx)
        };

        let result = match wait_rx.recv_timeout(COMMIT_TIMEOUT) {
            Ok(request_id) if request_id == envelope.request_id => Ok(()),
            // A different command committed at our index: leadership changed
            // and a new leader's entry took the log position.
            Ok(request_id) => {
                debug!("Index {index} committed {request_id}, not {}", envelope.request_id);
                Err(Error::NotLeader)
            }
            // Displaced by a newer submission at this index, or the commit
            // never arrived before the deadline.
            Err(_) => Err(Error::NotLeader),
        };

        let mut shared = self.shared.lock()?;
        // Only remove the waiter if it is still ours.
        if shared.waiters.get(&index).map(|w| w.seq) == Some(seq) {
            shared.waiters.remove(&index);
        }
        result?;
        Ok(Self::value(&shared, &envelope.command))
    }

    /// Returns the command's response value from the store: the current
    /// value for Get (absent keys read as empty), None for writes.
    fn value(shared: &Shared, command: &Command) -> Option<String> {
        match command {
            Command::Get { key } => Some(shared.store.get(key).cloned().unwrap_or_default()),
            Command::Put { .. } | Command::Append { .. } => None,
        }
    }

    /// The apply loop: consumes committed entries in log-index order and
    /// applies each to the store exactly once. Runs until the commit feed
    /// closes or the server shuts down.
    fn apply_loop(
        shared: Arc<Mutex<Shared>>,
        commits: Receiver<Commit>,
        shutdown: Receiver<()>,
    ) -> Result<()> {
        loop {
            crossbeam::select! {
                recv(commits) -> commit => match commit {
                    Ok(commit) => Self::apply(&shared, commit)?,
                    Err(_) => return Ok(()),
                },
                recv(shutdown) -> _ => return Ok(()),
            }
        }
    }

    /// Applies a single committed entry, and notifies any waiter registered
    /// for its index of the request ID that actually committed there.
    fn apply(shared: &Mutex<Shared>, commit: Commit) -> Result<()> {
        if !commit.valid {
            return Ok(());
        }
        let Envelope { request_id, command } = Envelope::decode(&commit.command)?;
        let mut shared = shared.lock()?;
        if commit.index <= shared.applied_index {
            debug!("Skipping stale commit at index {}", commit.index);
            return Ok(());
        }
        if !shared.executed.contains(&request_id) {
            match command {
                Command::Get { .. } => {}
                Command::Put { key, value } => {
                    debug!("Applying put {key}={value} at index {}", commit.index);
                    shared.store.insert(key, value);
                }
                Command::Append { key, value } => {
                    debug!("Applying append {key}+={value} at index {}", commit.index);
                    shared.store.entry(key).or_default().push_str(&value);
                }
            }
            shared.executed.insert(request_id.clone());
        } else {
            debug!("Skipping duplicate of request {request_id} at index {}", commit.index);
        }
        shared.applied_index = commit.index;
        let waiter = shared.waiters.get(&commit.index).map(|w| w.tx.clone());
        drop(shared);
        // Notify outside the lock. If nobody is listening the coordinator
        // already gave up, and the notification is dropped.
        if let Some(tx) = waiter {
            let _ = tx.try_send(request_id);
        }
        Ok(())
    }

    /// The snapshot manager: periodically compacts the consensus log once
    /// its persisted size exceeds the threshold and there is new applied
    /// state worth compacting.
    fn compact_loop(
        raft: Arc<dyn Raft>,
        shared: Arc<Mutex<Shared>>,
        threshold: u64,
        shutdown: Receiver<()>,
    ) -> Result<()> {
        let ticker = crossbeam::channel::tick(COMPACT_INTERVAL);
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => Self::maybe_compact(&raft, &shared, threshold)?,
                recv(shutdown) -> _ => return Ok(()),
            }
        }
    }

    fn maybe_compact(raft: &Arc<dyn Raft>, shared: &Mutex<Shared>, threshold: u64) -> Result<()> {
        let (payload, through) = {
            let shared = shared.lock()?;
            if raft.persisted_size() <= threshold || shared.applied_index <= shared.snapshot_index
            {
                return Ok(());
            }
            let snapshot =
                Snapshot { applied_index: shared.applied_index, store: shared.store.clone() };
            (encoding::serialize(&snapshot)?, shared.applied_index)
        };
        // Hand the payload off outside the lock.
        raft.save_snapshot(payload, through)?;
        shared.lock()?.snapshot_index = through;
        info!("Saved snapshot through index {through}");
        Ok(())
    }

    /// Serves clients on the given TCP listener. Blocks indefinitely.
    pub fn serve(&self, listener: std::net::TcpListener) -> Result<()> {
        info!("Serving clients on {}", listener.local_addr()?);
        std::thread::scope(|s| -> Result<()> {
            loop {
                let (socket, peer) = match listener.accept() {
                    Ok(r) => r,
                    Err(err) => {
                        error!("Connection failed: {err}");
                        continue;
                    }
                };
                s.spawn(move || {
                    debug!("Client {peer} connected");
                    match self.session(socket) {
                        Ok(()) => debug!("Client {peer} disconnected"),
                        Err(err) => error!("Client {peer} error: {err}"),
                    }
                });
            }
        })
    }

    /// Processes a client session, answering request frames until the client
    /// disconnects. Request errors are returned to the client in-band.
    fn session(&self, mut socket: std::net::TcpStream) -> Result<()> {
        while let Some(request) = encoding::maybe_deserialize_from::<_, Request>(&mut socket)? {
            let response = self.call(request);
            encoding::serialize_into(&mut socket, &response)?;
        }
        Ok(())
    }
}
