use super::{Commit, Index, Raft, Term};
use crate::error::{Error, Result};

use crossbeam::channel::Sender;
use log::debug;
use std::sync::{Arc, Mutex};

/// An in-memory, single-process consensus cluster, used in tests and the
/// demo binary. All nodes share a common log. Submissions on the designated
/// leader commit immediately (the majority is assumed reachable) and fan out
/// to every connected node's commit feed. Leadership is assigned explicitly
/// via [`Cluster::set_leader`] rather than elected.
#[derive(Clone)]
pub struct Cluster {
    shared: Arc<Mutex<State>>,
}

struct State {
    term: Term,
    leader: Option<usize>,
    /// All committed commands; entry i has log index i + 1. The log is kept
    /// whole in memory, snapshots only affect per-node size accounting.
    entries: Vec<Vec<u8>>,
    nodes: Vec<NodeState>,
}

struct NodeState {
    /// The node's commit feed, if connected.
    feed: Option<Sender<Commit>>,
    /// The node's last saved snapshot, as (through_index, payload).
    snapshot: Option<(Index, Vec<u8>)>,
}

impl Cluster {
    /// Creates a new cluster with the given number of nodes. Node 0 starts
    /// out as leader. Nodes are initially disconnected; use connect() to
    /// obtain a handle and commit feed for each.
    pub fn new(nodes: usize) -> Self {
        let nodes = (0..nodes).map(|_| NodeState { feed: None, snapshot: None }).collect();
        Self {
            shared: Arc::new(Mutex::new(State {
                term: 1,
                leader: Some(0),
                entries: Vec::new(),
                nodes,
            })),
        }
    }

    /// Connects (or reconnects) the given node, returning its handle and a
    /// fresh commit feed. Entries above the node's snapshot through-index are
    /// replayed onto the feed, so a restarted node resumes where its
    /// snapshot left off.
    pub fn connect(&self, id: usize) -> Result<(Node, crossbeam::channel::Receiver<Commit>)> {
        let mut state = self.shared.lock()?;
        let (tx, rx) = crossbeam::channel::unbounded();
        let through = state.nodes[id].snapshot.as_ref().map(|(i, _)| *i).unwrap_or(0);
        for (i, command) in state.entries.iter().enumerate() {
            let index = i as Index + 1;
            if index > through {
                tx.send(Commit { valid: true, index, command: command.clone() })?;
            }
        }
        state.nodes[id].feed = Some(tx);
        Ok((Node { id, shared: self.shared.clone() }, rx))
    }

    /// Reassigns leadership, bumping the term. None leaves the cluster
    /// leaderless, as during an election.
    pub fn set_leader(&self, leader: Option<usize>) -> Result<()> {
        let mut state = self.shared.lock()?;
        state.term += 1;
        state.leader = leader;
        debug!("Cluster leader is now {:?} in term {}", leader, state.term);
        Ok(())
    }

    /// Returns the given node's last saved snapshot, if any.
    pub fn snapshot(&self, id: usize) -> Result<Option<(Index, Vec<u8>)>> {
        Ok(self.shared.lock()?.nodes[id].snapshot.clone())
    }
}

/// A handle to a single node of a local Cluster.
pub struct Node {
    id: usize,
    shared: Arc<Mutex<State>>,
}

impl Raft for Node {
    fn submit(&self, command: Vec<u8>) -> Result<(Index, Term)> {
        let mut state = self.shared.lock()?;
        if state.leader != Some(self.id) {
            return Err(Error::NotLeader);
        }
        state.entries.push(command.clone());
        let index = state.entries.len() as Index;
        let term = state.term;
        // Committed immediately: fan out to every connected feed. Sends to
        // disconnected nodes are dropped.
        for node in &state.nodes {
            if let Some(feed) = &node.feed {
                let _ = feed.send(Commit { valid: true, index, command: command.clone() });
            }
        }
        Ok((index, term))
    }

    fn persisted_size(&self) -> u64 {
        let Ok(state) = self.shared.lock() else { return 0 };
        let through = state.nodes[self.id].snapshot.as_ref().map(|(i, _)| *i).unwrap_or(0);
        state.entries[through as usize..].iter().map(|c| c.len() as u64).sum()
    }

    fn save_snapshot(&self, payload: Vec<u8>, through: Index) -> Result<()> {
        let mut state = self.shared.lock()?;
        state.nodes[self.id].snapshot = Some((through, payload));
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Vec<u8>> {
        let state = self.shared.lock()?;
        Ok(state.nodes[self.id].snapshot.as_ref().map(|(_, p)| p.clone()).unwrap_or_default())
    }

    fn shutdown(&self) {
        if let Ok(mut state) = self.shared.lock() {
            state.nodes[self.id].feed = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_commits_and_fans_out() -> Result<()> {
        let cluster = Cluster::new(3);
        let (leader, leader_rx) = cluster.connect(0)?;
        let (_, follower_rx) = cluster.connect(1)?;

        let (index, term) = leader.submit(vec![1, 2, 3])?;
        assert_eq!((index, term), (1, 1));

        let commit = Commit { valid: true, index: 1, command: vec![1, 2, 3] };
        assert_eq!(leader_rx.recv(), Ok(commit.clone()));
        assert_eq!(follower_rx.recv(), Ok(commit));
        Ok(())
    }

    #[test]
    fn followers_reject_submissions() -> Result<()> {
        let cluster = Cluster::new(3);
        let (follower, _rx) = cluster.connect(1)?;
        assert_eq!(follower.submit(vec![1]), Err(Error::NotLeader));

        cluster.set_leader(Some(1))?;
        let (index, term) = follower.submit(vec![1])?;
        assert_eq!((index, term), (1, 2));
        Ok(())
    }

    #[test]
    fn reconnect_replays_above_snapshot() -> Result<()> {
        let cluster = Cluster::new(1);
        let (node, _rx) = cluster.connect(0)?;
        for i in 0..4 {
            node.submit(vec![i])?;
        }
        node.save_snapshot(vec![0xff], 2)?;

        let (_, rx) = cluster.connect(0)?;
        assert_eq!(rx.recv(), Ok(Commit { valid: true, index: 3, command: vec![2] }));
        assert_eq!(rx.recv(), Ok(Commit { valid: true, index: 4, command: vec![3] }));
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn snapshot_truncates_persisted_size() -> Result<()> {
        let cluster = Cluster::new(1);
        let (node, _rx) = cluster.connect(0)?;
        node.submit(vec![0; 10])?;
        node.submit(vec![0; 10])?;
        assert_eq!(node.persisted_size(), 20);

        node.save_snapshot(vec![0xff], 1)?;
        assert_eq!(node.persisted_size(), 10);
        assert_eq!(node.load_snapshot()?, vec![0xff]);
        Ok(())
    }
}
