//! End-to-end tests: a local in-process cluster served over TCP, exercised
//! through the retrying client.

use raftkv::raft::Cluster;
use raftkv::{Client, Result, Server};

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connects the given cluster node, starts a server for it, and serves it on
/// an ephemeral TCP port. Returns the server handle and its address.
fn spawn_server(
    cluster: &Cluster,
    id: usize,
    compact_threshold: Option<u64>,
) -> Result<(Arc<Server>, String)> {
    let (node, commits) = cluster.connect(id)?;
    let server = Arc::new(Server::new(Arc::new(node), commits, compact_threshold)?);
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();
    let handle = server.clone();
    std::thread::spawn(move || handle.serve(listener).expect("server failed"));
    Ok((server, addr))
}

/// Starts a cluster of n servers, returning the server handles and addresses.
fn spawn_cluster(
    cluster: &Cluster,
    n: usize,
    compact_threshold: Option<u64>,
) -> Result<(Vec<Arc<Server>>, Vec<String>)> {
    let mut servers = Vec::new();
    let mut addrs = Vec::new();
    for id in 0..n {
        let (server, addr) = spawn_server(cluster, id, compact_threshold)?;
        servers.push(server);
        addrs.push(addr);
    }
    Ok((servers, addrs))
}

#[test]
fn put_append_get() -> Result<()> {
    let cluster = Cluster::new(3);
    let (_servers, addrs) = spawn_cluster(&cluster, 3, None)?;
    let client = Client::new(addrs.clone());

    assert_eq!(client.get("k")?, "");

    client.put("k", "1")?;
    assert_eq!(client.get("k")?, "1");
    client.put("k", "2")?;
    assert_eq!(client.get("k")?, "2");

    client.append("l", "x")?;
    client.append("l", "y")?;
    assert_eq!(client.get("l")?, "xy");

    // Other clients see the same state.
    let other = Client::new(addrs);
    assert_eq!(other.get("k")?, "2");
    assert_eq!(other.get("l")?, "xy");
    Ok(())
}

#[test]
fn retries_across_leader_changes() -> Result<()> {
    let cluster = Cluster::new(3);
    let (_servers, addrs) = spawn_cluster(&cluster, 3, None)?;
    let client = Client::new(addrs);

    client.put("k", "1")?;

    // Move leadership around; the client rediscovers the leader each time.
    cluster.set_leader(Some(2))?;
    client.put("k", "2")?;
    cluster.set_leader(Some(1))?;
    assert_eq!(client.get("k")?, "2");

    // A leaderless period blocks requests until a leader emerges.
    cluster.set_leader(None)?;
    let restore = cluster.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        restore.set_leader(Some(0)).expect("set_leader failed");
    });
    client.put("k", "3")?;
    assert_eq!(client.get("k")?, "3");
    Ok(())
}

#[test]
fn retries_past_dead_endpoints() -> Result<()> {
    let cluster = Cluster::new(2);
    let (_servers, mut addrs) = spawn_cluster(&cluster, 2, None)?;

    // An endpoint that accepts connections and immediately closes them.
    let dead = std::net::TcpListener::bind("127.0.0.1:0")?;
    addrs.insert(0, dead.local_addr()?.to_string());
    std::thread::spawn(move || {
        for socket in dead.incoming() {
            drop(socket);
        }
    });

    // Several clients, so some start out pointed at the dead endpoint.
    for i in 0..5 {
        let client = Client::new(addrs.clone());
        client.put("k", &i.to_string())?;
        assert_eq!(client.get("k")?, i.to_string());
    }
    Ok(())
}

#[test]
fn recovers_from_snapshot_after_restart() -> Result<()> {
    let cluster = Cluster::new(1);
    let (server, addr) = spawn_server(&cluster, 0, Some(8))?;
    let client = Client::new(vec![addr]);

    client.put("a", "1")?;
    client.put("b", "2")?;

    // Wait for the snapshot manager to compact.
    let deadline = Instant::now() + Duration::from_secs(2);
    while cluster.snapshot(0)?.is_none() {
        assert!(Instant::now() < deadline, "no snapshot was created");
        std::thread::sleep(Duration::from_millis(10));
    }
    server.shutdown()?;

    // A restarted server restores the snapshot and replays the tail of the
    // log above it.
    let (_server, addr) = spawn_server(&cluster, 0, None)?;
    let client = Client::new(vec![addr]);
    assert_eq!(client.get("a")?, "1");
    assert_eq!(client.get("b")?, "2");
    Ok(())
}
