use crate::encoding;
use crate::error::{Error, Result};
use crate::message::{Request, Response};

use log::debug;
use rand::Rng as _;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// The pause between retries of a failed request.
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// A raftkv client. Routes each request to the server currently believed to
/// be leader, and retries indefinitely on leadership changes and transport
/// failures until the request succeeds.
///
/// Each logical operation is tagged with a fresh request ID, which is reused
/// across all of its retries so servers can deduplicate it. Writes therefore
/// take effect exactly once, no matter how often they are retried.
///
/// The client is thread-safe, but requests from a single client should not
/// be issued concurrently: linearizability is only guaranteed for operations
/// issued one at a time.
pub struct Client {
    /// The servers' addresses.
    addrs: Vec<String>,
    /// The index into addrs of the last known leader. Starts at a random
    /// server, and rotates round-robin on failures.
    leader: AtomicUsize,
}

impl Client {
    /// Creates a new client for the given cluster addresses.
    pub fn new(addrs: Vec<String>) -> Self {
        let leader = AtomicUsize::new(rand::thread_rng().gen_range(0..addrs.len()));
        Self { addrs, leader }
    }

    /// Fetches a key's value, or an empty string if the key does not exist.
    /// The read is linearizable: it reflects all writes completed before it.
    pub fn get(&self, key: &str) -> Result<String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = Request::Get { key: key.to_string(), request_id };
        match self.retry(&request)? {
            Response::Get { value } => Ok(value),
            response => Err(Error::Internal(format!("unexpected response {response:?}"))),
        }
    }

    /// Sets a key to a value, replacing any existing value.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request =
            Request::Put { key: key.to_string(), value: value.to_string(), request_id };
        match self.retry(&request)? {
            Response::Put => Ok(()),
            response => Err(Error::Internal(format!("unexpected response {response:?}"))),
        }
    }

    /// Concatenates a value onto a key's existing value. An absent key is
    /// treated as empty.
    pub fn append(&self, key: &str, value: &str) -> Result<()> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request =
            Request::Append { key: key.to_string(), value: value.to_string(), request_id };
        match self.retry(&request)? {
            Response::Append => Ok(()),
            response => Err(Error::Internal(format!("unexpected response {response:?}"))),
        }
    }

    /// Sends the request to the presumed leader, rotating to the next server
    /// and retrying until it succeeds. Transport failures and NotLeader
    /// rejections are retried; any other server error is returned to the
    /// caller, since the request may have been executed.
    fn retry(&self, request: &Request) -> Result<Response> {
        loop {
            let id = self.leader.load(Ordering::Relaxed);
            match self.send(&self.addrs[id], request) {
                Ok(response) => return Ok(response),
                Err(Error::NotLeader) => {
                    debug!("Server {} is not leader, rotating", self.addrs[id])
                }
                Err(Error::IO(err)) => debug!("Server {} unreachable: {err}", self.addrs[id]),
                Err(err) => return Err(err),
            }
            self.leader.store((id + 1) % self.addrs.len(), Ordering::Relaxed);
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Performs a single request/response exchange with one server, over a
    /// fresh connection.
    fn send(&self, addr: &str, request: &Request) -> Result<Response> {
        let mut socket = TcpStream::connect(addr)?;
        encoding::serialize_into(&mut socket, request)?;
        match encoding::maybe_deserialize_from::<_, Result<Response>>(&mut socket)? {
            Some(response) => response,
            // The server hung up without answering.
            None => Err(Error::IO("connection closed by server".to_string())),
        }
    }
}
