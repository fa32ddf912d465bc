//! raftkv is a fault-tolerant, replicated key/value store. It layers a
//! simple string key/value state machine with Get, Put, and Append
//! operations on top of a consensus module (see the raft module), providing
//! linearizable reads and exactly-once writes across leadership changes,
//! retries, and restarts.

#![warn(clippy::all)]

pub mod client;
pub mod encoding;
pub mod error;
pub mod message;
pub mod raft;
pub mod server;

pub use client::Client;
pub use error::{Error, Result};
pub use server::Server;
