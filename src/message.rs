use crate::encoding;
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};

/// A client request ID. It is assigned by the client, must be unique per
/// logical operation, and must be reused across retries of the same logical
/// operation -- that is what allows the server to deduplicate retries.
pub type RequestId = String;

/// A state machine command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Fetches a key. Has no effect on the store, but is still submitted to
    /// the consensus log to make reads linearizable.
    Get { key: String },
    /// Sets a key to a value, replacing any existing value.
    Put { key: String, value: String },
    /// Concatenates a value onto a key's existing value. An absent key is
    /// treated as empty.
    Append { key: String, value: String },
}

/// The unit submitted to the consensus log: a command tagged with the
/// client's request ID. Immutable once created, and travels through the log
/// unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: RequestId,
    pub command: Command,
}

impl Envelope {
    /// Encodes the envelope into a log command.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encoding::serialize(self)
    }

    /// Decodes an envelope from a log command.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        encoding::deserialize(bytes)
    }
}

/// A client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Get { key: String, request_id: RequestId },
    Put { key: String, value: String, request_id: RequestId },
    Append { key: String, value: String, request_id: RequestId },
}

/// A client response. Errors are returned as the Err half of a
/// Result<Response> frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The value for the requested key. An empty string means the key does
    /// not exist.
    Get { value: String },
    Put,
    Append,
}
