//! Wire protocol for world synchronization
//!
//! Messages are serialized with postcard and carried in length-delimited
//! frames, one TCP connection per request.
//!
//! ## Message Flow
//!
//! ```text
//! Client                                   Server
//!   |--- ListWorlds ------------------------->|
//!   |<-- Worlds {worlds} ---------------------|
//!
//!   |--- WaitForAuth {world, auth} ---------->|   (server watches world root
//!   |<-- AuthResult {success} ----------------|    for the dropped auth file)
//!
//!   |--- OpenStream {Push, world, auth} ----->|
//!   |<-- StreamOpened ------------------------|
//!   |--- FileChanged {seq: 1, ..} ----------->|   (client edits)
//!   |--- FileChanged {seq: 2, ..} ----------->|
//!
//!   |--- OpenStream {Pull, world, auth} ----->|
//!   |<-- StreamOpened ------------------------|
//!   |<-- FileChanged {seq: 1, ..} ------------|   (server-side edits)
//!   |<-- Status {code} -----------------------|   (terminal)
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{AuthToken, WorldId, WorldSummary};

/// Terminal status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Session ended normally
    Ok,
    /// World id is not in the registry
    NotFound,
    /// Auth id is blank or matches no client directory
    Unauthenticated,
    /// Session failed (I/O, stream, or protocol error)
    Aborted,
    /// Session was shut down
    Cancelled,
}

/// Which way a change stream flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Client sends its local edits to the server
    Push,
    /// Server sends edits made on its side to the client
    Pull,
}

/// Wire form of a change.
///
/// Paths are `/`-separated and relative to the session's sandbox root. The
/// empty string means "absent".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChanged {
    /// Per-stream counter assigned by the sender, for log correlation only
    pub sequence: u64,
    /// Path before the change, empty for creates
    pub old_path: String,
    /// Path after the change, empty for deletes
    pub new_path: String,
    /// Whether the entry is a directory
    pub is_directory: bool,
    /// Full file contents when the change carries content
    pub contents: Vec<u8>,
}

impl FileChanged {
    /// Old path, `None` when absent
    pub fn source(&self) -> Option<&str> {
        non_blank(&self.old_path)
    }

    /// New path, `None` when absent
    pub fn target(&self) -> Option<&str> {
        non_blank(&self.new_path)
    }
}

fn non_blank(s: &str) -> Option<&str> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Messages exchanged between client and server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Request the list of worlds
    ListWorlds,

    /// Reply to `ListWorlds`
    Worlds {
        /// Every world the server knows about
        worlds: Vec<WorldSummary>,
    },

    /// Wait until the auth file with `auth` appears under the world
    WaitForAuth {
        /// World to watch
        world_id: WorldId,
        /// Token the client expects to find
        auth: AuthToken,
    },

    /// Reply to `WaitForAuth`
    AuthResult {
        /// Whether the token was found
        success: bool,
        /// Reason when not successful
        error: Option<String>,
    },

    /// Open a change stream for a registered client
    OpenStream {
        /// Push (client→server) or pull (server→client)
        direction: Direction,
        /// World the client belongs to
        world_id: WorldId,
        /// The client's token
        auth: AuthToken,
    },

    /// The stream was accepted; `FileChanged` frames follow
    StreamOpened,

    /// One change
    FileChanged(FileChanged),

    /// Terminal status of the exchange
    Status {
        /// Outcome
        code: StatusCode,
        /// Human readable detail
        message: String,
    },
}

impl SyncMessage {
    /// Encode message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    /// Build a terminal status message
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        SyncMessage::Status {
            code,
            message: message.into(),
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::ListWorlds => "ListWorlds",
            SyncMessage::Worlds { .. } => "Worlds",
            SyncMessage::WaitForAuth { .. } => "WaitForAuth",
            SyncMessage::AuthResult { .. } => "AuthResult",
            SyncMessage::OpenStream { .. } => "OpenStream",
            SyncMessage::StreamOpened => "StreamOpened",
            SyncMessage::FileChanged(_) => "FileChanged",
            SyncMessage::Status { .. } => "Status",
        }
    }

    /// Check if this is a change message
    pub fn is_file_changed(&self) -> bool {
        matches!(self, SyncMessage::FileChanged(_))
    }

    /// Check if this is a terminal status
    pub fn is_status(&self) -> bool {
        matches!(self, SyncMessage::Status { .. })
    }
}

/// Wrapper for versioned messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Protocol version 1
    V1(SyncMessage),
}

impl WireMessage {
    /// Create a new wire message wrapping a sync message
    pub fn new(msg: SyncMessage) -> Self {
        WireMessage::V1(msg)
    }

    /// Encode wire message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode wire message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    /// Unwrap the inner SyncMessage
    pub fn into_inner(self) -> SyncMessage {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }

    /// Get the protocol version
    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}
