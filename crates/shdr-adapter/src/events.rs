//! ---
//! shdr_section: "03-adapter-server"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Change-tracked store and SHDR broadcast server."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

/// Process-unique identifier of an accepted agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Lifecycle notifications published by a running adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdapterEvent {
    /// The listener is bound.
    Listening {
        /// Bound address.
        address: SocketAddr,
    },
    /// An agent connected and received the current snapshot.
    ClientConnected {
        /// Connection id.
        client_id: ClientId,
        /// Peer address.
        address: SocketAddr,
    },
    /// An agent sent `* PING`.
    PingReceived {
        /// Connection id.
        client_id: ClientId,
    },
    /// Writing to an agent failed; the connection is dropped.
    WriteFailed {
        /// Connection id.
        client_id: ClientId,
        /// Failure description.
        message: String,
    },
    /// An agent connection ended.
    ClientDisconnected {
        /// Connection id.
        client_id: ClientId,
        /// Peer address.
        address: SocketAddr,
        /// Why the connection ended.
        reason: String,
    },
    /// The server stopped.
    Stopped,
}
