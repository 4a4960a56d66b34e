//! ---
//! shdr_section: "04-agent-client"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Agent-side SHDR client and line routing."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Agent side of the SHDR protocol: connects to an adapter, keeps the
//! heartbeat, routes lines by device metadata and reports the decoded values.

pub mod client;
pub mod device;
pub mod heartbeat;
pub mod ingest;
pub mod metrics;
pub mod router;

/// Shared result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised by the agent-side client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The TCP connection could not be established.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// `host:port` of the adapter.
        endpoint: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// Connecting took longer than the connect timeout.
    #[error("connecting to {endpoint} timed out")]
    ConnectTimeout {
        /// `host:port` of the adapter.
        endpoint: String,
    },
    /// A write took longer than the write timeout.
    #[error("write timed out")]
    WriteTimeout,
    /// The connection loop panicked or was cancelled.
    #[error("client task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// Other socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub use client::{ClientEvent, ClientHandle, ShdrClient};
pub use device::{observation_kind, DeviceModel, StaticDevice};
pub use heartbeat::HeartbeatState;
pub use ingest::{ChannelSink, Ingested, ObservationSink};
pub use metrics::ClientMetrics;
pub use router::{DropReason, LineRouter, Routed};
