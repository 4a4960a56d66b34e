//! ---
//! shdr_section: "03-adapter-server"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Change-tracked store and SHDR broadcast server."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Adapter side of the SHDR protocol: a change-tracked observation store and
//! a TCP server that replays the store to new agents and broadcasts deltas.

mod connection;
pub mod events;
pub mod metrics;
pub mod server;
pub mod store;

use std::net::SocketAddr;

/// Shared result type for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors returned while starting or stopping the adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The listener could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Requested listen address.
        address: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// A background task panicked or was cancelled.
    #[error("adapter task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// Other socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub use events::{AdapterEvent, ClientId};
pub use metrics::AdapterMetrics;
pub use server::{AdapterHandle, ShdrAdapter};
pub use store::{ObservationStore, StoreSnapshot};
