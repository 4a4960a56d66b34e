//! ---
//! shdr_section: "01-core-functionality"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Shared primitives and utilities for the SHDR runtime."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
//! Core shared primitives for the SHDR workspace.
//! This crate exposes configuration loading, logging, timestamp helpers and
//! the device-model descriptors consumed by the adapter and agent crates.

pub mod config;
pub mod device;
pub mod logging;
pub mod time;

pub use config::{AdapterConfig, AgentConfig, LoadedConfig, LoggingConfig, ShdrConfig};
pub use device::{Category, DataItemDescriptor, DeviceConfig, Representation};
pub use logging::{init_tracing, log_file_name, LogFormat, LogRole};
pub use time::{format_timestamp, now_micros, parse_timestamp};
