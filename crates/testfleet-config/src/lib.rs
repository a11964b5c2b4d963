//! KDL configuration parsing for the testfleet queue server.
//!
//! This crate handles parsing of:
//! - Server settings (listen address, protocol version)
//! - Worker aliveness and termination policies
//! - Per-worker configuration

pub mod error;
pub mod server;

pub use error::{ConfigError, ConfigResult};
pub use server::{
    AlivenessPolicy, MAX_REPORT_ALIVE_INTERVAL_SECS, QueueServerConfig, TerminationPolicy,
    WorkerAlivenessPolicy, WorkerDefinition, load_server_config, parse_server_config,
    validate_report_alive_interval,
};
