//! HTTP queue server for testfleet.
//!
//! Exposes worker registration, bucket fetch and result submission plus the
//! job endpoints over JSON.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
