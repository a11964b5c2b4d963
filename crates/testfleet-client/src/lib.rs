//! Client side of the testfleet queue protocol.
//!
//! [`QueueClient`] wraps the HTTP endpoints; [`Worker`] drives a
//! [`TestExecutor`](testfleet_core::executor::TestExecutor) with buckets
//! fetched from the queue until it is told to stop.

pub mod client;
pub mod error;
pub mod worker;

pub use client::QueueClient;
pub use error::{ClientError, ClientResult};
pub use worker::{Worker, WorkerOptions, WorkerSummary};
