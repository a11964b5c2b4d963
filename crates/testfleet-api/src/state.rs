//! Application state.

use std::sync::Arc;
use testfleet_config::QueueServerConfig;
use testfleet_core::{SystemClock, UuidIdGenerator};
use testfleet_scheduler::{Dispatcher, DispatcherSettings};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// State backed by the wall clock and UUIDv7 ids.
    pub fn from_config(config: &QueueServerConfig) -> Self {
        let dispatcher = Dispatcher::new(
            DispatcherSettings::from(config),
            Arc::new(SystemClock),
            Arc::new(UuidIdGenerator),
        );
        Self::new(Arc::new(dispatcher))
    }
}
