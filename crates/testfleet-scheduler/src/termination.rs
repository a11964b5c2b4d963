//! Decides when the queue server process may exit.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use testfleet_config::TerminationPolicy;

/// Tracks activity and veto locks against a [`TerminationPolicy`].
pub struct TerminationController {
    policy: TerminationPolicy,
    last_activity_millis: AtomicI64,
    locks: Arc<AtomicUsize>,
}

/// Prevents termination while held.
#[must_use = "termination is only vetoed while the lock is alive"]
pub struct TerminationLock {
    locks: Arc<AtomicUsize>,
}

impl Drop for TerminationLock {
    fn drop(&mut self) {
        self.locks.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TerminationController {
    pub fn new(policy: TerminationPolicy, now: DateTime<Utc>) -> Self {
        Self {
            policy,
            last_activity_millis: AtomicI64::new(now.timestamp_millis()),
            locks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn indicate_activity(&self, now: DateTime<Utc>) {
        self.last_activity_millis
            .fetch_max(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn lock(&self) -> TerminationLock {
        self.locks.fetch_add(1, Ordering::SeqCst);
        TerminationLock {
            locks: self.locks.clone(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locks.load(Ordering::SeqCst) > 0
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let idle = now.timestamp_millis() - self.last_activity_millis.load(Ordering::SeqCst);
        Duration::from_millis(idle.max(0) as u64)
    }

    /// True when the policy allows exiting right now.
    pub fn may_terminate(&self, queue_depleted: bool, now: DateTime<Utc>) -> bool {
        match self.policy {
            TerminationPolicy::StayAlive => false,
            TerminationPolicy::AfterBeingIdle { period_secs } => {
                queue_depleted
                    && !self.is_locked()
                    && self.idle_for(now) >= Duration::from_secs(period_secs)
            }
        }
    }
}
