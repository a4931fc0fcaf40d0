// src/engine/events.rs

//! Status-change fan-out.
//!
//! The core publishes one [`StatusEvent`] per applied transition on a
//! `tokio::sync::broadcast` channel. A transport layer subscribes and
//! forwards; the engine never waits on subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::job::JobId;
use crate::types::JobStatus;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub job_id: JobId,
    /// `None` for the creation event.
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Which events a subscription yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    Job(JobId),
    All,
}

impl WatchScope {
    fn matches(&self, event: &StatusEvent) -> bool {
        match self {
            WatchScope::All => true,
            WatchScope::Job(id) => event.job_id == *id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: StatusEvent) {
        // No receivers is fine; nobody is watching.
        if self.tx.send(event).is_err() {
            trace!("status event dropped; no subscribers");
        }
    }

    /// Events published after this call, filtered by `scope`.
    pub fn subscribe(&self, scope: WatchScope) -> StatusSubscription {
        StatusSubscription {
            rx: self.tx.subscribe(),
            scope,
        }
    }
}

/// A live, non-restartable stream of status changes.
#[derive(Debug)]
pub struct StatusSubscription {
    rx: broadcast::Receiver<StatusEvent>,
    scope: WatchScope,
}

impl StatusSubscription {
    /// Next matching event, or `None` once the engine is gone.
    ///
    /// A subscriber that falls behind the channel capacity skips the missed
    /// events and keeps going.
    pub async fn next(&mut self) -> Option<StatusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.scope.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, scope = ?self.scope, "status subscriber lagged; events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
