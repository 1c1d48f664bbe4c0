//! Instance lifecycle events.
//!
//! Engine instances publish notable transitions to a broadcast bus so
//! that observers (logging, the management API) can react without the
//! instance knowing who they are.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use hive_proto::defaults::DEFAULT_EVENT_CHANNEL_SIZE;
use hive_proto::Rank;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    /// The instance has no superblock and is waiting for a format.
    AwaitFormat { index: u32 },
    /// Bring-up completed; the instance is ready under `rank`.
    RankReady { index: u32, rank: Rank, uri: String },
    /// The engine process terminated.
    EngineDied {
        index: u32,
        rank: Rank,
        pid: Option<u32>,
        error: Option<String>,
    },
}

/// Cheaply cloneable handle to the event bus.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<InstanceEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: InstanceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.tx.subscribe()
    }
}

/// Log every event from `rx` until the bus closes. A subscriber that
/// falls behind skips the overwritten events and carries on.
///
/// Returns the number of events logged.
pub async fn log_events(mut rx: broadcast::Receiver<InstanceEvent>) -> usize {
    let mut logged = 0;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!("event logger fell behind, {} event(s) dropped", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            InstanceEvent::AwaitFormat { index } => {
                info!("event: instance {} awaiting format", index)
            }
            InstanceEvent::RankReady { index, rank, uri } => {
                info!("event: instance {} ready as rank {} at {}", index, rank, uri)
            }
            InstanceEvent::EngineDied {
                index,
                rank,
                pid,
                error,
            } => warn!(
                "event: instance {} (rank {}, pid {:?}) died: {}",
                index,
                rank,
                pid,
                error.as_deref().unwrap_or("clean exit")
            ),
        }
        logged += 1;
    }
    logged
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CHANNEL_SIZE)
    }
}
