//! Process-wide ingestion status: one writer, any number of readers.

use std::sync::Arc;

use matchfeed_core::{StatusSnapshot, StatusUpdate};
use tokio::sync::watch;

/// Cheap to clone; every clone observes the same snapshot.
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    tx: Arc<watch::Sender<StatusSnapshot>>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Applies only the supplied fields. Last write wins.
    pub fn update(&self, update: StatusUpdate) {
        self.tx.send_modify(|snapshot| update.apply_to(snapshot));
    }

    pub fn read(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }
}
