//! Broadcast of durable writes to external observers (GUI, API)
//!
//! Non-blocking: `notify` never awaits and never fails. Without subscribers
//! the event is dropped; slow subscribers lag rather than block the writer.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A new prompt record was written
    Recorded,
    /// A file association was added to an existing record
    Associated,
    /// Records were restored into the primary store from the backup
    Restored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub prompt_id: String,
    pub conversation_id: String,
}

pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
    sent: AtomicU64,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            sent: AtomicU64::new(0),
        }
    }

    /// Fire and forget. Returns how many subscribers received the event.
    pub fn notify(&self, event: ChangeEvent) -> usize {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
