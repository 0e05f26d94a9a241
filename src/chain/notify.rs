//! Chain event notifications.
//!
//! Tip changes are published on a broadcast channel, always after the
//! chainstate lock has been released. Slow subscribers lose old events
//! rather than blocking validation.

use crate::primitives::Hash256;
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TipChange {
    pub id: Hash256,
    pub height: u32,
    pub time: u32,
}

pub struct ChainNotifier {
    tx: broadcast::Sender<TipChange>,
}

impl Default for ChainNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TipChange> {
        self.tx.subscribe()
    }

    pub fn publish(&self, change: TipChange) {
        // no subscribers is fine
        let _ = self.tx.send(change);
    }
}
