// =============================================================================
// Feed seams — historical snapshot source and live kline subscriptions
// =============================================================================
//
// The chart session only sees these traits. A live subscription is an owned
// handle: events arrive on its channel, and dropping or cancelling the handle
// tears down the producing task, so an old subscription can never deliver
// into a new one.
// =============================================================================

use std::future::Future;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::types::{Candle, CandleKey};

/// One live kline update: the full current state of its bar plus the time the
/// exchange emitted it (UNIX seconds).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveTick {
    pub candle: Candle,
    pub event_time: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Tick(LiveTick),
    /// The stream errored or closed. Terminal for this subscription.
    Closed { reason: Option<String> },
}

/// One-shot fetch of the most recent `limit` bars, oldest first.
pub trait HistoricalSource: Clone + Send + Sync + 'static {
    fn fetch(&self, key: &CandleKey, limit: u32) -> impl Future<Output = Result<Vec<Candle>>> + Send;
}

/// Opens live kline subscriptions.
pub trait LiveSource: Send + 'static {
    fn subscribe(&self, key: &CandleKey) -> KlineSubscription;
}

/// Owned handle to one live subscription.
#[derive(Debug)]
pub struct KlineSubscription {
    id: Uuid,
    key: CandleKey,
    events: mpsc::Receiver<StreamEvent>,
    task: Option<JoinHandle<()>>,
}

impl KlineSubscription {
    pub fn new(key: CandleKey, events: mpsc::Receiver<StreamEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            events,
            task,
        }
    }

    /// A subscription fed by hand through the returned sender.
    #[cfg(test)]
    pub fn channel(key: CandleKey, capacity: usize) -> (mpsc::Sender<StreamEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(key, rx, None))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event; `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Stop the producer and discard anything still queued.
    pub fn cancel(self) {
        debug!(id = %self.id, key = %self.key, "cancelling kline subscription");
    }
}

impl Drop for KlineSubscription {
    fn drop(&mut self) {
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CandleKey {
        CandleKey::new("BTCUSDT", "1m").unwrap()
    }

    #[tokio::test]
    async fn channel_subscription_delivers_events() {
        let (tx, mut sub) = KlineSubscription::channel(key(), 4);
        let tick = LiveTick {
            candle: Candle::new(60, 1.0, 1.0, 1.0, 1.0, 1.0),
            event_time: 61,
        };
        tx.send(StreamEvent::Tick(tick)).await.unwrap();
        assert_eq!(sub.next().await, Some(StreamEvent::Tick(tick)));
        drop(tx);
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn cancel_stops_producer_task() {
        let (_tx, rx) = mpsc::channel(4);
        let alive = std::sync::Arc::new(());
        let held = alive.clone();
        let task = tokio::spawn(async move {
            let _held = held;
            std::future::pending::<()>().await;
        });
        let sub = KlineSubscription::new(key(), rx, Some(task));
        tokio::task::yield_now().await;
        assert_eq!(std::sync::Arc::strong_count(&alive), 2);

        sub.cancel();
        for _ in 0..10 {
            if std::sync::Arc::strong_count(&alive) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(std::sync::Arc::strong_count(&alive), 1);
    }

    #[tokio::test]
    async fn send_after_drop_fails() {
        let (tx, sub) = KlineSubscription::channel(key(), 4);
        drop(sub);
        assert!(tx.send(StreamEvent::Closed { reason: None }).await.is_err());
    }
}
