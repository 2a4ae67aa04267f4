//! C9 - Event & Log Fanout (spec.md §4.9).

use std::collections::HashMap;
use std::sync::Arc;

use scc::HashMap as ConcurrentHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use crate::model::{EventType, ExecutionId, ExecutionUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionKind {
    EventsOnly,
    LogsOnly,
    All,
}

impl SubscriptionKind {
    fn accepts(&self, update: &ExecutionUpdate) -> bool {
        match self {
            SubscriptionKind::All => true,
            SubscriptionKind::EventsOnly => !matches!(update, ExecutionUpdate::Log(_)),
            SubscriptionKind::LogsOnly => matches!(update, ExecutionUpdate::Log(_)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    Sse,
    Ws,
    Webhook,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub subscriber_id: String,
    pub execution_id: ExecutionId,
    pub kind: SubscriptionKind,
    pub delivery: DeliveryMode,
    pub webhook_url: Option<String>,
}

/// Sentinel delivered as the final item of a subscription's stream when
/// its buffer overflows (spec.md §4.9).
#[derive(Debug, Clone)]
pub struct SubscriberOverflow {
    pub dropped_count: u64,
}

#[derive(Debug, Clone)]
pub enum DeliveredItem {
    Update(ExecutionUpdate),
    Overflow(SubscriberOverflow),
}

struct Subscriber {
    kind: SubscriptionKind,
    sender: mpsc::Sender<DeliveredItem>,
    dropped: std::sync::atomic::AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

/// Fans every `ExecutionUpdate` received from C4/C7 out to each
/// subscription registered for that execution, each over a bounded
/// per-subscriber buffer (spec.md §4.9). Ordering within a subscription
/// matches the order `publish` was called, which C4 guarantees matches
/// the order messages arrived on the worker stream.
pub struct Fanout {
    buffer_size: usize,
    subscribers: ConcurrentHashMap<ExecutionId, Vec<Arc<Subscriber>>>,
}

impl Fanout {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            subscribers: ConcurrentHashMap::new(),
        }
    }

    /// Registers a subscription and returns its unique id alongside the
    /// lazy, infinite, non-restartable item stream.
    pub async fn subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> (String, ReceiverStream<DeliveredItem>) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let id = format!("{}-{}", request.subscriber_id, Uuid::new_v4());
        let subscriber = Arc::new(Subscriber {
            kind: request.kind,
            sender: tx,
            dropped: std::sync::atomic::AtomicU64::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        });

        self.subscribers
            .entry_async(request.execution_id)
            .await
            .or_insert_with(Vec::new)
            .push(subscriber);

        (id, ReceiverStream::new(rx))
    }

    /// Publishes `update` to every live subscriber of its execution. A
    /// full buffer is treated as overflow: the subscriber is closed
    /// with `SUBSCRIBER_OVERFLOW` and its drop count recorded, per
    /// spec.md §4.9 - it is never blocked on.
    pub async fn publish(&self, update: ExecutionUpdate) {
        let execution_id = update.execution_id().clone();
        self.subscribers
            .update_async(&execution_id, |_, subs| {
                for sub in subs.iter() {
                    if sub.closed.load(std::sync::atomic::Ordering::Relaxed) {
                        continue;
                    }
                    if !sub.kind.accepts(&update) {
                        continue;
                    }
                    match sub.sender.try_send(DeliveredItem::Update(update.clone())) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            let dropped = sub.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                            sub.closed.store(true, std::sync::atomic::Ordering::Relaxed);
                            let sender = sub.sender.clone();
                            warn!(%execution_id, dropped, "subscriber buffer overflow, closing");
                            tokio::spawn(async move {
                                let _ = sender
                                    .send(DeliveredItem::Overflow(SubscriberOverflow { dropped_count: dropped }))
                                    .await;
                            });
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            sub.closed.store(true, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;
    }

    /// Drops bookkeeping for every subscription of a completed
    /// execution; called once C8 publishes the final update.
    pub async fn retire(&self, execution_id: &ExecutionId) {
        self.subscribers.remove_async(execution_id).await;
    }
}

/// `EventType` filter helper exposed for an (out-of-scope) HTTP façade
/// deciding which updates a REST/SSE client asked for.
pub fn matches_event_filter(update: &ExecutionUpdate, filter: &HashMap<String, EventType>) -> bool {
    match update {
        ExecutionUpdate::Event(event) => filter
            .values()
            .any(|wanted| *wanted == event.event_type),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventUpdate, LogStream, LogUpdate};
    use chrono::Utc;

    fn execution_id() -> ExecutionId {
        ExecutionId::new("e1").unwrap()
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let fanout = Fanout::new(8);
        let (_id, mut stream) = fanout
            .subscribe(SubscriptionRequest {
                subscriber_id: "sub".to_string(),
                execution_id: execution_id(),
                kind: SubscriptionKind::All,
                delivery: DeliveryMode::Sse,
                webhook_url: None,
            })
            .await;

        for i in 0..3 {
            fanout
                .publish(ExecutionUpdate::Event(EventUpdate {
                    execution_id: execution_id(),
                    event_type: EventType::StatusUpdate,
                    message: format!("msg-{i}"),
                    timestamp: Utc::now(),
                }))
                .await;
        }

        use tokio_stream::StreamExt;
        for i in 0..3 {
            match stream.next().await.unwrap() {
                DeliveredItem::Update(ExecutionUpdate::Event(event)) => {
                    assert_eq!(event.message, format!("msg-{i}"));
                }
                other => panic!("unexpected item: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn logs_only_subscription_filters_events() {
        let fanout = Fanout::new(8);
        let (_id, mut stream) = fanout
            .subscribe(SubscriptionRequest {
                subscriber_id: "sub".to_string(),
                execution_id: execution_id(),
                kind: SubscriptionKind::LogsOnly,
                delivery: DeliveryMode::Sse,
                webhook_url: None,
            })
            .await;

        fanout
            .publish(ExecutionUpdate::Event(EventUpdate {
                execution_id: execution_id(),
                event_type: EventType::StatusUpdate,
                message: "ignored".to_string(),
                timestamp: Utc::now(),
            }))
            .await;
        fanout
            .publish(ExecutionUpdate::Log(LogUpdate {
                execution_id: execution_id(),
                stream: LogStream::Stdout,
                content: b"hi".to_vec(),
                timestamp: Utc::now(),
            }))
            .await;

        use tokio_stream::StreamExt;
        match stream.next().await.unwrap() {
            DeliveredItem::Update(ExecutionUpdate::Log(_)) => {}
            other => panic!("expected a log update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_closes_subscriber_with_drop_count() {
        let fanout = Fanout::new(1);
        let (_id, mut stream) = fanout
            .subscribe(SubscriptionRequest {
                subscriber_id: "sub".to_string(),
                execution_id: execution_id(),
                kind: SubscriptionKind::All,
                delivery: DeliveryMode::Sse,
                webhook_url: None,
            })
            .await;

        for i in 0..5 {
            fanout
                .publish(ExecutionUpdate::Event(EventUpdate {
                    execution_id: execution_id(),
                    event_type: EventType::StatusUpdate,
                    message: format!("msg-{i}"),
                    timestamp: Utc::now(),
                }))
                .await;
        }

        use tokio_stream::StreamExt;
        let mut saw_overflow = false;
        while let Some(item) = stream.next().await {
            if let DeliveredItem::Overflow(overflow) = item {
                assert!(overflow.dropped_count >= 1);
                saw_overflow = true;
                break;
            }
        }
        assert!(saw_overflow);
    }
}
