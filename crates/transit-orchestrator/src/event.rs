//! Per-ticket progress/terminal event delivery (spec.md §4.7). Delivery is
//! best-effort: the publisher never blocks the controller, so a lagging or
//! absent subscriber only loses events, never stalls a transfer.

use std::path::PathBuf;

use tokio::sync::broadcast;
use transit_core::{CompletionCode, Ticket};

#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress {
        bytes_completed: u64,
        bytes_total: u64,
    },
    Paused,
    Interrupted,
    Terminal {
        code: CompletionCode,
        http_status: Option<u16>,
        target: Option<PathBuf>,
    },
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, ticket: Ticket, event: TransferEvent);
}

/// Fan-out publisher backed by a `tokio::sync::broadcast` channel, keyed by
/// ticket on the receiving side (subscribers filter their own ticket).
pub struct BroadcastEventPublisher {
    tx: broadcast::Sender<(Ticket, TransferEvent)>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(Ticket, TransferEvent)> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastEventPublisher {
    fn publish(&self, ticket: Ticket, event: TransferEvent) {
        // No receivers is the common case between subscriptions; that is
        // not a failure, so the send error is discarded.
        let _ = self.tx.send((ticket, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_published_events_for_its_ticket() {
        let publisher = BroadcastEventPublisher::new(16);
        let mut rx = publisher.subscribe();

        publisher.publish(
            7,
            TransferEvent::Progress {
                bytes_completed: 100,
                bytes_total: 1000,
            },
        );
        publisher.publish(
            7,
            TransferEvent::Terminal {
                code: CompletionCode::Ok,
                http_status: Some(200),
                target: None,
            },
        );

        let (t1, e1) = rx.recv().await.unwrap();
        assert_eq!(t1, 7);
        assert!(matches!(e1, TransferEvent::Progress { .. }));

        let (t2, e2) = rx.recv().await.unwrap();
        assert_eq!(t2, 7);
        assert!(matches!(e2, TransferEvent::Terminal { .. }));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let publisher = BroadcastEventPublisher::new(4);
        publisher.publish(1, TransferEvent::Paused);
    }
}
