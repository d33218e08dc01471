//! Subscription Registry: per-connection label -> filter-set bookkeeping
//! and live fan-out to each connection's outbound queue.
//!
//! A subscribe first drains a backlog (the Query Engine's resolution of the
//! filters against what's already stored), then the connection is live: any
//! newly published event matching the filters is pushed to the same queue.
//! Registering the same label again atomically replaces the prior filters
//! and its backlog cursor — there is no notion of appending to an existing
//! subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fitrelay_core::{Event, Filter};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::wire::ServerMessage;

pub type ConnectionId = u64;

struct ConnectionSubs {
    sender: mpsc::Sender<String>,
    subscriptions: HashMap<String, Vec<Filter>>,
    /// Set when a live EVENT frame had to be dropped because the outbound
    /// queue was full. Per §4.7, back-pressure shedding may only discard
    /// backlog frames, never a live one — the connection task polls this
    /// flag and tears the connection down rather than silently losing
    /// live events.
    overflowed: Arc<AtomicBool>,
}

/// Registry of every connection's live subscriptions, keyed first by
/// connection then by subscription label.
#[derive(Default)]
pub struct SubscriptionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionSubs>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound sender, returning the flag the
    /// connection task should poll to notice a dropped live frame.
    pub fn register_connection(
        &self,
        id: ConnectionId,
        sender: mpsc::Sender<String>,
    ) -> Arc<AtomicBool> {
        let overflowed = Arc::new(AtomicBool::new(false));
        self.connections.write().insert(
            id,
            ConnectionSubs {
                sender,
                subscriptions: HashMap::new(),
                overflowed: overflowed.clone(),
            },
        );
        overflowed
    }

    pub fn remove_connection(&self, id: ConnectionId) {
        self.connections.write().remove(&id);
    }

    /// Replace (or create) a labeled subscription. Shedding of a full
    /// outbound queue is handled by the caller via `try_send` back-pressure
    /// on the backlog it's about to push — this call only updates the
    /// live-match table.
    pub fn subscribe(&self, id: ConnectionId, label: &str, filters: Vec<Filter>) {
        if let Some(conn) = self.connections.write().get_mut(&id) {
            conn.subscriptions.insert(label.to_string(), filters);
        }
    }

    pub fn unsubscribe(&self, id: ConnectionId, label: &str) {
        if let Some(conn) = self.connections.write().get_mut(&id) {
            conn.subscriptions.remove(label);
        }
    }

    /// Push a backlog of already-stored events for one label, oldest-first
    /// shedding if the connection's outbound queue is saturated: each frame
    /// is offered with `try_send`, and once it fails the remaining backlog
    /// for this label is dropped rather than blocking the fan-out path.
    pub async fn send_backlog(&self, id: ConnectionId, label: &str, events: Vec<Event>) -> usize {
        let sender = {
            let connections = self.connections.read();
            connections.get(&id).map(|c| c.sender.clone())
        };
        let Some(sender) = sender else { return 0 };

        let mut sent = 0;
        for event in events {
            let frame = ServerMessage::Event {
                label: label.to_string(),
                event,
            }
            .to_frame();
            if sender.try_send(frame).is_err() {
                break;
            }
            sent += 1;
        }
        let eose = ServerMessage::EndOfStored {
            label: label.to_string(),
        }
        .to_frame();
        let _ = sender.try_send(eose);
        sent
    }

    /// Fan a freshly published event out to every connection with a
    /// matching live subscription. A live frame is never silently dropped:
    /// if a connection's queue is saturated, the connection is flagged as
    /// overflowed (and best-effort notified) so its task tears it down,
    /// rather than the publisher blocking or the event quietly vanishing.
    pub fn fan_out(&self, event: &Event) {
        let connections = self.connections.read();
        for conn in connections.values() {
            for (label, filters) in &conn.subscriptions {
                if fitrelay_core::filter::matches_any(filters, event) {
                    let frame = ServerMessage::Event {
                        label: label.clone(),
                        event: event.clone(),
                    }
                    .to_frame();
                    if conn.sender.try_send(frame).is_err() {
                        conn.overflowed.store(true, Ordering::Relaxed);
                        let _ = conn.sender.try_send(
                            ServerMessage::Notice {
                                message: "outbound queue overflow: a live event was dropped"
                                    .to_string(),
                            }
                            .to_frame(),
                        );
                    }
                }
            }
        }
    }

    /// Best-effort NOTICE to one connection, used when asynchronous
    /// satellite forwarding ultimately fails. Returns `false` if the
    /// connection is gone or its queue is saturated.
    pub fn notify(&self, id: ConnectionId, message: &str) -> bool {
        let sender = {
            let connections = self.connections.read();
            connections.get(&id).map(|c| c.sender.clone())
        };
        match sender {
            Some(sender) => sender
                .try_send(ServerMessage::Notice { message: message.to_string() }.to_frame())
                .is_ok(),
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn subscription_count(&self, id: ConnectionId) -> usize {
        self.connections
            .read()
            .get(&id)
            .map(|c| c.subscriptions.len())
            .unwrap_or(0)
    }
}

pub type SharedSubscriptionRegistry = Arc<SubscriptionRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use fitrelay_core::event::{sign_event, UnsignedEvent};
    use rand::rngs::OsRng;

    fn make_event(kind: u32, created_at: i64) -> Event {
        let key = SigningKey::generate(&mut OsRng);
        let unsigned = UnsignedEvent {
            pubkey: hex::encode(key.verifying_key().to_bytes()),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
        };
        sign_event(&unsigned, &key).unwrap()
    }

    #[tokio::test]
    async fn resubscribing_same_label_replaces_filters() {
        let registry = SubscriptionRegistry::new();
        let (tx, _rx) = mpsc::channel(16);
        registry.register_connection(1, tx);

        registry.subscribe(
            1,
            "s1",
            vec![Filter {
                kinds: Some(vec![1301]),
                ..Filter::new()
            }],
        );
        registry.subscribe(
            1,
            "s1",
            vec![Filter {
                kinds: Some(vec![33401]),
                ..Filter::new()
            }],
        );
        assert_eq!(registry.subscription_count(1), 1);

        let event = make_event(33401, 1_700_000_000);
        let (tx2, mut rx2) = mpsc::channel(16);
        registry.register_connection(2, tx2);
        registry.subscribe(
            2,
            "s1",
            vec![Filter {
                kinds: Some(vec![1301]),
                ..Filter::new()
            }],
        );
        registry.fan_out(&event);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn fan_out_reaches_matching_live_subscription() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::channel(16);
        registry.register_connection(1, tx);
        registry.subscribe(
            1,
            "s1",
            vec![Filter {
                kinds: Some(vec![33401]),
                ..Filter::new()
            }],
        );

        let event = make_event(33401, 1_700_000_000);
        registry.fan_out(&event);

        let frame = rx.try_recv().unwrap();
        assert!(frame.starts_with(r#"["EVENT","s1""#));
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_fan_out() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::channel(16);
        registry.register_connection(1, tx);
        registry.subscribe(
            1,
            "s1",
            vec![Filter {
                kinds: Some(vec![33401]),
                ..Filter::new()
            }],
        );
        registry.unsubscribe(1, "s1");

        let event = make_event(33401, 1_700_000_000);
        registry.fan_out(&event);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notify_reaches_the_named_connection_only() {
        let registry = SubscriptionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(16);
        let (tx2, mut rx2) = mpsc::channel(16);
        registry.register_connection(1, tx1);
        registry.register_connection(2, tx2);

        assert!(registry.notify(1, "satellite forward failed"));

        let frame = rx1.try_recv().unwrap();
        assert!(frame.starts_with(r#"["NOTICE""#));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn notify_on_unknown_connection_reports_failure() {
        let registry = SubscriptionRegistry::new();
        assert!(!registry.notify(99, "nobody is listening"));
    }

    #[tokio::test]
    async fn backlog_ends_with_eose_even_when_empty() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::channel(16);
        registry.register_connection(1, tx);

        registry.send_backlog(1, "s1", vec![]).await;
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame, r#"["EOSE","s1"]"#);
    }

    #[tokio::test]
    async fn dropped_live_frame_flags_the_connection_as_overflowed() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        let overflowed = registry.register_connection(1, tx);
        registry.subscribe(
            1,
            "s1",
            vec![Filter {
                kinds: Some(vec![33401]),
                ..Filter::new()
            }],
        );

        // Saturate the queue with a single slot, then force a drop.
        let first = make_event(33401, 1_700_000_000);
        let second = make_event(33401, 1_700_000_001);
        registry.fan_out(&first);
        assert!(!overflowed.load(std::sync::atomic::Ordering::Relaxed));

        registry.fan_out(&second);
        assert!(overflowed.load(std::sync::atomic::Ordering::Relaxed));

        // The one slot holds the first live frame; the second was dropped
        // and the overflow flag is the only trace of it.
        let frame = rx.try_recv().unwrap();
        assert!(frame.starts_with(r#"["EVENT","s1""#));
        assert!(frame.contains(&first.id));
    }
}
