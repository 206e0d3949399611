use crate::metrics::Metrics;
use futures_util::StreamExt;
use rally_proto::{Envelope, EventKind};
use rally_storage::SharedStore;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

pub const EVENTS_CHANNEL: &str = "rally:events";
const RESUBSCRIBE_DELAY_SECS: u64 = 2;

pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Capability interface the orchestrator uses to reach live connections.
/// Delivery is best-effort; failures are logged, never surfaced.
pub trait Notifier: Send + Sync {
    fn notify_user<'a>(
        &'a self,
        user_id: &'a str,
        event: EventKind,
        payload: Value,
    ) -> NotifyFuture<'a>;

    fn notify_session<'a>(
        &'a self,
        session_id: &'a str,
        event: EventKind,
        payload: Value,
    ) -> NotifyFuture<'a>;
}

pub struct ConnectionEntry {
    sender: mpsc::Sender<Envelope>,
    pub user_id: String,
    next_sequence: AtomicU64,
}

impl ConnectionEntry {
    fn new(sender: mpsc::Sender<Envelope>, user_id: String) -> Self {
        ConnectionEntry {
            sender,
            user_id,
            next_sequence: AtomicU64::new(1),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }
}

/// Cluster-wide fan-out of live events. An emission is published once to the
/// shared store; every worker's subscriber delivers it to its own local
/// connections in the target group, so a user connected anywhere is reached.
pub struct EventBus {
    shared: SharedStore,
    metrics: Arc<Metrics>,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    user_groups: RwLock<HashMap<String, HashSet<String>>>,
    session_groups: RwLock<HashMap<String, HashSet<String>>>,
}

impl EventBus {
    pub fn new(shared: SharedStore, metrics: Arc<Metrics>) -> Self {
        EventBus {
            shared,
            metrics,
            connections: RwLock::new(HashMap::new()),
            user_groups: RwLock::new(HashMap::new()),
            session_groups: RwLock::new(HashMap::new()),
        }
    }

    /// Binds a connection to its user's delivery group.
    pub async fn register_connection(
        &self,
        connection_id: &str,
        user_id: &str,
        sender: mpsc::Sender<Envelope>,
    ) {
        let mut connections = self.connections.write().await;
        connections.insert(
            connection_id.to_string(),
            ConnectionEntry::new(sender, user_id.to_string()),
        );
        drop(connections);
        let mut groups = self.user_groups.write().await;
        groups
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    /// Releases a connection and every group membership it held.
    pub async fn deregister_connection(&self, connection_id: &str) -> Option<String> {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.remove(connection_id)
        };
        let user_id = removed.map(|entry| entry.user_id);
        if let Some(user_id) = user_id.as_deref() {
            let mut groups = self.user_groups.write().await;
            if let Some(members) = groups.get_mut(user_id) {
                members.remove(connection_id);
                if members.is_empty() {
                    groups.remove(user_id);
                }
            }
        }
        let mut sessions = self.session_groups.write().await;
        sessions.retain(|_, members| {
            members.remove(connection_id);
            !members.is_empty()
        });
        user_id
    }

    pub async fn join_session(&self, connection_id: &str, session_id: &str) {
        let mut sessions = self.session_groups.write().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    pub async fn leave_session(&self, connection_id: &str, session_id: &str) {
        let mut sessions = self.session_groups.write().await;
        if let Some(members) = sessions.get_mut(session_id) {
            members.remove(connection_id);
            if members.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    pub async fn next_sequence(&self, connection_id: &str) -> u64 {
        let connections = self.connections.read().await;
        connections
            .get(connection_id)
            .map(|entry| entry.next_sequence())
            .unwrap_or(0)
    }

    async fn local_targets(
        &self,
        members: &HashSet<String>,
    ) -> Vec<(mpsc::Sender<Envelope>, u64)> {
        let connections = self.connections.read().await;
        members
            .iter()
            .filter_map(|connection_id| {
                connections
                    .get(connection_id)
                    .map(|entry| (entry.sender.clone(), entry.next_sequence()))
            })
            .collect()
    }

    /// Delivers an event to every local connection of the user, at most once
    /// per connection.
    async fn deliver_user(&self, user_id: &str, event: EventKind, payload: &Value) {
        let members = {
            let groups = self.user_groups.read().await;
            groups.get(user_id).cloned()
        };
        let Some(members) = members else {
            return;
        };
        for (sender, sequence) in self.local_targets(&members).await {
            let envelope = Envelope::new(sequence, event, payload.clone());
            if sender.send(envelope).await.is_ok() {
                self.metrics.mark_live_egress();
            }
        }
    }

    async fn deliver_session(&self, session_id: &str, event: EventKind, payload: &Value) {
        let members = {
            let sessions = self.session_groups.read().await;
            sessions.get(session_id).cloned()
        };
        let Some(members) = members else {
            return;
        };
        for (sender, sequence) in self.local_targets(&members).await {
            let envelope = Envelope::new(sequence, event, payload.clone());
            if sender.send(envelope).await.is_ok() {
                self.metrics.mark_live_egress();
            }
        }
    }

    async fn publish(&self, scope: &str, target: &str, event: EventKind, payload: Value) {
        let message = json!({
            "scope": scope,
            "target": target,
            "event": event.as_str(),
            "payload": payload,
        })
        .to_string();
        if let Err(err) = self.shared.publish(EVENTS_CHANNEL, &message).await {
            warn!(scope = scope, target = target, event = %event, "event publish failed: {}", err);
        }
    }

    fn dispatch_message(self: &Arc<Self>, raw: &str) {
        let Ok(parsed) = serde_json::from_str::<Value>(raw) else {
            debug!("discarding malformed bus message");
            return;
        };
        let scope = parsed.get("scope").and_then(|v| v.as_str());
        let target = parsed.get("target").and_then(|v| v.as_str());
        let event = parsed
            .get("event")
            .and_then(|v| v.as_str())
            .and_then(|name| EventKind::from_str(name).ok());
        let payload = parsed.get("payload").cloned().unwrap_or(Value::Null);
        let (Some(scope), Some(target), Some(event)) = (scope, target, event) else {
            debug!("discarding bus message without routing fields");
            return;
        };
        let bus = Arc::clone(self);
        let scope = scope.to_string();
        let target = target.to_string();
        tokio::spawn(async move {
            match scope.as_str() {
                "user" => bus.deliver_user(&target, event, &payload).await,
                "session" => bus.deliver_session(&target, event, &payload).await,
                other => debug!(scope = other, "unknown bus scope"),
            }
        });
    }

    /// Runs the per-process subscriber that turns shared-store publications
    /// into local deliveries. Reconnects with a delay on subscription loss.
    pub fn spawn_subscriber(self: &Arc<Self>) {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let pubsub = match bus.shared.subscribe(EVENTS_CHANNEL).await {
                    Ok(pubsub) => pubsub,
                    Err(err) => {
                        warn!("event subscription failed: {}", err);
                        tokio::time::sleep(Duration::from_secs(RESUBSCRIBE_DELAY_SECS)).await;
                        continue;
                    }
                };
                let mut messages = pubsub.into_on_message();
                while let Some(message) = messages.next().await {
                    match message.get_payload::<String>() {
                        Ok(raw) => bus.dispatch_message(&raw),
                        Err(err) => debug!("undecodable bus message: {}", err),
                    }
                }
                warn!("event subscription closed; resubscribing");
                tokio::time::sleep(Duration::from_secs(RESUBSCRIBE_DELAY_SECS)).await;
            }
        });
    }
}

impl Notifier for EventBus {
    fn notify_user<'a>(
        &'a self,
        user_id: &'a str,
        event: EventKind,
        payload: Value,
    ) -> NotifyFuture<'a> {
        Box::pin(async move {
            self.publish("user", user_id, event, payload).await;
        })
    }

    fn notify_session<'a>(
        &'a self,
        session_id: &'a str,
        event: EventKind,
        payload: Value,
    ) -> NotifyFuture<'a> {
        Box::pin(async move {
            self.publish("session", session_id, event, payload).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use rally_storage::shared;

    async fn test_bus() -> Option<Arc<EventBus>> {
        let url = match std::env::var("RALLY_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping bus test: RALLY_TEST_REDIS_URL not set");
                return None;
            }
        };
        let store = shared::connect(&url).await.expect("redis connection");
        Some(Arc::new(EventBus::new(store, Arc::new(Metrics::new()))))
    }

    #[tokio::test]
    async fn group_membership_tracks_connections() {
        let Some(bus) = test_bus().await else {
            return;
        };
        let (tx, mut rx) = mpsc::channel(8);
        bus.register_connection("conn-1", "user-1", tx).await;
        bus.join_session("conn-1", "session-9").await;

        bus.deliver_user("user-1", EventKind::ChallengeReceived, &json!({"n": 1}))
            .await;
        let envelope = rx.recv().await.expect("delivery");
        assert_eq!(envelope.event, EventKind::ChallengeReceived);
        assert_eq!(envelope.sequence, 1);

        bus.deliver_session("session-9", EventKind::SessionReady, &json!({"n": 2}))
            .await;
        let envelope = rx.recv().await.expect("session delivery");
        assert_eq!(envelope.event, EventKind::SessionReady);
        assert_eq!(envelope.sequence, 2);

        let user = bus.deregister_connection("conn-1").await;
        assert_eq!(user.as_deref(), Some("user-1"));
        bus.deliver_user("user-1", EventKind::Ack, &Value::Null).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn published_events_reach_local_subscriber() {
        let Some(bus) = test_bus().await else {
            return;
        };
        bus.spawn_subscriber();
        // allow the subscription to establish before publishing
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (tx, mut rx) = mpsc::channel(8);
        bus.register_connection("conn-pub", "user-pub", tx).await;
        bus.notify_user("user-pub", EventKind::ChallengeWakeUp, json!({"challenge_id": "c1"}))
            .await;

        let received = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timely delivery")
            .expect("open channel");
        assert_eq!(received.event, EventKind::ChallengeWakeUp);
        assert_eq!(received.payload["challenge_id"], json!("c1"));
    }
}
