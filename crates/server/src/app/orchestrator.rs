use super::bus::Notifier;
use super::push::PushChannel;
use super::scheduler::TimeoutScheduler;
use crate::metrics::Metrics;
use crate::util::generate_id;
use chrono::{Duration, Utc};
use rally_proto::{EventKind, WakeUpResponse};
use rally_storage::{
    ChallengeRecord, ChallengeState, NewChallenge, PresenceRegistry, SessionRecord, SessionState,
    SharedStore, Storage, StorageError,
};
use serde_json::{Value, json};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum CoreError {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation(String),
    Conflict(String),
    RateLimited,
    Transient(String),
    Internal,
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::NotFound => write!(f, "not found"),
            Self::Validation(reason) => write!(f, "validation failed: {reason}"),
            Self::Conflict(reason) => write!(f, "conflict: {reason}"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::Transient(reason) => write!(f, "transient failure: {reason}"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

impl Error for CoreError {}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Missing => CoreError::NotFound,
            StorageError::Conflict => CoreError::Conflict("conflicting state".to_string()),
            StorageError::Invalid => CoreError::Validation("invalid state".to_string()),
            StorageError::Serialization => CoreError::Internal,
            StorageError::Postgres => CoreError::Transient("record store unavailable".to_string()),
            StorageError::Redis => CoreError::Transient("shared store unavailable".to_string()),
        }
    }
}

#[derive(Clone)]
pub struct HandshakeSettings {
    pub challenge_expiration_seconds: i64,
    pub handshake_timeout_seconds: i64,
    pub max_retry_attempts: i32,
    pub lock_ttl_seconds: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeProgress {
    pub state: ChallengeState,
    pub player_notified: bool,
    pub attempt: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WakeUpOutcome {
    SessionCreated(SessionRecord),
    Declined(ChallengeRecord),
}

fn lock_key(challenge_id: &str) -> String {
    format!("lock:challenge:{challenge_id}")
}

fn wake_up_payload(challenge: &ChallengeRecord) -> Value {
    json!({
        "type": "challenge:wake-up",
        "challengeId": challenge.challenge_id,
        "challenger": challenge.challenged_id,
        "gameType": challenge.game_type,
        "now": Utc::now().to_rfc3339(),
    })
}

/// Top-level use cases of the wake-up handshake. Every state transition runs
/// under the per-challenge shared-store lock, with the record store's
/// transition guards as the second line of defense.
pub struct Orchestrator {
    storage: Arc<Storage>,
    shared: SharedStore,
    presence: PresenceRegistry,
    notifier: Arc<dyn Notifier>,
    scheduler: Arc<dyn TimeoutScheduler>,
    push: Arc<PushChannel>,
    metrics: Arc<Metrics>,
    settings: HandshakeSettings,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        shared: SharedStore,
        presence: PresenceRegistry,
        notifier: Arc<dyn Notifier>,
        scheduler: Arc<dyn TimeoutScheduler>,
        push: Arc<PushChannel>,
        metrics: Arc<Metrics>,
        settings: HandshakeSettings,
    ) -> Self {
        Orchestrator {
            storage,
            shared,
            presence,
            notifier,
            scheduler,
            push,
            metrics,
            settings,
        }
    }

    async fn locked<T, F, Fut>(&self, challenge_id: &str, operation: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let outcome = self
            .shared
            .with_lock(
                &lock_key(challenge_id),
                self.settings.lock_ttl_seconds,
                operation,
            )
            .await
            .map_err(CoreError::from)?;
        match outcome {
            Some(result) => result,
            None => Err(CoreError::Transient("challenge lock unavailable".to_string())),
        }
    }

    async fn challenger_is_online(&self, challenge: &ChallengeRecord) -> bool {
        match self.presence.is_online(&challenge.challenger_id).await {
            Ok(online) => online,
            Err(err) => {
                warn!(
                    challenge = %challenge.challenge_id,
                    "presence probe failed; assuming offline: {}", err
                );
                false
            }
        }
    }

    /// Emits the wake-up over both channels. Live delivery is attempted only
    /// when presence says the challenger is reachable; push always fires
    /// because live confirmation is not available here.
    async fn send_wake_up(&self, challenge: &ChallengeRecord) -> bool {
        let payload = wake_up_payload(challenge);
        let online = self.challenger_is_online(challenge).await;
        if online {
            self.notifier
                .notify_user(
                    &challenge.challenger_id,
                    EventKind::ChallengeWakeUp,
                    payload.clone(),
                )
                .await;
        }
        let pushed = self.push.send(&challenge.challenger_id, &payload).await;
        self.metrics.mark_wakeup_sent();
        online || pushed
    }

    /// Opens a new challenge in PENDING and notifies the challenged party on
    /// a best-effort basis.
    pub async fn create_challenge(
        &self,
        challenger_id: &str,
        challenged_id: &str,
        game_type: &str,
        metadata: Value,
    ) -> Result<ChallengeRecord, CoreError> {
        if challenger_id == challenged_id {
            return Err(CoreError::Validation(
                "cannot challenge yourself".to_string(),
            ));
        }
        if game_type.trim().is_empty() {
            return Err(CoreError::Validation("game_type is required".to_string()));
        }
        let challenger = self.storage.load_user(challenger_id).await?;
        let challenged = self.storage.load_user(challenged_id).await?;
        if !challenged.is_active {
            return Err(CoreError::NotFound);
        }
        let challenge_id = generate_id(&format!("challenge:{challenger_id}:{challenged_id}"));
        let challenge = self
            .storage
            .create_challenge(&NewChallenge {
                challenge_id: &challenge_id,
                challenger_id,
                challenged_id,
                game_type: game_type.trim(),
                expires_at: Utc::now()
                    + Duration::seconds(self.settings.challenge_expiration_seconds),
                metadata: &metadata,
            })
            .await?;
        self.metrics.mark_challenge_created();
        info!(
            challenge = %challenge.challenge_id,
            challenger = challenger_id,
            challenged = challenged_id,
            game = %challenge.game_type,
            "challenge created"
        );

        let received = json!({
            "challengeId": challenge.challenge_id,
            "challenger": {"id": challenger.user_id, "username": challenger.username},
            "gameType": challenge.game_type,
            "createdAt": challenge.created_at.to_rfc3339(),
        });
        self.notifier
            .notify_user(challenged_id, EventKind::ChallengeReceived, received.clone())
            .await;
        let push_payload = json!({
            "type": "challenge:received",
            "challengeId": challenge.challenge_id,
            "challenger": challenger.username,
            "gameType": challenge.game_type,
        });
        self.push.send(challenged_id, &push_payload).await;
        Ok(challenge)
    }

    /// The challenged party accepts: PENDING -> NOTIFYING -> WAITING_RESPONSE
    /// with the first wake-up sent and the first timeout armed.
    pub async fn initiate_handshake(
        &self,
        challenge_id: &str,
        accepted_by: &str,
    ) -> Result<HandshakeProgress, CoreError> {
        self.locked(challenge_id, || async move {
            let challenge = self.storage.get_challenge(challenge_id).await?;
            if challenge.challenged_id != accepted_by {
                return Err(CoreError::Forbidden);
            }
            if challenge.state != ChallengeState::Pending {
                return Err(CoreError::Conflict(format!(
                    "challenge is {}",
                    challenge.state
                )));
            }
            if challenge.expires_at <= Utc::now() {
                return Err(CoreError::Conflict("challenge has expired".to_string()));
            }
            let challenge = self
                .storage
                .update_challenge_state(challenge_id, ChallengeState::Notifying)
                .await?;
            let notified = self.send_wake_up(&challenge).await;
            self.storage
                .update_challenge_state(challenge_id, ChallengeState::WaitingResponse)
                .await?;
            let attempt = self
                .storage
                .increment_attempt(challenge_id, self.settings.max_retry_attempts)
                .await?;
            self.scheduler
                .schedule_timeout(
                    challenge_id,
                    attempt,
                    self.settings.handshake_timeout_seconds,
                )
                .await?;
            info!(
                challenge = %challenge_id,
                attempt = attempt,
                notified = notified,
                "handshake initiated"
            );
            Ok(HandshakeProgress {
                state: ChallengeState::WaitingResponse,
                player_notified: notified,
                attempt,
            })
        })
        .await
    }

    /// The woken challenger answers. ACCEPT atomically creates the session
    /// and finalizes ACTIVE; DECLINE finalizes DECLINED.
    pub async fn handle_wake_up_response(
        &self,
        challenge_id: &str,
        user_id: &str,
        response: WakeUpResponse,
    ) -> Result<WakeUpOutcome, CoreError> {
        self.locked(challenge_id, || async move {
            let challenge = self.storage.get_challenge(challenge_id).await?;
            if challenge.challenger_id != user_id {
                return Err(CoreError::Forbidden);
            }
            if challenge.state != ChallengeState::WaitingResponse {
                return Err(CoreError::Conflict(format!(
                    "challenge is {}",
                    challenge.state
                )));
            }
            match response {
                WakeUpResponse::Accept => {
                    let session_id =
                        generate_id(&format!("session:{challenge_id}"));
                    let session = self
                        .storage
                        .activate_challenge(
                            challenge_id,
                            &session_id,
                            &json!({"game_type": challenge.game_type}),
                        )
                        .await?;
                    if let Err(err) = self
                        .scheduler
                        .cancel_timeout(challenge_id, challenge.wake_attempts)
                        .await
                    {
                        debug!(challenge = %challenge_id, "timeout cancel failed: {}", err);
                    }
                    let challenger = self.storage.load_user(&challenge.challenger_id).await?;
                    let challenged = self.storage.load_user(&challenge.challenged_id).await?;
                    let base = json!({
                        "sessionId": session.session_id,
                        "challengeId": challenge.challenge_id,
                        "gameType": challenge.game_type,
                    });
                    let mut for_challenger = base.clone();
                    for_challenger["opponent"] = json!({
                        "id": challenged.user_id,
                        "username": challenged.username,
                    });
                    let mut for_challenged = base;
                    for_challenged["opponent"] = json!({
                        "id": challenger.user_id,
                        "username": challenger.username,
                    });
                    self.notifier
                        .notify_user(
                            &challenge.challenger_id,
                            EventKind::SessionReady,
                            for_challenger,
                        )
                        .await;
                    self.notifier
                        .notify_user(
                            &challenge.challenged_id,
                            EventKind::SessionReady,
                            for_challenged,
                        )
                        .await;
                    self.metrics.mark_handshake_completed();
                    info!(
                        challenge = %challenge_id,
                        session = %session.session_id,
                        "handshake completed"
                    );
                    Ok(WakeUpOutcome::SessionCreated(session))
                }
                WakeUpResponse::Decline => {
                    let declined = self
                        .storage
                        .update_challenge_state(challenge_id, ChallengeState::Declined)
                        .await?;
                    if let Err(err) = self
                        .scheduler
                        .cancel_timeout(challenge_id, challenge.wake_attempts)
                        .await
                    {
                        debug!(challenge = %challenge_id, "timeout cancel failed: {}", err);
                    }
                    self.notifier
                        .notify_user(
                            &challenge.challenged_id,
                            EventKind::ChallengeDeclined,
                            json!({
                                "challengeId": challenge.challenge_id,
                                "declinedBy": user_id,
                                "now": Utc::now().to_rfc3339(),
                            }),
                        )
                        .await;
                    self.metrics.mark_handshake_declined();
                    info!(challenge = %challenge_id, "handshake declined by challenger");
                    Ok(WakeUpOutcome::Declined(declined))
                }
            }
        })
        .await
    }

    /// Scheduler handler for an armed wake-up timeout. Quiet when another
    /// path already won the race; otherwise either re-sends the wake-up or
    /// finalizes TIMEOUT once the attempt limit is reached.
    pub async fn handle_timeout(&self, challenge_id: &str, attempt: i32) -> Result<(), CoreError> {
        self.locked(challenge_id, || async move {
            let challenge = match self.storage.get_challenge(challenge_id).await {
                Ok(challenge) => challenge,
                Err(StorageError::Missing) => {
                    debug!(challenge = %challenge_id, "timeout for pruned challenge");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            if challenge.state != ChallengeState::WaitingResponse {
                debug!(
                    challenge = %challenge_id,
                    state = %challenge.state,
                    "timeout superseded by another transition"
                );
                return Ok(());
            }
            if challenge.wake_attempts != attempt {
                debug!(
                    challenge = %challenge_id,
                    counter = challenge.wake_attempts,
                    attempt = attempt,
                    "stale timeout delivery ignored"
                );
                return Ok(());
            }
            if attempt >= self.settings.max_retry_attempts {
                self.storage
                    .update_challenge_state(challenge_id, ChallengeState::Timeout)
                    .await?;
                self.notifier
                    .notify_user(
                        &challenge.challenged_id,
                        EventKind::ChallengeTimeout,
                        json!({
                            "challengeId": challenge.challenge_id,
                            "now": Utc::now().to_rfc3339(),
                        }),
                    )
                    .await;
                self.metrics.mark_handshake_timed_out();
                info!(
                    challenge = %challenge_id,
                    attempts = attempt,
                    "handshake timed out"
                );
                return Ok(());
            }
            self.send_wake_up(&challenge).await;
            let next_attempt = match self
                .storage
                .increment_attempt(challenge_id, self.settings.max_retry_attempts)
                .await
            {
                Ok(next) => next,
                Err(StorageError::Conflict) => {
                    debug!(challenge = %challenge_id, "attempt counter already at its limit");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            self.scheduler
                .schedule_timeout(
                    challenge_id,
                    next_attempt,
                    self.settings.handshake_timeout_seconds,
                )
                .await?;
            info!(
                challenge = %challenge_id,
                attempt = next_attempt,
                "wake-up re-sent"
            );
            Ok(())
        })
        .await
    }

    /// The challenged party turns the offer down before ever accepting it.
    pub async fn decline_by_challenged(
        &self,
        challenge_id: &str,
        user_id: &str,
    ) -> Result<ChallengeRecord, CoreError> {
        self.locked(challenge_id, || async move {
            let challenge = self.storage.get_challenge(challenge_id).await?;
            if challenge.challenged_id != user_id {
                return Err(CoreError::Forbidden);
            }
            if challenge.state != ChallengeState::Pending {
                return Err(CoreError::Conflict(format!(
                    "challenge is {}",
                    challenge.state
                )));
            }
            let declined = self
                .storage
                .update_challenge_state(challenge_id, ChallengeState::Declined)
                .await?;
            self.notifier
                .notify_user(
                    &challenge.challenger_id,
                    EventKind::ChallengeDeclined,
                    json!({
                        "challengeId": challenge.challenge_id,
                        "declinedBy": user_id,
                        "now": Utc::now().to_rfc3339(),
                    }),
                )
                .await;
            self.metrics.mark_handshake_declined();
            info!(challenge = %challenge_id, "challenge declined");
            Ok(declined)
        })
        .await
    }

    /// Ends a session at most once; only a participant may do so.
    pub async fn end_session(
        &self,
        session_id: &str,
        user_id: &str,
        terminal: SessionState,
        metadata: Value,
    ) -> Result<SessionRecord, CoreError> {
        if !terminal.is_terminal() {
            return Err(CoreError::Validation(
                "state must be COMPLETED or ABANDONED".to_string(),
            ));
        }
        let session = self.storage.get_session(session_id).await?;
        if session.player_a != user_id && session.player_b != user_id {
            return Err(CoreError::Forbidden);
        }
        let ended = self
            .storage
            .end_session(session_id, terminal, &metadata)
            .await?;
        info!(session = %session_id, state = terminal.as_str(), "session ended");
        Ok(ended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::bus::{Notifier, NotifyFuture};
    use crate::app::scheduler::JobQueue;
    use crate::config::PushConfig;
    use rally_storage::{NewUser, presence, shared};
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Delivery {
        target: String,
        event: String,
        payload: Value,
    }

    #[derive(Default)]
    struct RecordingNotifier {
        deliveries: Mutex<Vec<Delivery>>,
    }

    impl RecordingNotifier {
        async fn events_for(&self, target: &str) -> Vec<Delivery> {
            self.deliveries
                .lock()
                .await
                .iter()
                .filter(|delivery| delivery.target == target)
                .cloned()
                .collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify_user<'a>(
            &'a self,
            user_id: &'a str,
            event: EventKind,
            payload: Value,
        ) -> NotifyFuture<'a> {
            Box::pin(async move {
                self.deliveries.lock().await.push(Delivery {
                    target: user_id.to_string(),
                    event: event.as_str().to_string(),
                    payload,
                });
            })
        }

        fn notify_session<'a>(
            &'a self,
            session_id: &'a str,
            event: EventKind,
            payload: Value,
        ) -> NotifyFuture<'a> {
            Box::pin(async move {
                self.deliveries.lock().await.push(Delivery {
                    target: format!("session:{session_id}"),
                    event: event.as_str().to_string(),
                    payload,
                });
            })
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        notifier: Arc<RecordingNotifier>,
        storage: Arc<rally_storage::Storage>,
        alice: String,
        bob: String,
    }

    async fn harness() -> Option<Harness> {
        let dsn = match std::env::var("RALLY_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping orchestrator test: RALLY_TEST_PG_DSN not set");
                return None;
            }
        };
        let redis_url = match std::env::var("RALLY_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping orchestrator test: RALLY_TEST_REDIS_URL not set");
                return None;
            }
        };
        let storage = Arc::new(rally_storage::connect(&dsn).await.expect("postgres"));
        storage.migrate().await.expect("migrations");
        let shared = shared::connect(&redis_url).await.expect("redis");
        let presence = presence::PresenceRegistry::new(shared.clone(), 60);
        let metrics = Arc::new(Metrics::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = Arc::new(JobQueue::new(Arc::clone(&storage)));
        let push = Arc::new(PushChannel::new(
            &PushConfig {
                endpoint: None,
                api_key: None,
                timeout_ms: 1000,
            },
            Arc::clone(&storage),
            Arc::clone(&metrics),
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&storage),
            shared,
            presence,
            notifier.clone(),
            scheduler,
            push,
            metrics,
            HandshakeSettings {
                challenge_expiration_seconds: 3600,
                handshake_timeout_seconds: 30,
                max_retry_attempts: 3,
                lock_ttl_seconds: 10,
            },
        );

        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let alice = format!("user-a-{suffix}");
        let bob = format!("user-b-{suffix}");
        for (user_id, name) in [(&alice, "alice"), (&bob, "bob")] {
            storage
                .create_user(&NewUser {
                    user_id: user_id.clone(),
                    username: format!("{name}{suffix}"),
                    email: format!("{name}{suffix}@example.org"),
                    password_hash: "blake3$00$00".to_string(),
                })
                .await
                .expect("user");
        }
        Some(Harness {
            orchestrator,
            notifier,
            storage,
            alice,
            bob,
        })
    }

    #[tokio::test]
    async fn accept_path_creates_exactly_one_session() {
        let Some(h) = harness().await else {
            return;
        };
        // self-challenge is rejected before any row is written
        let selfie = h
            .orchestrator
            .create_challenge(&h.alice, &h.alice, "Chess", json!({}))
            .await;
        assert!(matches!(selfie, Err(CoreError::Validation(_))));

        let challenge = h
            .orchestrator
            .create_challenge(&h.alice, &h.bob, "Chess", json!({}))
            .await
            .expect("challenge");
        assert_eq!(challenge.state, ChallengeState::Pending);
        let received = h.notifier.events_for(&h.bob).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].event, "challenge:received");

        // the challenger cannot accept their own offer
        let wrong = h
            .orchestrator
            .initiate_handshake(&challenge.challenge_id, &h.alice)
            .await;
        assert!(matches!(wrong, Err(CoreError::Forbidden)));

        let progress = h
            .orchestrator
            .initiate_handshake(&challenge.challenge_id, &h.bob)
            .await
            .expect("handshake");
        assert_eq!(progress.state, ChallengeState::WaitingResponse);
        assert_eq!(progress.attempt, 1);

        // accepting twice conflicts and leaves the state untouched
        let again = h
            .orchestrator
            .initiate_handshake(&challenge.challenge_id, &h.bob)
            .await;
        assert!(matches!(again, Err(CoreError::Conflict(_))));
        let reread = h
            .storage
            .get_challenge(&challenge.challenge_id)
            .await
            .expect("challenge");
        assert_eq!(reread.state, ChallengeState::WaitingResponse);
        assert_eq!(reread.wake_attempts, 1);

        // only the challenger may answer the wake-up
        let wrong = h
            .orchestrator
            .handle_wake_up_response(&challenge.challenge_id, &h.bob, WakeUpResponse::Accept)
            .await;
        assert!(matches!(wrong, Err(CoreError::Forbidden)));

        let outcome = h
            .orchestrator
            .handle_wake_up_response(&challenge.challenge_id, &h.alice, WakeUpResponse::Accept)
            .await
            .expect("response");
        let WakeUpOutcome::SessionCreated(session) = outcome else {
            panic!("expected a session");
        };
        assert_eq!(session.player_a, h.alice);
        assert_eq!(session.player_b, h.bob);
        assert_eq!(session.state, SessionState::Active);

        let reread = h
            .storage
            .get_challenge(&challenge.challenge_id)
            .await
            .expect("challenge");
        assert_eq!(reread.state, ChallengeState::Active);
        let stored = h
            .storage
            .get_session_by_challenge(&challenge.challenge_id)
            .await
            .expect("session");
        assert_eq!(stored.session_id, session.session_id);

        for user in [&h.alice, &h.bob] {
            let ready: Vec<_> = h
                .notifier
                .events_for(user)
                .await
                .into_iter()
                .filter(|d| d.event == "session:ready")
                .collect();
            assert_eq!(ready.len(), 1, "session:ready for {user}");
            assert_eq!(ready[0].payload["sessionId"], json!(session.session_id));
        }

        // a second accept after the terminal transition conflicts
        let late = h
            .orchestrator
            .handle_wake_up_response(&challenge.challenge_id, &h.alice, WakeUpResponse::Accept)
            .await;
        assert!(matches!(late, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn decline_paths_reach_declined_without_session() {
        let Some(h) = harness().await else {
            return;
        };
        // wake-up DECLINE after accept
        let challenge = h
            .orchestrator
            .create_challenge(&h.alice, &h.bob, "Go", json!({}))
            .await
            .expect("challenge");
        h.orchestrator
            .initiate_handshake(&challenge.challenge_id, &h.bob)
            .await
            .expect("handshake");
        let outcome = h
            .orchestrator
            .handle_wake_up_response(&challenge.challenge_id, &h.alice, WakeUpResponse::Decline)
            .await
            .expect("decline");
        let WakeUpOutcome::Declined(declined) = outcome else {
            panic!("expected decline");
        };
        assert_eq!(declined.state, ChallengeState::Declined);
        assert!(
            h.storage
                .get_session_by_challenge(&challenge.challenge_id)
                .await
                .is_err()
        );
        let to_bob: Vec<_> = h
            .notifier
            .events_for(&h.bob)
            .await
            .into_iter()
            .filter(|d| d.event == "challenge:declined")
            .collect();
        assert_eq!(to_bob.len(), 1);
        // the decline notification goes only to the challenged party
        assert!(
            h.notifier
                .events_for(&h.alice)
                .await
                .iter()
                .all(|d| d.event != "challenge:declined")
        );

        // decline straight from PENDING, by the challenged party
        let challenge = h
            .orchestrator
            .create_challenge(&h.alice, &h.bob, "Go", json!({}))
            .await
            .expect("challenge");
        let wrong = h
            .orchestrator
            .decline_by_challenged(&challenge.challenge_id, &h.alice)
            .await;
        assert!(matches!(wrong, Err(CoreError::Forbidden)));
        let declined = h
            .orchestrator
            .decline_by_challenged(&challenge.challenge_id, &h.bob)
            .await
            .expect("decline");
        assert_eq!(declined.state, ChallengeState::Declined);
        let to_alice: Vec<_> = h
            .notifier
            .events_for(&h.alice)
            .await
            .into_iter()
            .filter(|d| d.event == "challenge:declined")
            .collect();
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_alice[0].payload["declinedBy"], json!(h.bob));
    }

    #[tokio::test]
    async fn timeout_exhaustion_finalizes_after_max_attempts() {
        let Some(h) = harness().await else {
            return;
        };
        let challenge = h
            .orchestrator
            .create_challenge(&h.alice, &h.bob, "Shogi", json!({}))
            .await
            .expect("challenge");
        h.orchestrator
            .initiate_handshake(&challenge.challenge_id, &h.bob)
            .await
            .expect("handshake");

        // attempt 1 fires: re-send, counter moves to 2
        h.orchestrator
            .handle_timeout(&challenge.challenge_id, 1)
            .await
            .expect("timeout 1");
        let reread = h
            .storage
            .get_challenge(&challenge.challenge_id)
            .await
            .expect("challenge");
        assert_eq!(reread.state, ChallengeState::WaitingResponse);
        assert_eq!(reread.wake_attempts, 2);

        // duplicate delivery of the same job is a no-op
        h.orchestrator
            .handle_timeout(&challenge.challenge_id, 1)
            .await
            .expect("duplicate timeout");
        let reread = h
            .storage
            .get_challenge(&challenge.challenge_id)
            .await
            .expect("challenge");
        assert_eq!(reread.wake_attempts, 2);

        h.orchestrator
            .handle_timeout(&challenge.challenge_id, 2)
            .await
            .expect("timeout 2");
        h.orchestrator
            .handle_timeout(&challenge.challenge_id, 3)
            .await
            .expect("timeout 3");
        let reread = h
            .storage
            .get_challenge(&challenge.challenge_id)
            .await
            .expect("challenge");
        assert_eq!(reread.state, ChallengeState::Timeout);
        assert_eq!(reread.wake_attempts, 3);
        let timeouts: Vec<_> = h
            .notifier
            .events_for(&h.bob)
            .await
            .into_iter()
            .filter(|d| d.event == "challenge:timeout")
            .collect();
        assert_eq!(timeouts.len(), 1);

        // a late timeout against the terminal row stays quiet
        h.orchestrator
            .handle_timeout(&challenge.challenge_id, 3)
            .await
            .expect("late timeout");
    }
}
