mod bus;
mod hub;
mod orchestrator;
mod push;
mod scheduler;

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::security::limiter::{RateLimiter, RateScope};
use crate::util::{generate_id, hash_password, mint_token, verify_password};
use bus::{EventBus, Notifier};
use chrono::{Duration, Utc};
use orchestrator::{CoreError, HandshakeSettings, Orchestrator, WakeUpOutcome};
use pingora::apps::{HttpServerApp, HttpServerOptions, ReusedHttpStream};
use pingora::http::ResponseHeader;
use pingora::protocols::http::ServerSession;
use pingora::protocols::http::v2::server::H2Options;
use pingora::server::ShutdownWatch;
use push::PushChannel;
use rally_proto::WakeUpResponse;
use rally_storage::{
    AuthTokenRecord, ChallengeRecord, NewUser, PresenceRegistry, PresenceSnapshot, SessionRecord,
    SessionState, SharedStore, Storage, StorageError, UserRecord,
};
use scheduler::JobQueue;
use serde::Deserialize;
use serde_json::{Value, json};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tracing::{error, info};

const MAX_BODY_LEN: usize = 64 * 1024;
const MAX_USERNAME_LEN: usize = 64;

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Codec,
    Invalid,
    Io,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Codec => write!(f, "codec failure"),
            Self::Invalid => write!(f, "invalid request"),
            Self::Io => write!(f, "io failure"),
        }
    }
}

impl Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(_: StorageError) -> Self {
        ServerError::Storage
    }
}

impl From<rally_proto::CodecError> for ServerError {
    fn from(_: rally_proto::CodecError) -> Self {
        ServerError::Codec
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(Option<String>),
    Forbidden,
    NotFound,
    BadRequest(String),
    Unprocessable(String),
    Conflict(String),
    RateLimited(Option<StdDuration>),
    Unavailable(String),
    Internal,
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::BadRequest(_) => 400,
            Self::Unprocessable(_) => 422,
            Self::Conflict(_) => 409,
            Self::RateLimited(_) => 429,
            Self::Unavailable(_) => 503,
            Self::Internal => 500,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "NotFound",
            Self::BadRequest(_) => "BadRequest",
            Self::Unprocessable(_) => "Validation",
            Self::Conflict(_) => "Conflict",
            Self::RateLimited(_) => "RateLimited",
            Self::Unavailable(_) => "Unavailable",
            Self::Internal => "Internal",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Unauthorized(reason) => reason
                .clone()
                .unwrap_or_else(|| "authorization required".to_string()),
            Self::Forbidden => "access denied".to_string(),
            Self::NotFound => "resource not found".to_string(),
            Self::BadRequest(reason) => reason.clone(),
            Self::Unprocessable(reason) => reason.clone(),
            Self::Conflict(reason) => reason.clone(),
            Self::RateLimited(_) => "too many requests".to_string(),
            Self::Unavailable(reason) => reason.clone(),
            Self::Internal => "internal server error".to_string(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unauthorized => ApiError::Unauthorized(None),
            CoreError::Forbidden => ApiError::Forbidden,
            CoreError::NotFound => ApiError::NotFound,
            CoreError::Validation(reason) => ApiError::Unprocessable(reason),
            CoreError::Conflict(reason) => ApiError::Conflict(reason),
            CoreError::RateLimited => ApiError::RateLimited(None),
            CoreError::Transient(reason) => ApiError::Unavailable(reason),
            CoreError::Internal => ApiError::Internal,
        }
    }
}

fn user_snapshot(user: &UserRecord) -> Value {
    json!({
        "id": user.user_id,
        "username": user.username,
        "email": user.email,
        "isActive": user.is_active,
        "createdAt": user.created_at.to_rfc3339(),
    })
}

fn challenge_snapshot(challenge: &ChallengeRecord) -> Value {
    json!({
        "id": challenge.challenge_id,
        "challengerId": challenge.challenger_id,
        "challengedId": challenge.challenged_id,
        "gameType": challenge.game_type,
        "state": challenge.state.as_str(),
        "expiresAt": challenge.expires_at.to_rfc3339(),
        "wakeAttempts": challenge.wake_attempts,
        "lastAttemptAt": challenge.last_attempt_at.map(|at| at.to_rfc3339()),
        "metadata": challenge.metadata,
        "createdAt": challenge.created_at.to_rfc3339(),
        "updatedAt": challenge.updated_at.to_rfc3339(),
    })
}

fn session_snapshot(session: &SessionRecord) -> Value {
    json!({
        "id": session.session_id,
        "challengeId": session.challenge_id,
        "players": [session.player_a, session.player_b],
        "state": session.state.as_str(),
        "startedAt": session.started_at.to_rfc3339(),
        "endedAt": session.ended_at.map(|at| at.to_rfc3339()),
        "metadata": session.metadata,
    })
}

fn presence_payload(user_id: &str, snapshot: &PresenceSnapshot) -> Value {
    json!({
        "userId": user_id,
        "isOnline": snapshot.is_online,
        "lastSeen": snapshot.last_seen.map(|at| at.to_rfc3339()),
        "connectionCount": snapshot.connection_count,
    })
}

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeCreateRequest {
    challenged_id: String,
    game_type: String,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Deserialize)]
struct RespondRequest {
    response: String,
}

#[derive(Deserialize)]
struct DeviceRegisterRequest {
    token: String,
    #[serde(default)]
    platform: Option<String>,
}

#[derive(Deserialize)]
struct DeviceUnregisterRequest {
    token: String,
}

#[derive(Deserialize)]
struct SessionEndRequest {
    state: String,
    #[serde(default)]
    metadata: Option<Value>,
}

/// One instance of every subsystem, constructed at process start and passed
/// around explicitly.
pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub shared: SharedStore,
    pub presence: PresenceRegistry,
    pub metrics: Arc<Metrics>,
    pub rate_limits: Arc<RateLimiter>,
    pub bus: Arc<EventBus>,
    pub push: Arc<PushChannel>,
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

pub struct RallyApp {
    state: Arc<AppState>,
}

impl RallyApp {
    pub fn new(state: Arc<AppState>) -> Self {
        RallyApp { state }
    }

    /// Wires every subsystem together and spawns the background loops.
    pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
        let storage = Arc::new(rally_storage::connect(&config.postgres_dsn).await?);
        storage.migrate().await?;
        let shared = rally_storage::shared::connect(&config.redis_url).await?;
        let presence = PresenceRegistry::new(shared.clone(), config.presence_ttl_seconds);
        let metrics = Arc::new(Metrics::new());
        let rate_limits = Arc::new(RateLimiter::new(&config.rate_limit));
        let bus = Arc::new(EventBus::new(shared.clone(), Arc::clone(&metrics)));
        let push = Arc::new(PushChannel::new(
            &config.push,
            Arc::clone(&storage),
            Arc::clone(&metrics),
        ));
        let jobs = Arc::new(JobQueue::new(Arc::clone(&storage)));
        jobs.ensure_maintenance(config.sweep_interval_seconds).await?;
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&storage),
            shared.clone(),
            presence.clone(),
            Arc::clone(&bus) as Arc<dyn Notifier>,
            Arc::clone(&jobs) as Arc<dyn scheduler::TimeoutScheduler>,
            Arc::clone(&push),
            Arc::clone(&metrics),
            HandshakeSettings {
                challenge_expiration_seconds: config.challenge_expiration_seconds,
                handshake_timeout_seconds: config.handshake_timeout_seconds,
                max_retry_attempts: config.max_retry_attempts,
                lock_ttl_seconds: config.lock_ttl_seconds,
            },
        ));
        let state = Arc::new(AppState {
            config,
            storage,
            shared,
            presence,
            metrics,
            rate_limits,
            bus: Arc::clone(&bus),
            push,
            orchestrator,
            started_at: Instant::now(),
        });
        bus.spawn_subscriber();
        scheduler::spawn_dispatcher(Arc::clone(&state));
        info!("application state initialized");
        Ok(state)
    }
}

impl HttpServerApp for RallyApp {
    fn process_new_http<'life0, 'life1, 'async_trait>(
        self: &'life0 Arc<Self>,
        session: ServerSession,
        shutdown: &'life1 ShutdownWatch,
    ) -> Pin<Box<dyn Future<Output = Option<ReusedHttpStream>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move { self.handle_session(session, shutdown).await })
    }

    fn h2_options(&self) -> Option<H2Options> {
        None
    }

    fn server_options(&self) -> Option<&HttpServerOptions> {
        None
    }
}

impl RallyApp {
    async fn handle_session(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<ReusedHttpStream> {
        match session.read_request().await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                error!("failed to read request: {}", err);
                return None;
            }
        }
        let full_path = session.req_header().uri.path().to_string();
        let method = session.req_header().method.to_string();
        self.state.metrics.mark_http();

        let prefix = self.state.config.api_prefix.as_str();
        let path = if !prefix.is_empty()
            && full_path.starts_with(prefix)
            && full_path[prefix.len()..].starts_with('/')
        {
            full_path[prefix.len()..].to_string()
        } else {
            full_path
        };

        if method == "OPTIONS" {
            self.respond_preflight(session).await;
            return None;
        }
        if path == "/connect" && method == "POST" {
            return self.process_connect(session, shutdown).await;
        }

        let scope = if path == "/auth/login" || path == "/auth/register" {
            RateScope::Auth
        } else {
            RateScope::Http
        };
        if let Some(retry_after) = self.check_rate_limit(&session, scope).await {
            self.state.metrics.mark_rate_limited();
            if let Err(err) = self
                .respond_api_error(&mut session, ApiError::RateLimited(Some(retry_after)))
                .await
            {
                error!("rate limit response failed: {}", err);
            }
            return None;
        }

        if let Err(api_error) = self.route(&mut session, &method, &path).await {
            if let Err(err) = self.respond_api_error(&mut session, api_error).await {
                error!("error response failed: {}", err);
            }
        }
        None
    }

    async fn route(
        self: &Arc<Self>,
        session: &mut ServerSession,
        method: &str,
        path: &str,
    ) -> Result<(), ApiError> {
        match (method, path) {
            ("GET", "/health") => return self.handle_health(session).await,
            ("GET", "/readyz") => return self.handle_readyz(session).await,
            ("GET", "/metrics") => return self.handle_metrics(session).await,
            ("POST", "/auth/register") => return self.handle_register(session).await,
            ("POST", "/auth/login") => return self.handle_login(session).await,
            ("GET", "/auth/profile") => return self.handle_profile(session).await,
            ("POST", "/challenges") => return self.handle_challenge_create(session).await,
            ("GET", "/challenges/me/pending") => {
                return self.handle_pending_challenges(session).await;
            }
            ("GET", "/users") => return self.handle_users(session).await,
            ("POST", "/presence/register-device") => {
                return self.handle_register_device(session).await;
            }
            ("POST", "/presence/unregister-device") => {
                return self.handle_unregister_device(session).await;
            }
            ("POST", "/presence/heartbeat") => return self.handle_heartbeat(session).await,
            ("GET", "/sessions/me/active") => return self.handle_active_sessions(session).await,
            _ => {}
        }
        if let Some(rest) = path.strip_prefix("/challenges/") {
            let mut parts = rest.splitn(2, '/');
            let challenge_id = parts.next().unwrap_or_default();
            let action = parts.next();
            if challenge_id.is_empty() {
                return Err(ApiError::NotFound);
            }
            return match (method, action) {
                ("GET", None) => self.handle_challenge_get(session, challenge_id).await,
                ("POST", Some("accept")) => {
                    self.handle_challenge_accept(session, challenge_id).await
                }
                ("POST", Some("decline")) => {
                    self.handle_challenge_decline(session, challenge_id).await
                }
                ("POST", Some("respond")) => {
                    self.handle_challenge_respond(session, challenge_id).await
                }
                _ => Err(ApiError::NotFound),
            };
        }
        if let Some(user_id) = path.strip_prefix("/presence/") {
            if method == "GET" && !user_id.is_empty() && !user_id.contains('/') {
                return self.handle_presence_get(session, user_id).await;
            }
            return Err(ApiError::NotFound);
        }
        if let Some(rest) = path.strip_prefix("/sessions/") {
            let mut parts = rest.splitn(2, '/');
            let session_id = parts.next().unwrap_or_default();
            let action = parts.next();
            if session_id.is_empty() {
                return Err(ApiError::NotFound);
            }
            return match (method, action) {
                ("GET", None) => self.handle_session_get(session, session_id).await,
                ("POST", Some("end")) => self.handle_session_end(session, session_id).await,
                _ => Err(ApiError::NotFound),
            };
        }
        Err(ApiError::NotFound)
    }

    async fn handle_health(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let payload = json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": self.state.started_at.elapsed().as_secs(),
        });
        self.respond_success(session, 200, payload).await
    }

    async fn handle_readyz(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let storage_ready = self.state.storage.readiness().await.is_ok();
        let shared_ready = self.state.shared.ping().await.is_ok();
        if storage_ready && shared_ready {
            self.respond_success(session, 200, json!({"status": "ready"}))
                .await
        } else {
            Err(ApiError::Unavailable("dependencies degraded".to_string()))
        }
    }

    async fn handle_metrics(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        if !self.authorize_admin(session) {
            return Err(ApiError::Unauthorized(None));
        }
        let payload = self.state.metrics.encode_prometheus();
        self.respond_raw(session, 200, "text/plain; version=0.0.4", payload.into_bytes())
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_register(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<RegisterRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        let username = request.username.trim().to_string();
        let email = request.email.trim().to_lowercase();
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return Err(ApiError::BadRequest("username is required".to_string()));
        }
        if !email.contains('@') {
            return Err(ApiError::BadRequest("email is invalid".to_string()));
        }
        if request.password.len() < self.state.config.min_password_len {
            return Err(ApiError::BadRequest(format!(
                "password must be at least {} characters",
                self.state.config.min_password_len
            )));
        }
        let user = self
            .state
            .storage
            .create_user(&NewUser {
                user_id: generate_id(&format!("user:{username}")),
                username,
                email,
                password_hash: hash_password(&request.password),
            })
            .await
            .map_err(|err| match err {
                StorageError::Conflict => {
                    ApiError::Conflict("username or email already registered".to_string())
                }
                _ => ApiError::Internal,
            })?;
        let token = self.issue_token(&user.user_id).await?;
        info!(user = %user.user_id, "user registered");
        self.respond_success(
            session,
            201,
            json!({"user": user_snapshot(&user), "token": token}),
        )
        .await
    }

    async fn handle_login(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<LoginRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        let email = request.email.trim().to_lowercase();
        let invalid = || ApiError::Unauthorized(Some("invalid credentials".to_string()));
        let user = self
            .state
            .storage
            .load_user_by_email(&email)
            .await
            .map_err(|err| match err {
                StorageError::Missing => invalid(),
                _ => ApiError::Internal,
            })?;
        if !user.is_active || !verify_password(&request.password, &user.password_hash) {
            return Err(invalid());
        }
        let token = self.issue_token(&user.user_id).await?;
        self.respond_success(
            session,
            200,
            json!({"user": user_snapshot(&user), "token": token}),
        )
        .await
    }

    async fn handle_profile(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user = self.authenticate(session).await?;
        self.respond_success(session, 200, json!({"user": user_snapshot(&user)}))
            .await
    }

    async fn handle_challenge_create(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user = self.authenticate(session).await?;
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<ChallengeCreateRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        if request.challenged_id.trim().is_empty() {
            return Err(ApiError::BadRequest("challengedId is required".to_string()));
        }
        let challenge = self
            .state
            .orchestrator
            .create_challenge(
                &user.user_id,
                request.challenged_id.trim(),
                &request.game_type,
                request.metadata.unwrap_or_else(|| json!({})),
            )
            .await?;
        self.respond_success(
            session,
            201,
            json!({"challenge": challenge_snapshot(&challenge)}),
        )
        .await
    }

    async fn handle_pending_challenges(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user = self.authenticate(session).await?;
        let pending = self
            .state
            .storage
            .list_pending_for_user(&user.user_id, Utc::now())
            .await
            .map_err(|_| ApiError::Internal)?;
        let challenges: Vec<Value> = pending.iter().map(challenge_snapshot).collect();
        self.respond_success(
            session,
            200,
            json!({"challenges": challenges, "count": challenges.len()}),
        )
        .await
    }

    async fn handle_challenge_get(
        &self,
        session: &mut ServerSession,
        challenge_id: &str,
    ) -> Result<(), ApiError> {
        self.authenticate(session).await?;
        let challenge = self
            .state
            .storage
            .get_challenge(challenge_id)
            .await
            .map_err(|err| match err {
                StorageError::Missing => ApiError::NotFound,
                _ => ApiError::Internal,
            })?;
        self.respond_success(
            session,
            200,
            json!({"challenge": challenge_snapshot(&challenge)}),
        )
        .await
    }

    async fn handle_challenge_accept(
        &self,
        session: &mut ServerSession,
        challenge_id: &str,
    ) -> Result<(), ApiError> {
        let user = self.authenticate(session).await?;
        let progress = self
            .state
            .orchestrator
            .initiate_handshake(challenge_id, &user.user_id)
            .await?;
        self.respond_success(
            session,
            200,
            json!({
                "state": progress.state.as_str(),
                "playerNotified": progress.player_notified,
                "attempt": progress.attempt,
            }),
        )
        .await
    }

    async fn handle_challenge_decline(
        &self,
        session: &mut ServerSession,
        challenge_id: &str,
    ) -> Result<(), ApiError> {
        let user = self.authenticate(session).await?;
        let challenge = self
            .state
            .orchestrator
            .decline_by_challenged(challenge_id, &user.user_id)
            .await?;
        self.respond_success(
            session,
            200,
            json!({"challengeId": challenge.challenge_id, "state": challenge.state.as_str()}),
        )
        .await
    }

    async fn handle_challenge_respond(
        &self,
        session: &mut ServerSession,
        challenge_id: &str,
    ) -> Result<(), ApiError> {
        let user = self.authenticate(session).await?;
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<RespondRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        let response = WakeUpResponse::from_str(&request.response)
            .map_err(|_| ApiError::BadRequest("response must be ACCEPT or DECLINE".to_string()))?;
        let outcome = self
            .state
            .orchestrator
            .handle_wake_up_response(challenge_id, &user.user_id, response)
            .await?;
        let payload = match outcome {
            WakeUpOutcome::SessionCreated(created) => json!({
                "action": "SESSION_CREATED",
                "sessionId": created.session_id,
            }),
            WakeUpOutcome::Declined(_) => json!({"action": "DECLINED"}),
        };
        self.respond_success(session, 200, payload).await
    }

    async fn handle_register_device(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user = self.authenticate(session).await?;
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<DeviceRegisterRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        if request.token.trim().is_empty() {
            return Err(ApiError::BadRequest("token is required".to_string()));
        }
        let registered = self
            .state
            .storage
            .add_push_token(
                &user.user_id,
                request.token.trim(),
                request.platform.as_deref(),
            )
            .await
            .map_err(|_| ApiError::Internal)?;
        self.respond_success(session, 200, json!({"registered": registered}))
            .await
    }

    async fn handle_unregister_device(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user = self.authenticate(session).await?;
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<DeviceUnregisterRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        let removed = self
            .state
            .storage
            .remove_push_token(&user.user_id, request.token.trim())
            .await
            .map_err(|_| ApiError::Internal)?;
        self.respond_success(session, 200, json!({"removed": removed}))
            .await
    }

    async fn handle_heartbeat(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user = self.authenticate(session).await?;
        if let Err(err) = self.state.presence.heartbeat(&user.user_id).await {
            tracing::warn!(user = %user.user_id, "heartbeat refresh failed: {}", err);
        }
        self.respond_success(session, 200, json!({"now": Utc::now().to_rfc3339()}))
            .await
    }

    async fn handle_presence_get(
        &self,
        session: &mut ServerSession,
        user_id: &str,
    ) -> Result<(), ApiError> {
        self.authenticate(session).await?;
        let snapshot = self
            .state
            .presence
            .snapshot(user_id)
            .await
            .map_err(|_| ApiError::Internal)?;
        self.respond_success(
            session,
            200,
            json!({"presence": presence_payload(user_id, &snapshot)}),
        )
        .await
    }

    async fn handle_active_sessions(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user = self.authenticate(session).await?;
        let sessions = self
            .state
            .storage
            .list_active_sessions_for_user(&user.user_id)
            .await
            .map_err(|_| ApiError::Internal)?;
        let sessions: Vec<Value> = sessions.iter().map(session_snapshot).collect();
        self.respond_success(
            session,
            200,
            json!({"sessions": sessions, "count": sessions.len()}),
        )
        .await
    }

    async fn handle_session_get(
        &self,
        session: &mut ServerSession,
        session_id: &str,
    ) -> Result<(), ApiError> {
        self.authenticate(session).await?;
        let record = self
            .state
            .storage
            .get_session(session_id)
            .await
            .map_err(|err| match err {
                StorageError::Missing => ApiError::NotFound,
                _ => ApiError::Internal,
            })?;
        self.respond_success(session, 200, json!({"session": session_snapshot(&record)}))
            .await
    }

    async fn handle_session_end(
        &self,
        session: &mut ServerSession,
        session_id: &str,
    ) -> Result<(), ApiError> {
        let user = self.authenticate(session).await?;
        let body = Self::read_body(session).await?;
        let request = serde_json::from_slice::<SessionEndRequest>(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))?;
        let terminal = SessionState::from_str(&request.state)
            .ok()
            .filter(SessionState::is_terminal)
            .ok_or_else(|| {
                ApiError::BadRequest("state must be COMPLETED or ABANDONED".to_string())
            })?;
        let ended = self
            .state
            .orchestrator
            .end_session(
                session_id,
                &user.user_id,
                terminal,
                request.metadata.unwrap_or_else(|| json!({})),
            )
            .await?;
        self.respond_success(session, 200, json!({"session": session_snapshot(&ended)}))
            .await
    }

    async fn handle_users(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        self.authenticate(session).await?;
        let users = self
            .state
            .storage
            .list_users()
            .await
            .map_err(|_| ApiError::Internal)?;
        let mut entries = Vec::with_capacity(users.len());
        for user in &users {
            let snapshot = self
                .state
                .presence
                .snapshot(&user.user_id)
                .await
                .unwrap_or_else(|_| PresenceSnapshot {
                    is_online: false,
                    last_seen: None,
                    connection_count: 0,
                });
            let mut entry = user_snapshot(user);
            entry["presence"] = presence_payload(&user.user_id, &snapshot);
            entries.push(entry);
        }
        self.respond_success(
            session,
            200,
            json!({"users": entries, "count": entries.len()}),
        )
        .await
    }

    async fn issue_token(&self, user_id: &str) -> Result<String, ApiError> {
        let token = mint_token(&self.state.config.token_secret, user_id);
        self.state
            .storage
            .create_auth_token(&AuthTokenRecord {
                token: token.clone(),
                user_id: user_id.to_string(),
                created_at: Utc::now(),
                ttl_seconds: self.state.config.token_ttl_seconds,
            })
            .await
            .map_err(|_| ApiError::Internal)?;
        Ok(token)
    }

    async fn authenticate(&self, session: &ServerSession) -> Result<UserRecord, ApiError> {
        let header = session
            .req_header()
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ApiError::Unauthorized(Some("missing Authorization header".to_string()))
            })?;
        let token = header
            .trim()
            .strip_prefix("Bearer ")
            .unwrap_or(header.trim());
        if token.is_empty() {
            return Err(ApiError::Unauthorized(Some("empty token provided".to_string())));
        }
        self.authenticate_token(token).await
    }

    pub(super) async fn authenticate_token(&self, token: &str) -> Result<UserRecord, ApiError> {
        let record = self
            .state
            .storage
            .load_auth_token(token)
            .await
            .map_err(|err| match err {
                StorageError::Missing => {
                    ApiError::Unauthorized(Some("token not found or expired".to_string()))
                }
                _ => ApiError::Internal,
            })?;
        let expiry = record.created_at + Duration::seconds(record.ttl_seconds);
        if expiry <= Utc::now() {
            return Err(ApiError::Unauthorized(Some("token expired".to_string())));
        }
        let user = self
            .state
            .storage
            .load_user(&record.user_id)
            .await
            .map_err(|err| match err {
                StorageError::Missing => {
                    ApiError::Unauthorized(Some("user not found".to_string()))
                }
                _ => ApiError::Internal,
            })?;
        if !user.is_active {
            return Err(ApiError::Forbidden);
        }
        Ok(user)
    }

    fn authorize_admin(&self, session: &ServerSession) -> bool {
        let Some(expected) = self.state.config.admin_token.as_deref() else {
            return false;
        };
        session
            .req_header()
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(|header| {
                let token = header
                    .trim()
                    .strip_prefix("Bearer ")
                    .unwrap_or(header.trim());
                token == expected
            })
            .unwrap_or(false)
    }

    pub(super) async fn check_rate_limit(
        &self,
        session: &ServerSession,
        scope: RateScope,
    ) -> Option<StdDuration> {
        let client = session
            .client_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let decision = self.state.rate_limits.check(scope, &client).await;
        if decision.allowed {
            None
        } else {
            decision.retry_after.or(Some(StdDuration::from_secs(1)))
        }
    }

    async fn read_body(session: &mut ServerSession) -> Result<Vec<u8>, ApiError> {
        let mut body = Vec::new();
        loop {
            match session.read_request_body().await {
                Ok(Some(chunk)) => {
                    body.extend_from_slice(&chunk);
                    if body.len() > MAX_BODY_LEN {
                        return Err(ApiError::BadRequest("request body too large".to_string()));
                    }
                }
                Ok(None) => break,
                Err(_) => return Err(ApiError::Internal),
            }
        }
        Ok(body)
    }

    fn cors_origin(&self, session: &ServerSession) -> Option<String> {
        let origin = session
            .req_header()
            .headers
            .get("origin")
            .and_then(|value| value.to_str().ok())?;
        let allowed = &self.state.config.allowed_origins;
        if allowed.iter().any(|entry| entry == "*") {
            return Some("*".to_string());
        }
        if allowed.iter().any(|entry| entry == origin) {
            return Some(origin.to_string());
        }
        None
    }

    async fn respond_preflight(&self, mut session: ServerSession) {
        let build = ResponseHeader::build_no_case(204, None);
        let Ok(mut response) = build else {
            return;
        };
        if let Some(origin) = self.cors_origin(&session) {
            let _ = response.append_header("access-control-allow-origin", origin);
            let _ = response.append_header("access-control-allow-methods", "GET, POST, OPTIONS");
            let _ = response
                .append_header("access-control-allow-headers", "authorization, content-type");
            let _ = response.append_header("access-control-max-age", "600");
        }
        if session
            .write_response_header(Box::new(response))
            .await
            .is_ok()
        {
            let _ = session.write_response_body(Vec::new().into(), true).await;
            let _ = session.finish().await;
        }
    }

    async fn respond_raw(
        &self,
        session: &mut ServerSession,
        status: u16,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(), ServerError> {
        let mut response =
            ResponseHeader::build_no_case(status, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", content_type)
            .map_err(|_| ServerError::Invalid)?;
        response
            .append_header("cache-control", "no-store")
            .map_err(|_| ServerError::Invalid)?;
        if let Some(origin) = self.cors_origin(session) {
            response
                .append_header("access-control-allow-origin", origin)
                .map_err(|_| ServerError::Invalid)?;
        }
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        session
            .write_response_body(body.into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        Ok(())
    }

    async fn respond_json(
        &self,
        session: &mut ServerSession,
        status: u16,
        payload: Value,
    ) -> Result<(), ServerError> {
        self.respond_raw(
            session,
            status,
            "application/json",
            payload.to_string().into_bytes(),
        )
        .await
    }

    async fn respond_success(
        &self,
        session: &mut ServerSession,
        status: u16,
        data: Value,
    ) -> Result<(), ApiError> {
        self.respond_json(session, status, json!({"success": true, "data": data}))
            .await
            .map_err(|_| ApiError::Internal)
    }

    pub(super) async fn respond_api_error(
        &self,
        session: &mut ServerSession,
        error: ApiError,
    ) -> Result<(), ServerError> {
        let status = error.status();
        let payload = json!({
            "success": false,
            "error": {
                "code": error.code(),
                "message": error.message(),
            },
        });
        if let ApiError::RateLimited(retry_after) = &error {
            let mut response =
                ResponseHeader::build_no_case(status, None).map_err(|_| ServerError::Invalid)?;
            response
                .append_header("content-type", "application/json")
                .map_err(|_| ServerError::Invalid)?;
            let seconds = retry_after.map(|d| d.as_secs().max(1)).unwrap_or(1);
            response
                .append_header("retry-after", seconds.to_string())
                .map_err(|_| ServerError::Invalid)?;
            session
                .write_response_header(Box::new(response))
                .await
                .map_err(|_| ServerError::Io)?;
            session
                .write_response_body(payload.to_string().into_bytes().into(), true)
                .await
                .map_err(|_| ServerError::Io)?;
            return Ok(());
        }
        self.respond_json(session, status, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_user() -> UserRecord {
        UserRecord {
            user_id: "user-1".to_string(),
            username: "alice".to_string(),
            email: "alice@example.org".to_string(),
            password_hash: "blake3$00$00".to_string(),
            is_active: true,
            created_at: Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn user_snapshot_omits_password_hash() {
        let snapshot = user_snapshot(&sample_user());
        assert_eq!(snapshot["id"], json!("user-1"));
        assert_eq!(snapshot["username"], json!("alice"));
        assert!(snapshot.get("passwordHash").is_none());
        assert!(snapshot.get("password_hash").is_none());
    }

    #[test]
    fn api_error_status_mapping() {
        assert_eq!(ApiError::Unauthorized(None).status(), 401);
        assert_eq!(ApiError::Forbidden.status(), 403);
        assert_eq!(ApiError::NotFound.status(), 404);
        assert_eq!(ApiError::BadRequest(String::new()).status(), 400);
        assert_eq!(ApiError::Unprocessable(String::new()).status(), 422);
        assert_eq!(ApiError::Conflict(String::new()).status(), 409);
        assert_eq!(ApiError::RateLimited(None).status(), 429);
        assert_eq!(ApiError::Unavailable(String::new()).status(), 503);
        assert_eq!(ApiError::Internal.status(), 500);
    }

    #[test]
    fn core_errors_map_to_caller_facing_statuses() {
        let cases: Vec<(CoreError, u16)> = vec![
            (CoreError::Forbidden, 403),
            (CoreError::NotFound, 404),
            (CoreError::Validation("self".to_string()), 422),
            (CoreError::Conflict("state".to_string()), 409),
            (CoreError::Transient("lock".to_string()), 503),
            (CoreError::Internal, 500),
        ];
        for (core, status) in cases {
            assert_eq!(ApiError::from(core).status(), status);
        }
    }

    #[test]
    fn challenge_create_request_uses_camel_case() {
        let parsed: ChallengeCreateRequest = serde_json::from_str(
            r#"{"challengedId": "user-2", "gameType": "Chess", "metadata": {"ranked": true}}"#,
        )
        .unwrap();
        assert_eq!(parsed.challenged_id, "user-2");
        assert_eq!(parsed.game_type, "Chess");
        assert_eq!(parsed.metadata.unwrap()["ranked"], json!(true));
    }
}
