use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};

pub mod presence;
pub mod shared;

pub use presence::{PresenceRegistry, PresenceSnapshot};
pub use shared::SharedStore;

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");
const JOBS_SQL: &str = include_str!("../migrations/002_jobs.sql");

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Redis,
    Serialization,
    Missing,
    Invalid,
    Conflict,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Redis => write!(f, "redis failure"),
            Self::Serialization => write!(f, "serialization failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Invalid => write!(f, "invalid state"),
            Self::Conflict => write!(f, "conflicting state"),
        }
    }
}

impl Error for StorageError {}

fn map_pg(err: tokio_postgres::Error) -> StorageError {
    match err.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => StorageError::Conflict,
        Some(code) if *code == SqlState::FOREIGN_KEY_VIOLATION => StorageError::Missing,
        Some(code) if *code == SqlState::CHECK_VIOLATION => StorageError::Invalid,
        _ => StorageError::Postgres,
    }
}

/// Lifecycle of a challenge. ACTIVE, DECLINED, TIMEOUT and EXPIRED are
/// terminal; a terminal row is never written again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Pending,
    Notifying,
    WaitingResponse,
    Active,
    Declined,
    Timeout,
    Expired,
}

impl ChallengeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Notifying => "NOTIFYING",
            Self::WaitingResponse => "WAITING_RESPONSE",
            Self::Active => "ACTIVE",
            Self::Declined => "DECLINED",
            Self::Timeout => "TIMEOUT",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::Declined | Self::Timeout | Self::Expired
        )
    }

    /// States a row may be in for a transition into `self` to be legal. The
    /// repository folds this list into every state-mutating WHERE clause, so
    /// an illegal transition cannot be effected even by a buggy caller.
    pub fn permitted_predecessors(&self) -> &'static [ChallengeState] {
        match self {
            Self::Pending => &[],
            Self::Notifying => &[Self::Pending],
            Self::WaitingResponse => &[Self::Notifying],
            Self::Active => &[Self::WaitingResponse],
            Self::Declined => &[Self::Pending, Self::WaitingResponse],
            Self::Timeout => &[Self::WaitingResponse],
            Self::Expired => &[Self::Pending],
        }
    }

    pub fn can_transition_to(&self, next: ChallengeState) -> bool {
        next.permitted_predecessors().contains(self)
    }
}

impl FromStr for ChallengeState {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "NOTIFYING" => Ok(Self::Notifying),
            "WAITING_RESPONSE" => Ok(Self::WaitingResponse),
            "ACTIVE" => Ok(Self::Active),
            "DECLINED" => Ok(Self::Declined),
            "TIMEOUT" => Ok(Self::Timeout),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(StorageError::Serialization),
        }
    }
}

impl Display for ChallengeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Completed,
    Abandoned,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Abandoned => "ABANDONED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }
}

impl FromStr for SessionState {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ACTIVE" => Ok(Self::Active),
            "COMPLETED" => Ok(Self::Completed),
            "ABANDONED" => Ok(Self::Abandoned),
            _ => Err(StorageError::Serialization),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTokenRecord {
    pub token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTokenRecord {
    pub user_id: String,
    pub token: String,
    pub platform: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChallenge<'a> {
    pub challenge_id: &'a str,
    pub challenger_id: &'a str,
    pub challenged_id: &'a str,
    pub game_type: &'a str,
    pub expires_at: DateTime<Utc>,
    pub metadata: &'a Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeRecord {
    pub challenge_id: String,
    pub challenger_id: String,
    pub challenged_id: String,
    pub game_type: String,
    pub state: ChallengeState,
    pub expires_at: DateTime<Utc>,
    pub wake_attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub challenge_id: String,
    pub player_a: String,
    pub player_b: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub job_id: &'a str,
    pub kind: &'a str,
    pub payload: &'a Value,
    pub run_at: DateTime<Utc>,
    pub repeat_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    pub job_id: String,
    pub kind: String,
    pub payload: Value,
    pub run_at: DateTime<Utc>,
    pub repeat_seconds: Option<i64>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

const USER_COLUMNS: &str =
    "user_id, username, email, password_hash, is_active, created_at, updated_at";
const CHALLENGE_COLUMNS: &str = "challenge_id, challenger_id, challenged_id, game_type, state, \
     expires_at, wake_attempts, last_attempt_at, metadata, created_at, updated_at";
const SESSION_COLUMNS: &str =
    "session_id, challenge_id, player_a, player_b, state, started_at, ended_at, metadata";

fn user_from_row(row: &Row) -> UserRecord {
    UserRecord {
        user_id: row.get(0),
        username: row.get(1),
        email: row.get(2),
        password_hash: row.get(3),
        is_active: row.get(4),
        created_at: row.get(5),
        updated_at: row.get(6),
    }
}

fn challenge_from_row(row: &Row) -> Result<ChallengeRecord, StorageError> {
    let state: String = row.get(4);
    Ok(ChallengeRecord {
        challenge_id: row.get(0),
        challenger_id: row.get(1),
        challenged_id: row.get(2),
        game_type: row.get(3),
        state: state.parse()?,
        expires_at: row.get(5),
        wake_attempts: row.get(6),
        last_attempt_at: row.get(7),
        metadata: row.get(8),
        created_at: row.get(9),
        updated_at: row.get(10),
    })
}

fn session_from_row(row: &Row) -> Result<SessionRecord, StorageError> {
    let state: String = row.get(4);
    Ok(SessionRecord {
        session_id: row.get(0),
        challenge_id: row.get(1),
        player_a: row.get(2),
        player_b: row.get(3),
        state: state.parse()?,
        started_at: row.get(5),
        ended_at: row.get(6),
        metadata: row.get(7),
    })
}

fn job_from_row(row: &Row) -> ScheduledJob {
    ScheduledJob {
        job_id: row.get(0),
        kind: row.get(1),
        payload: row.get(2),
        run_at: row.get(3),
        repeat_seconds: row.get(4),
        attempts: row.get(5),
        last_error: row.get(6),
        created_at: row.get(7),
    }
}

fn state_names(states: &[ChallengeState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

pub struct Storage {
    client: Client,
    _pg_task: JoinHandle<()>,
}

/// Establishes connectivity to the PostgreSQL backend.
pub async fn connect(postgres_dsn: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    Ok(Storage {
        client,
        _pg_task: task,
    })
}

impl Storage {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)?;
        self.client
            .batch_execute(JOBS_SQL)
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Executes a lightweight liveness probe.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    pub async fn create_user(&self, user: &NewUser) -> Result<UserRecord, StorageError> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO app_user (user_id, username, email, password_hash, is_active, created_at, updated_at)
             VALUES ($1, $2, $3, $4, TRUE, $5, $5)
             RETURNING {USER_COLUMNS}"
        );
        let row = self
            .client
            .query_one(
                &query,
                &[
                    &user.user_id,
                    &user.username,
                    &user.email,
                    &user.password_hash,
                    &now,
                ],
            )
            .await
            .map_err(map_pg)?;
        Ok(user_from_row(&row))
    }

    pub async fn load_user(&self, user_id: &str) -> Result<UserRecord, StorageError> {
        let query = format!("SELECT {USER_COLUMNS} FROM app_user WHERE user_id = $1");
        let row = self
            .client
            .query_opt(&query, &[&user_id])
            .await
            .map_err(|_| StorageError::Postgres)?
            .ok_or(StorageError::Missing)?;
        Ok(user_from_row(&row))
    }

    pub async fn load_user_by_email(&self, email: &str) -> Result<UserRecord, StorageError> {
        let query = format!("SELECT {USER_COLUMNS} FROM app_user WHERE email = $1");
        let row = self
            .client
            .query_opt(&query, &[&email])
            .await
            .map_err(|_| StorageError::Postgres)?
            .ok_or(StorageError::Missing)?;
        Ok(user_from_row(&row))
    }

    pub async fn load_user_by_username(&self, username: &str) -> Result<UserRecord, StorageError> {
        let query = format!("SELECT {USER_COLUMNS} FROM app_user WHERE username = $1");
        let row = self
            .client
            .query_opt(&query, &[&username])
            .await
            .map_err(|_| StorageError::Postgres)?
            .ok_or(StorageError::Missing)?;
        Ok(user_from_row(&row))
    }

    pub async fn list_users(&self) -> Result<Vec<UserRecord>, StorageError> {
        let query =
            format!("SELECT {USER_COLUMNS} FROM app_user WHERE is_active ORDER BY username");
        let rows = self
            .client
            .query(&query, &[])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn create_auth_token(&self, record: &AuthTokenRecord) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO auth_token (token, user_id, created_at, ttl_seconds)
                 VALUES ($1, $2, $3, $4)",
                &[
                    &record.token,
                    &record.user_id,
                    &record.created_at,
                    &record.ttl_seconds,
                ],
            )
            .await
            .map_err(map_pg)?;
        Ok(())
    }

    pub async fn load_auth_token(&self, token: &str) -> Result<AuthTokenRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT token, user_id, created_at, ttl_seconds FROM auth_token WHERE token = $1",
                &[&token],
            )
            .await
            .map_err(|_| StorageError::Postgres)?
            .ok_or(StorageError::Missing)?;
        Ok(AuthTokenRecord {
            token: row.get(0),
            user_id: row.get(1),
            created_at: row.get(2),
            ttl_seconds: row.get(3),
        })
    }

    pub async fn delete_auth_token(&self, token: &str) -> Result<(), StorageError> {
        self.client
            .execute("DELETE FROM auth_token WHERE token = $1", &[&token])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Drops bearer tokens whose lifetime has elapsed.
    pub async fn purge_expired_auth_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let purged = self
            .client
            .execute(
                "DELETE FROM auth_token
                 WHERE created_at + make_interval(secs => ttl_seconds::double precision) < $1",
                &[&now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(purged)
    }

    /// Registers a push delivery token; re-registering is a no-op.
    pub async fn add_push_token(
        &self,
        user_id: &str,
        token: &str,
        platform: Option<&str>,
    ) -> Result<bool, StorageError> {
        let now = Utc::now();
        let inserted = self
            .client
            .execute(
                "INSERT INTO push_token (user_id, token, platform, created_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (user_id, token) DO NOTHING",
                &[&user_id, &token, &platform, &now],
            )
            .await
            .map_err(map_pg)?;
        Ok(inserted == 1)
    }

    pub async fn remove_push_token(&self, user_id: &str, token: &str) -> Result<bool, StorageError> {
        let removed = self
            .client
            .execute(
                "DELETE FROM push_token WHERE user_id = $1 AND token = $2",
                &[&user_id, &token],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(removed == 1)
    }

    pub async fn list_push_tokens(
        &self,
        user_id: &str,
    ) -> Result<Vec<PushTokenRecord>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT user_id, token, platform, created_at FROM push_token
                 WHERE user_id = $1 ORDER BY created_at ASC",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .iter()
            .map(|row| PushTokenRecord {
                user_id: row.get(0),
                token: row.get(1),
                platform: row.get(2),
                created_at: row.get(3),
            })
            .collect())
    }

    pub async fn create_challenge(
        &self,
        challenge: &NewChallenge<'_>,
    ) -> Result<ChallengeRecord, StorageError> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO challenge (challenge_id, challenger_id, challenged_id, game_type, state,
                 expires_at, wake_attempts, metadata, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 'PENDING', $5, 0, $6, $7, $7)
             RETURNING {CHALLENGE_COLUMNS}"
        );
        let row = self
            .client
            .query_one(
                &query,
                &[
                    &challenge.challenge_id,
                    &challenge.challenger_id,
                    &challenge.challenged_id,
                    &challenge.game_type,
                    &challenge.expires_at,
                    &challenge.metadata,
                    &now,
                ],
            )
            .await
            .map_err(map_pg)?;
        challenge_from_row(&row)
    }

    pub async fn get_challenge(&self, challenge_id: &str) -> Result<ChallengeRecord, StorageError> {
        let query = format!("SELECT {CHALLENGE_COLUMNS} FROM challenge WHERE challenge_id = $1");
        let row = self
            .client
            .query_opt(&query, &[&challenge_id])
            .await
            .map_err(|_| StorageError::Postgres)?
            .ok_or(StorageError::Missing)?;
        challenge_from_row(&row)
    }

    /// Loads a challenge together with both party profiles.
    pub async fn get_challenge_with_parties(
        &self,
        challenge_id: &str,
    ) -> Result<(ChallengeRecord, UserRecord, UserRecord), StorageError> {
        let challenge = self.get_challenge(challenge_id).await?;
        let challenger = self.load_user(&challenge.challenger_id).await?;
        let challenged = self.load_user(&challenge.challenged_id).await?;
        Ok((challenge, challenger, challenged))
    }

    /// Challenges still awaiting the challenged user's acceptance.
    pub async fn list_pending_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChallengeRecord>, StorageError> {
        let query = format!(
            "SELECT {CHALLENGE_COLUMNS} FROM challenge
             WHERE challenged_id = $1 AND state = 'PENDING' AND expires_at > $2
             ORDER BY created_at DESC"
        );
        let rows = self
            .client
            .query(&query, &[&user_id, &now])
            .await
            .map_err(|_| StorageError::Postgres)?;
        rows.iter().map(challenge_from_row).collect()
    }

    /// Moves a challenge into `next`. The permitted-predecessor list of the
    /// target state is folded into the WHERE clause; a guard miss on an
    /// existing row reports Conflict.
    pub async fn update_challenge_state(
        &self,
        challenge_id: &str,
        next: ChallengeState,
    ) -> Result<ChallengeRecord, StorageError> {
        let permitted = state_names(next.permitted_predecessors());
        if permitted.is_empty() {
            return Err(StorageError::Invalid);
        }
        let now = Utc::now();
        let query = format!(
            "UPDATE challenge SET state = $2, updated_at = $3
             WHERE challenge_id = $1 AND state = ANY($4)
             RETURNING {CHALLENGE_COLUMNS}"
        );
        let row = self
            .client
            .query_opt(&query, &[&challenge_id, &next.as_str(), &now, &permitted])
            .await
            .map_err(|_| StorageError::Postgres)?;
        match row {
            Some(row) => challenge_from_row(&row),
            None => {
                self.get_challenge(challenge_id).await?;
                Err(StorageError::Conflict)
            }
        }
    }

    /// Bumps the wake-up attempt counter, bounded by `max_attempts`.
    pub async fn increment_attempt(
        &self,
        challenge_id: &str,
        max_attempts: i32,
    ) -> Result<i32, StorageError> {
        let now = Utc::now();
        let row = self
            .client
            .query_opt(
                "UPDATE challenge
                 SET wake_attempts = wake_attempts + 1, last_attempt_at = $2, updated_at = $2
                 WHERE challenge_id = $1 AND wake_attempts < $3
                 RETURNING wake_attempts",
                &[&challenge_id, &now, &max_attempts],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        match row {
            Some(row) => Ok(row.get(0)),
            None => {
                self.get_challenge(challenge_id).await?;
                Err(StorageError::Conflict)
            }
        }
    }

    /// Atomically finalizes an accepted handshake: the challenge moves
    /// WAITING_RESPONSE -> ACTIVE and the session row is written in the same
    /// statement, so no observer ever sees one without the other.
    pub async fn activate_challenge(
        &self,
        challenge_id: &str,
        session_id: &str,
        metadata: &Value,
    ) -> Result<SessionRecord, StorageError> {
        let now = Utc::now();
        let query = format!(
            "WITH moved AS (
                UPDATE challenge SET state = 'ACTIVE', updated_at = $3
                WHERE challenge_id = $1 AND state = 'WAITING_RESPONSE'
                RETURNING challenge_id, challenger_id, challenged_id
            )
            INSERT INTO game_session (session_id, challenge_id, player_a, player_b, state, started_at, metadata)
            SELECT $2, challenge_id, challenger_id, challenged_id, 'ACTIVE', $3, $4 FROM moved
            RETURNING {SESSION_COLUMNS}"
        );
        let row = self
            .client
            .query_opt(&query, &[&challenge_id, &session_id, &now, &metadata])
            .await
            .map_err(map_pg)?;
        match row {
            Some(row) => session_from_row(&row),
            None => {
                self.get_challenge(challenge_id).await?;
                Err(StorageError::Conflict)
            }
        }
    }

    /// Expires every PENDING challenge whose deadline has passed. The state
    /// guard doubles as the race resolution: a row concurrently moved to
    /// NOTIFYING no longer matches.
    pub async fn mark_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let expired = self
            .client
            .execute(
                "UPDATE challenge SET state = 'EXPIRED', updated_at = $1
                 WHERE state = 'PENDING' AND expires_at < $1",
                &[&now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(expired)
    }

    /// Prunes terminal challenges (and their sessions) past the retention
    /// window.
    pub async fn delete_terminal_older_than(
        &self,
        retention_days: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let cutoff = now - Duration::days(retention_days);
        let terminal = state_names(&[
            ChallengeState::Active,
            ChallengeState::Declined,
            ChallengeState::Timeout,
            ChallengeState::Expired,
        ]);
        self.client
            .execute(
                "DELETE FROM game_session WHERE state <> 'ACTIVE' AND challenge_id IN (
                     SELECT challenge_id FROM challenge
                     WHERE state = ANY($1) AND updated_at < $2
                 )",
                &[&terminal, &cutoff],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let deleted = self
            .client
            .execute(
                "DELETE FROM challenge
                 WHERE state = ANY($1) AND updated_at < $2
                   AND NOT EXISTS (
                       SELECT 1 FROM game_session s WHERE s.challenge_id = challenge.challenge_id
                   )",
                &[&terminal, &cutoff],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(deleted)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord, StorageError> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM game_session WHERE session_id = $1");
        let row = self
            .client
            .query_opt(&query, &[&session_id])
            .await
            .map_err(|_| StorageError::Postgres)?
            .ok_or(StorageError::Missing)?;
        session_from_row(&row)
    }

    pub async fn get_session_by_challenge(
        &self,
        challenge_id: &str,
    ) -> Result<SessionRecord, StorageError> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM game_session WHERE challenge_id = $1");
        let row = self
            .client
            .query_opt(&query, &[&challenge_id])
            .await
            .map_err(|_| StorageError::Postgres)?
            .ok_or(StorageError::Missing)?;
        session_from_row(&row)
    }

    pub async fn list_active_sessions_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<SessionRecord>, StorageError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM game_session
             WHERE (player_a = $1 OR player_b = $1) AND state = 'ACTIVE'
             ORDER BY started_at DESC"
        );
        let rows = self
            .client
            .query(&query, &[&user_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        rows.iter().map(session_from_row).collect()
    }

    /// Writes a session's terminal state at most once.
    pub async fn end_session(
        &self,
        session_id: &str,
        terminal: SessionState,
        metadata: &Value,
    ) -> Result<SessionRecord, StorageError> {
        if !terminal.is_terminal() {
            return Err(StorageError::Invalid);
        }
        let now = Utc::now();
        let query = format!(
            "UPDATE game_session SET state = $2, ended_at = $3, metadata = metadata || $4
             WHERE session_id = $1 AND state = 'ACTIVE'
             RETURNING {SESSION_COLUMNS}"
        );
        let row = self
            .client
            .query_opt(&query, &[&session_id, &terminal.as_str(), &now, &metadata])
            .await
            .map_err(|_| StorageError::Postgres)?;
        match row {
            Some(row) => session_from_row(&row),
            None => {
                self.get_session(session_id).await?;
                Err(StorageError::Conflict)
            }
        }
    }

    /// Enqueues a job under a caller-chosen id; re-scheduling the same id is
    /// a no-op. Returns whether the row was inserted.
    pub async fn schedule_job(&self, job: &NewJob<'_>) -> Result<bool, StorageError> {
        let now = Utc::now();
        let inserted = self
            .client
            .execute(
                "INSERT INTO scheduled_job (job_id, kind, payload, run_at, repeat_seconds, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (job_id) DO NOTHING",
                &[
                    &job.job_id,
                    &job.kind,
                    &job.payload,
                    &job.run_at,
                    &job.repeat_seconds,
                    &now,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(inserted == 1)
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, StorageError> {
        let removed = self
            .client
            .execute("DELETE FROM scheduled_job WHERE job_id = $1", &[&job_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(removed == 1)
    }

    /// Claims due jobs under a lease: `run_at` is pushed past the lease so a
    /// crashed worker's claim re-surfaces, giving at-least-once delivery.
    pub async fn claim_due_jobs(
        &self,
        limit: i64,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, StorageError> {
        let lease_deadline = now + lease;
        let query = "WITH due AS (
                SELECT job_id
                FROM scheduled_job
                WHERE run_at <= $1
                ORDER BY run_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            ),
            claimed AS (
                UPDATE scheduled_job j
                SET run_at = $3, attempts = j.attempts + 1
                FROM due
                WHERE j.job_id = due.job_id
                RETURNING j.job_id, j.kind, j.payload, j.run_at, j.repeat_seconds,
                          j.attempts, j.last_error, j.created_at
            )
            SELECT * FROM claimed";
        let rows = self
            .client
            .query(query, &[&now, &limit, &lease_deadline])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(job_from_row).collect())
    }

    pub async fn complete_job(&self, job_id: &str) -> Result<(), StorageError> {
        self.client
            .execute("DELETE FROM scheduled_job WHERE job_id = $1", &[&job_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Pushes a failed job into the future and records the failure reason.
    pub async fn reschedule_job(
        &self,
        job_id: &str,
        delay: Duration,
        now: DateTime<Utc>,
        last_error: Option<&str>,
    ) -> Result<(), StorageError> {
        let next = now + delay;
        self.client
            .execute(
                "UPDATE scheduled_job SET run_at = $2, last_error = $3 WHERE job_id = $1",
                &[&job_id, &next, &last_error],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Re-arms a recurring job for its next interval.
    pub async fn rearm_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        self.client
            .execute(
                "UPDATE scheduled_job
                 SET run_at = $2 + make_interval(secs => repeat_seconds::double precision),
                     attempts = 0, last_error = NULL
                 WHERE job_id = $1 AND repeat_seconds IS NOT NULL",
                &[&job_id, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_sql_declares_relations() {
        assert!(INIT_SQL.contains("app_user"));
        assert!(INIT_SQL.contains("challenge"));
        assert!(INIT_SQL.contains("game_session"));
        assert!(INIT_SQL.contains("push_token"));
        assert!(JOBS_SQL.contains("scheduled_job"));
    }

    #[test]
    fn challenge_state_roundtrip() {
        assert_eq!(ChallengeState::WaitingResponse.as_str(), "WAITING_RESPONSE");
        assert_eq!(
            ChallengeState::from_str("NOTIFYING").unwrap(),
            ChallengeState::Notifying
        );
        assert!(ChallengeState::from_str("SLEEPING").is_err());
    }

    #[test]
    fn transition_table_is_closed() {
        use ChallengeState::*;
        let legal = [
            (Pending, Notifying),
            (Pending, Expired),
            (Pending, Declined),
            (Notifying, WaitingResponse),
            (WaitingResponse, Active),
            (WaitingResponse, Declined),
            (WaitingResponse, Timeout),
        ];
        let all = [
            Pending,
            Notifying,
            WaitingResponse,
            Active,
            Declined,
            Timeout,
            Expired,
        ];
        for from in all {
            for to in all {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        use ChallengeState::*;
        for state in [Active, Declined, Timeout, Expired] {
            assert!(state.is_terminal());
            for next in [
                Pending,
                Notifying,
                WaitingResponse,
                Active,
                Declined,
                Timeout,
                Expired,
            ] {
                assert!(!state.can_transition_to(next));
            }
        }
    }

    #[test]
    fn session_state_terminality() {
        assert!(!SessionState::Active.is_terminal());
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Abandoned.is_terminal());
        assert!(SessionState::from_str("PAUSED").is_err());
    }

    #[tokio::test]
    async fn storage_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let dsn = match std::env::var("RALLY_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: RALLY_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let storage = connect(&dsn).await?;
        storage.migrate().await?;
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();

        let alice = storage
            .create_user(&NewUser {
                user_id: format!("user-a-{suffix}"),
                username: format!("alice{suffix}"),
                email: format!("alice{suffix}@example.org"),
                password_hash: "blake3$00$00".to_string(),
            })
            .await?;
        let bob = storage
            .create_user(&NewUser {
                user_id: format!("user-b-{suffix}"),
                username: format!("bob{suffix}"),
                email: format!("bob{suffix}@example.org"),
                password_hash: "blake3$00$00".to_string(),
            })
            .await?;

        // duplicate username is a conflict
        let duplicate = storage
            .create_user(&NewUser {
                user_id: format!("user-c-{suffix}"),
                username: alice.username.clone(),
                email: format!("other{suffix}@example.org"),
                password_hash: "blake3$00$00".to_string(),
            })
            .await;
        assert!(matches!(duplicate, Err(StorageError::Conflict)));

        let challenge_id = format!("ch-{suffix}");
        let metadata = json!({"arena": "blitz"});
        let challenge = storage
            .create_challenge(&NewChallenge {
                challenge_id: &challenge_id,
                challenger_id: &alice.user_id,
                challenged_id: &bob.user_id,
                game_type: "Chess",
                expires_at: Utc::now() + Duration::seconds(3600),
                metadata: &metadata,
            })
            .await?;
        assert_eq!(challenge.state, ChallengeState::Pending);
        assert_eq!(challenge.wake_attempts, 0);

        let pending = storage
            .list_pending_for_user(&bob.user_id, Utc::now())
            .await?;
        assert!(pending.iter().any(|c| c.challenge_id == challenge_id));

        // illegal skip straight to ACTIVE is rejected
        let skip = storage
            .update_challenge_state(&challenge_id, ChallengeState::Active)
            .await;
        assert!(matches!(skip, Err(StorageError::Conflict)));

        storage
            .update_challenge_state(&challenge_id, ChallengeState::Notifying)
            .await?;
        let waiting = storage
            .update_challenge_state(&challenge_id, ChallengeState::WaitingResponse)
            .await?;
        assert_eq!(waiting.state, ChallengeState::WaitingResponse);

        let attempts = storage.increment_attempt(&challenge_id, 3).await?;
        assert_eq!(attempts, 1);

        let session_id = format!("ses-{suffix}");
        let session = storage
            .activate_challenge(&challenge_id, &session_id, &json!({}))
            .await?;
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.player_a, alice.user_id);
        assert_eq!(session.player_b, bob.user_id);

        // a second activation finds no WAITING_RESPONSE row
        let again = storage
            .activate_challenge(&challenge_id, "ses-dup", &json!({}))
            .await;
        assert!(matches!(again, Err(StorageError::Conflict)));

        let by_challenge = storage.get_session_by_challenge(&challenge_id).await?;
        assert_eq!(by_challenge.session_id, session_id);

        let ended = storage
            .end_session(&session_id, SessionState::Completed, &json!({"winner": "a"}))
            .await?;
        assert_eq!(ended.state, SessionState::Completed);
        assert!(ended.ended_at.is_some());
        let twice = storage
            .end_session(&session_id, SessionState::Abandoned, &json!({}))
            .await;
        assert!(matches!(twice, Err(StorageError::Conflict)));

        // push tokens are idempotent per (user, token)
        assert!(storage.add_push_token(&alice.user_id, "tok-1", Some("ios")).await?);
        assert!(!storage.add_push_token(&alice.user_id, "tok-1", Some("ios")).await?);
        let tokens = storage.list_push_tokens(&alice.user_id).await?;
        assert_eq!(tokens.len(), 1);
        assert!(storage.remove_push_token(&alice.user_id, "tok-1").await?);

        // job scheduling is idempotent by id
        let job_id = format!("timeout-{challenge_id}-1");
        let job = NewJob {
            job_id: &job_id,
            kind: "handshake-timeout",
            payload: &json!({"challenge_id": challenge_id, "attempt": 1}),
            run_at: Utc::now() - Duration::seconds(1),
            repeat_seconds: None,
        };
        assert!(storage.schedule_job(&job).await?);
        assert!(!storage.schedule_job(&job).await?);
        let claimed = storage
            .claim_due_jobs(16, Duration::seconds(20), Utc::now())
            .await?;
        assert!(claimed.iter().any(|j| j.job_id == job_id));
        // the lease hides the job from a second claim
        let reclaimed = storage
            .claim_due_jobs(16, Duration::seconds(20), Utc::now())
            .await?;
        assert!(!reclaimed.iter().any(|j| j.job_id == job_id));
        storage.complete_job(&job_id).await?;

        Ok(())
    }
}
