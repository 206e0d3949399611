use super::{ApiError, RallyApp};
use crate::security::limiter::RateScope;
use crate::util::generate_id;
use chrono::Utc;
use pingora::apps::ReusedHttpStream;
use pingora::http::ResponseHeader;
use pingora::protocols::http::ServerSession;
use pingora::server::ShutdownWatch;
use rally_proto::{CodecError, Envelope, EventKind, MAX_ENVELOPE_LEN, WakeUpResponse};
use rally_storage::UserRecord;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE_DEPTH: usize = 128;
const MAX_INBOUND_BUFFER: usize = MAX_ENVELOPE_LEN * 2;

enum Handshake {
    Authenticated(Box<UserRecord>),
    NeedMoreData,
    Rejected(String),
}

impl RallyApp {
    /// Long-lived live-channel connection: authenticate the first envelope,
    /// bind the connection to its user, then pump envelopes both ways until
    /// the peer goes away or the process shuts down.
    pub(super) async fn process_connect(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<ReusedHttpStream> {
        if let Some(retry_after) = self.check_rate_limit(&session, RateScope::Connect).await {
            self.state.metrics.mark_rate_limited();
            if let Err(err) = self
                .respond_api_error(&mut session, ApiError::RateLimited(Some(retry_after)))
                .await
            {
                error!("connect rate limit response failed: {}", err);
            }
            return None;
        }

        let mut response = ResponseHeader::build_no_case(200, None).ok()?;
        response
            .append_header("content-type", "application/octet-stream")
            .ok()?;
        response.append_header("cache-control", "no-store").ok()?;
        session
            .write_response_header(Box::new(response))
            .await
            .ok()?;

        let mut buffer = Vec::new();
        let user = loop {
            match session.read_request_body().await {
                Ok(Some(chunk)) => buffer.extend_from_slice(&chunk),
                Ok(None) => return None,
                Err(err) => {
                    error!("live handshake read failed: {}", err);
                    return None;
                }
            }
            if buffer.len() > MAX_INBOUND_BUFFER {
                let _ = self
                    .write_envelope(
                        &mut session,
                        Envelope::new(0, EventKind::Error, json!({"message": "envelope too large"})),
                    )
                    .await;
                session.finish().await.ok()?;
                return None;
            }
            match self.handshake_step(&mut buffer).await {
                Handshake::Authenticated(user) => break *user,
                Handshake::NeedMoreData => continue,
                Handshake::Rejected(message) => {
                    let _ = self
                        .write_envelope(
                            &mut session,
                            Envelope::new(0, EventKind::Error, json!({"message": message})),
                        )
                        .await;
                    session.finish().await.ok()?;
                    return None;
                }
            }
        };

        let connection_id = generate_id(&format!("conn:{}", user.user_id));
        let (tx_out, mut rx_out) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE_DEPTH);
        self.state
            .bus
            .register_connection(&connection_id, &user.user_id, tx_out)
            .await;
        if let Err(err) = self
            .state
            .presence
            .set_online(&user.user_id, &connection_id)
            .await
        {
            warn!(user = %user.user_id, "presence registration failed: {}", err);
        }
        self.state.metrics.incr_connections();
        info!(user = %user.user_id, connection = %connection_id, "live connection bound");

        let sequence = self.state.bus.next_sequence(&connection_id).await;
        let connected = Envelope::new(
            sequence,
            EventKind::Connected,
            json!({
                "userId": user.user_id,
                "username": user.username,
                "now": Utc::now().to_rfc3339(),
            }),
        );
        if let Err(err) = self.write_envelope(&mut session, connected).await {
            error!("connected envelope send failed: {}", err);
            self.teardown_connection(&user, &connection_id).await;
            return None;
        }

        let mut shutdown_rx = shutdown.clone();
        'session_loop: loop {
            select! {
                inbound = session.read_request_body() => {
                    match inbound {
                        Ok(Some(chunk)) => {
                            if chunk.is_empty() {
                                continue;
                            }
                            buffer.extend_from_slice(&chunk);
                            if buffer.len() > MAX_INBOUND_BUFFER {
                                warn!(connection = %connection_id, "inbound buffer overrun");
                                break;
                            }
                            loop {
                                match Envelope::decode(&buffer) {
                                    Ok((envelope, consumed)) => {
                                        buffer.drain(0..consumed);
                                        if !self
                                            .handle_client_envelope(
                                                &mut session,
                                                &user,
                                                &connection_id,
                                                envelope,
                                            )
                                            .await
                                        {
                                            break 'session_loop;
                                        }
                                    }
                                    Err(CodecError::UnexpectedEof) => break,
                                    Err(err) => {
                                        debug!(connection = %connection_id, "undecodable envelope: {}", err);
                                        let _ = self
                                            .write_envelope(
                                                &mut session,
                                                Envelope::new(
                                                    0,
                                                    EventKind::Error,
                                                    json!({"message": format!("malformed envelope: {err}")}),
                                                ),
                                            )
                                            .await;
                                        break 'session_loop;
                                    }
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(connection = %connection_id, "live read failed: {}", err);
                            break;
                        }
                    }
                }
                outbound = rx_out.recv() => {
                    match outbound {
                        Some(envelope) => {
                            if let Err(err) = self.write_envelope(&mut session, envelope).await {
                                debug!(connection = %connection_id, "outbound send failed: {}", err);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() {
                        break;
                    }
                }
            }
        }

        self.teardown_connection(&user, &connection_id).await;
        session.finish().await.ok()?;
        None
    }

    async fn handshake_step(&self, buffer: &mut Vec<u8>) -> Handshake {
        let (envelope, consumed) = match Envelope::decode(buffer) {
            Ok(decoded) => decoded,
            Err(CodecError::UnexpectedEof) => return Handshake::NeedMoreData,
            Err(err) => return Handshake::Rejected(format!("malformed envelope: {err}")),
        };
        buffer.drain(0..consumed);
        if envelope.event != EventKind::Auth {
            return Handshake::Rejected("authentication required".to_string());
        }
        let Some(token) = envelope.payload.get("token").and_then(|v| v.as_str()) else {
            return Handshake::Rejected("token is required".to_string());
        };
        match self.authenticate_token(token).await {
            Ok(user) => Handshake::Authenticated(Box::new(user)),
            Err(_) => Handshake::Rejected("invalid or expired token".to_string()),
        }
    }

    /// Dispatches one inbound envelope. Returns false when the connection
    /// should close.
    async fn handle_client_envelope(
        self: &Arc<Self>,
        session: &mut ServerSession,
        user: &UserRecord,
        connection_id: &str,
        envelope: Envelope,
    ) -> bool {
        match envelope.event {
            EventKind::Heartbeat => {
                if let Err(err) = self.state.presence.heartbeat(&user.user_id).await {
                    warn!(user = %user.user_id, "heartbeat refresh failed: {}", err);
                }
                self.reply(
                    session,
                    connection_id,
                    EventKind::HeartbeatAck,
                    json!({"now": Utc::now().to_rfc3339()}),
                )
                .await
            }
            EventKind::ChallengeRespond => {
                let challenge_id = envelope
                    .payload
                    .get("challengeId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let response = envelope
                    .payload
                    .get("response")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if challenge_id.is_empty() {
                    return self
                        .reply_error(session, connection_id, "challengeId is required")
                        .await;
                }
                let Ok(response) = WakeUpResponse::from_str(response) else {
                    return self
                        .reply_error(session, connection_id, "response must be ACCEPT or DECLINE")
                        .await;
                };
                match self
                    .state
                    .orchestrator
                    .handle_wake_up_response(&challenge_id, &user.user_id, response)
                    .await
                {
                    Ok(super::orchestrator::WakeUpOutcome::SessionCreated(created)) => {
                        self.reply(
                            session,
                            connection_id,
                            EventKind::ChallengeRespondAck,
                            json!({
                                "challengeId": challenge_id,
                                "result": "SESSION_CREATED",
                                "sessionId": created.session_id,
                            }),
                        )
                        .await
                    }
                    Ok(super::orchestrator::WakeUpOutcome::Declined(_)) => {
                        self.reply(
                            session,
                            connection_id,
                            EventKind::ChallengeRespondAck,
                            json!({
                                "challengeId": challenge_id,
                                "result": "DECLINED",
                            }),
                        )
                        .await
                    }
                    Err(err) => {
                        self.reply_error(session, connection_id, &err.to_string())
                            .await
                    }
                }
            }
            EventKind::SessionJoin => {
                let Some(session_id) = envelope.payload.get("sessionId").and_then(|v| v.as_str())
                else {
                    return self
                        .reply_error(session, connection_id, "sessionId is required")
                        .await;
                };
                match self.state.storage.get_session(session_id).await {
                    Ok(record)
                        if record.player_a == user.user_id || record.player_b == user.user_id =>
                    {
                        self.state.bus.join_session(connection_id, session_id).await;
                        self.reply(
                            session,
                            connection_id,
                            EventKind::Ack,
                            json!({"event": "session:join", "sessionId": session_id}),
                        )
                        .await
                    }
                    Ok(_) => {
                        self.reply_error(session, connection_id, "not a session participant")
                            .await
                    }
                    Err(_) => {
                        self.reply_error(session, connection_id, "session not found")
                            .await
                    }
                }
            }
            EventKind::SessionLeave => {
                let Some(session_id) = envelope.payload.get("sessionId").and_then(|v| v.as_str())
                else {
                    return self
                        .reply_error(session, connection_id, "sessionId is required")
                        .await;
                };
                self.state.bus.leave_session(connection_id, session_id).await;
                self.reply(
                    session,
                    connection_id,
                    EventKind::Ack,
                    json!({"event": "session:leave", "sessionId": session_id}),
                )
                .await
            }
            EventKind::Auth => {
                self.reply_error(session, connection_id, "already authenticated")
                    .await
            }
            other => {
                self.reply_error(
                    session,
                    connection_id,
                    &format!("unsupported event: {other}"),
                )
                .await
            }
        }
    }

    async fn reply(
        &self,
        session: &mut ServerSession,
        connection_id: &str,
        event: EventKind,
        payload: serde_json::Value,
    ) -> bool {
        let sequence = self.state.bus.next_sequence(connection_id).await;
        match self
            .write_envelope(session, Envelope::new(sequence, event, payload))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                debug!(connection = %connection_id, "reply send failed: {}", err);
                false
            }
        }
    }

    async fn reply_error(
        &self,
        session: &mut ServerSession,
        connection_id: &str,
        message: &str,
    ) -> bool {
        self.reply(
            session,
            connection_id,
            EventKind::Error,
            json!({"message": message}),
        )
        .await
    }

    async fn write_envelope(
        &self,
        session: &mut ServerSession,
        envelope: Envelope,
    ) -> Result<(), super::ServerError> {
        let encoded = envelope.encode()?;
        session
            .write_response_body(encoded.into(), false)
            .await
            .map_err(|_| super::ServerError::Io)?;
        self.state.metrics.mark_live_egress();
        Ok(())
    }

    async fn teardown_connection(&self, user: &UserRecord, connection_id: &str) {
        self.state.bus.deregister_connection(connection_id).await;
        if let Err(err) = self
            .state
            .presence
            .set_offline(&user.user_id, connection_id)
            .await
        {
            warn!(user = %user.user_id, "presence cleanup failed: {}", err);
        }
        self.state.metrics.decr_connections();
        info!(user = %user.user_id, connection = %connection_id, "live connection closed");
    }
}
