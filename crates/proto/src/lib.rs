use serde_json::{Value, json};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_ENVELOPE_LEN: usize = 64 * 1024;

/// Returns true when the provided protocol version is understood by this codec.
pub fn is_supported_protocol_version(version: u16) -> bool {
    version == PROTOCOL_VERSION
}

/// Events carried over the live channel, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Auth,
    Connected,
    Heartbeat,
    HeartbeatAck,
    ChallengeReceived,
    ChallengeWakeUp,
    ChallengeRespond,
    ChallengeRespondAck,
    ChallengeDeclined,
    ChallengeTimeout,
    SessionReady,
    SessionJoin,
    SessionLeave,
    Ack,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Connected => "connected",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat-ack",
            Self::ChallengeReceived => "challenge:received",
            Self::ChallengeWakeUp => "challenge:wake-up",
            Self::ChallengeRespond => "challenge:respond",
            Self::ChallengeRespondAck => "challenge:respond-ack",
            Self::ChallengeDeclined => "challenge:declined",
            Self::ChallengeTimeout => "challenge:timeout",
            Self::SessionReady => "session:ready",
            Self::SessionJoin => "session:join",
            Self::SessionLeave => "session:leave",
            Self::Ack => "ack",
            Self::Error => "error",
        }
    }
}

impl FromStr for EventKind {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "auth" => Ok(Self::Auth),
            "connected" => Ok(Self::Connected),
            "heartbeat" => Ok(Self::Heartbeat),
            "heartbeat-ack" => Ok(Self::HeartbeatAck),
            "challenge:received" => Ok(Self::ChallengeReceived),
            "challenge:wake-up" => Ok(Self::ChallengeWakeUp),
            "challenge:respond" => Ok(Self::ChallengeRespond),
            "challenge:respond-ack" => Ok(Self::ChallengeRespondAck),
            "challenge:declined" => Ok(Self::ChallengeDeclined),
            "challenge:timeout" => Ok(Self::ChallengeTimeout),
            "session:ready" => Ok(Self::SessionReady),
            "session:join" => Ok(Self::SessionJoin),
            "session:leave" => Ok(Self::SessionLeave),
            "ack" => Ok(Self::Ack),
            "error" => Ok(Self::Error),
            _ => Err(CodecError::UnknownEvent),
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The answer a woken challenger gives to a pending handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeUpResponse {
    Accept,
    Decline,
}

impl WakeUpResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Decline => "DECLINE",
        }
    }
}

impl FromStr for WakeUpResponse {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ACCEPT" => Ok(Self::Accept),
            "DECLINE" => Ok(Self::Decline),
            _ => Err(CodecError::InvalidResponse),
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    UnknownEvent,
    InvalidResponse,
    InvalidJson,
    UnsupportedVersion,
    UnexpectedEof,
    VarintOverflow,
    EnvelopeTooLarge,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEvent => write!(f, "unknown event"),
            Self::InvalidResponse => write!(f, "invalid wake-up response"),
            Self::InvalidJson => write!(f, "invalid envelope json"),
            Self::UnsupportedVersion => write!(f, "unsupported protocol version"),
            Self::UnexpectedEof => write!(f, "unexpected end of envelope"),
            Self::VarintOverflow => write!(f, "varint overflow"),
            Self::EnvelopeTooLarge => write!(f, "envelope exceeds limits"),
        }
    }
}

impl Error for CodecError {}

/// A single live-channel message: length-prefixed JSON with a closed event set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sequence: u64,
    pub event: EventKind,
    pub payload: Value,
}

impl Envelope {
    pub fn new(sequence: u64, event: EventKind, payload: Value) -> Self {
        Envelope {
            sequence,
            event,
            payload,
        }
    }

    /// Serializes the envelope into its length-prefixed representation.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let body = json!({
            "v": PROTOCOL_VERSION,
            "seq": self.sequence,
            "event": self.event.as_str(),
            "payload": self.payload,
        });
        let body = serde_json::to_vec(&body).map_err(|_| CodecError::InvalidJson)?;
        if body.len() > MAX_ENVELOPE_LEN {
            return Err(CodecError::EnvelopeTooLarge);
        }
        let mut encoded = Vec::with_capacity(body.len() + 4);
        encode_varint(body.len() as u64, &mut encoded);
        encoded.extend_from_slice(&body);
        Ok(encoded)
    }

    /// Attempts to decode one envelope from a contiguous buffer, returning the
    /// envelope and the number of bytes consumed. `UnexpectedEof` signals that
    /// the buffer holds only a partial envelope and more input is needed.
    pub fn decode(buffer: &[u8]) -> Result<(Self, usize), CodecError> {
        let (body_len_raw, header_len) = decode_varint(buffer)?;
        let body_len = usize::try_from(body_len_raw).map_err(|_| CodecError::EnvelopeTooLarge)?;
        if body_len > MAX_ENVELOPE_LEN {
            return Err(CodecError::EnvelopeTooLarge);
        }
        if buffer.len() < header_len + body_len {
            return Err(CodecError::UnexpectedEof);
        }
        let body = &buffer[header_len..header_len + body_len];
        let parsed: Value = serde_json::from_slice(body).map_err(|_| CodecError::InvalidJson)?;
        let version = parsed
            .get("v")
            .and_then(|v| v.as_u64())
            .ok_or(CodecError::InvalidJson)?;
        let supported = u16::try_from(version)
            .map(is_supported_protocol_version)
            .unwrap_or(false);
        if !supported {
            return Err(CodecError::UnsupportedVersion);
        }
        let sequence = parsed.get("seq").and_then(|v| v.as_u64()).unwrap_or(0);
        let event = parsed
            .get("event")
            .and_then(|v| v.as_str())
            .ok_or(CodecError::InvalidJson)?
            .parse::<EventKind>()?;
        let payload = parsed.get("payload").cloned().unwrap_or(Value::Null);
        Ok((
            Envelope {
                sequence,
                event,
                payload,
            },
            header_len + body_len,
        ))
    }
}

fn encode_varint(mut value: u64, buffer: &mut Vec<u8>) {
    while value >= 0x80 {
        buffer.push(((value as u8) & 0x7f) | 0x80);
        value >>= 7;
    }
    buffer.push(value as u8);
}

fn decode_varint(buffer: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (index, byte) in buffer.iter().enumerate() {
        let part = (byte & 0x7f) as u64;
        value |= part << shift;
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
        shift += 7;
        if shift > 63 {
            return Err(CodecError::VarintOverflow);
        }
    }
    Err(CodecError::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrip_wake_up_event() {
        let envelope = Envelope::new(
            7,
            EventKind::ChallengeWakeUp,
            json!({
                "challengeId": "ch-1",
                "challenger": "user-2",
                "game_type": "Chess",
            }),
        );
        let encoded = envelope.encode().unwrap();
        let (decoded, read) = Envelope::decode(&encoded).unwrap();
        assert_eq!(read, encoded.len());
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.event, EventKind::ChallengeWakeUp);
        assert_eq!(decoded.payload["challengeId"], json!("ch-1"));
    }

    #[test]
    fn partial_buffer_reports_eof() {
        let envelope = Envelope::new(1, EventKind::Heartbeat, Value::Null);
        let encoded = envelope.encode().unwrap();
        match Envelope::decode(&encoded[..encoded.len() - 2]) {
            Err(CodecError::UnexpectedEof) => {}
            other => panic!("expected eof, got {:?}", other.map(|(e, _)| e.event)),
        }
    }

    #[test]
    fn consecutive_envelopes_decode_in_order() {
        let first = Envelope::new(1, EventKind::Heartbeat, Value::Null);
        let second = Envelope::new(2, EventKind::SessionJoin, json!({"sessionId": "s-1"}));
        let mut buffer = first.encode().unwrap();
        buffer.extend_from_slice(&second.encode().unwrap());
        let (decoded_first, consumed) = Envelope::decode(&buffer).unwrap();
        assert_eq!(decoded_first.event, EventKind::Heartbeat);
        let (decoded_second, _) = Envelope::decode(&buffer[consumed..]).unwrap();
        assert_eq!(decoded_second.event, EventKind::SessionJoin);
        assert_eq!(decoded_second.sequence, 2);
    }

    #[test]
    fn unknown_event_rejected() {
        let mut buffer = Vec::new();
        let body = json!({"v": 1, "seq": 1, "event": "challenge:steal", "payload": null});
        let body = serde_json::to_vec(&body).unwrap();
        encode_varint(body.len() as u64, &mut buffer);
        buffer.extend_from_slice(&body);
        assert!(matches!(
            Envelope::decode(&buffer),
            Err(CodecError::UnknownEvent)
        ));
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut buffer = Vec::new();
        let body = json!({"v": 9, "seq": 1, "event": "heartbeat", "payload": null});
        let body = serde_json::to_vec(&body).unwrap();
        encode_varint(body.len() as u64, &mut buffer);
        buffer.extend_from_slice(&body);
        assert!(matches!(
            Envelope::decode(&buffer),
            Err(CodecError::UnsupportedVersion)
        ));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut buffer = Vec::new();
        encode_varint((MAX_ENVELOPE_LEN + 1) as u64, &mut buffer);
        buffer.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            Envelope::decode(&buffer),
            Err(CodecError::EnvelopeTooLarge)
        ));
    }

    #[test]
    fn wake_up_response_is_closed() {
        assert_eq!(
            "ACCEPT".parse::<WakeUpResponse>().unwrap(),
            WakeUpResponse::Accept
        );
        assert_eq!(
            "DECLINE".parse::<WakeUpResponse>().unwrap(),
            WakeUpResponse::Decline
        );
        assert!("accept".parse::<WakeUpResponse>().is_err());
        assert!("MAYBE".parse::<WakeUpResponse>().is_err());
    }

    #[test]
    fn event_names_roundtrip() {
        for kind in [
            EventKind::Auth,
            EventKind::Connected,
            EventKind::ChallengeRespondAck,
            EventKind::SessionReady,
            EventKind::Error,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }
}
