//! Constants and framing for the wire protocol.
//!
//! Every message travels as a ZeroMQ multipart. The ROUTER form carries six
//! frames `[peer_routing_id, EMPTY, VERSION, correlation_id, KIND, PAYLOAD]`;
//! the REQ form omits the envelope and carries four. A two-frame message is
//! a connect-probe emitted by `PROBE_ROUTER` and carries no payload worth
//! keeping.

use thiserror::Error;
use uuid::Uuid;

/// Protocol version tag carried in every message.
pub const VERSION: &[u8] = b"v1";
/// Empty delimiter frame separating the ROUTER envelope from the body.
pub const EMPTY_DELIMITER: &[u8] = b"";
/// Length of a correlation id in bytes.
pub const CORRELATION_ID_LEN: usize = 16;
/// Frame count of a ROUTER-style message.
pub const ROUTER_FRAMES: usize = 6;
/// Frame count of a REQ-style message.
pub const REQ_FRAMES: usize = 4;
/// Frame count of a connect-probe.
pub const PROBE_FRAMES: usize = 2;

/// Single-byte tag classifying a message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Successful reply carrying a result value.
    Ok = 0x01,
    /// Credential presentation from an initiator.
    Hello = 0x02,
    /// A named call request.
    Work = 0x03,
    /// Handshake acknowledgement.
    Authenticated = 0x04,
    /// Liveness tick; payload is empty.
    Heartbeat = 0x06,
    /// Failed reply carrying `(kind, message, trace)`.
    Error = 0x10,
    /// Handshake challenge or rejection.
    Unauthorized = 0x11,
}

impl Kind {
    /// Parse a kind byte.
    ///
    /// # Errors
    /// Returns [`ProtocolError::UnknownKind`] for a byte outside the set.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Ok),
            0x02 => Ok(Self::Hello),
            0x03 => Ok(Self::Work),
            0x04 => Ok(Self::Authenticated),
            0x06 => Ok(Self::Heartbeat),
            0x10 => Ok(Self::Error),
            0x11 => Ok(Self::Unauthorized),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }

    /// The wire byte for this kind.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Errors raised while packing or classifying multiparts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// VERSION frame did not match [`VERSION`].
    #[error("protocol version mismatch: got {0:02x?}")]
    VersionMismatch(Vec<u8>),
    /// Frame count matched no known message shape.
    #[error("malformed message: {0} frames")]
    FrameCount(usize),
    /// KIND frame was empty or not a single byte.
    #[error("malformed kind frame")]
    BadKindFrame,
    /// Kind byte outside the defined set.
    #[error("unknown kind byte {0:#04x}")]
    UnknownKind(u8),
}

/// A logical message, parsed from or packed into a multipart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// ROUTER envelope target; `None` for the REQ-style form.
    pub routing_id: Option<Vec<u8>>,
    /// Sixteen random bytes correlating request and reply.
    pub correlation_id: Vec<u8>,
    /// Message classification.
    pub kind: Kind,
    /// Codec-encoded body; empty for HEARTBEAT.
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message with a fresh random correlation id.
    #[must_use]
    pub fn new(routing_id: Option<Vec<u8>>, kind: Kind, payload: Vec<u8>) -> Self {
        Self {
            routing_id,
            correlation_id: Uuid::new_v4().as_bytes().to_vec(),
            kind,
            payload,
        }
    }

    /// Build a reply reusing the correlation id of the request.
    #[must_use]
    pub fn reply(
        routing_id: Vec<u8>,
        correlation_id: Vec<u8>,
        kind: Kind,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            routing_id: Some(routing_id),
            correlation_id,
            kind,
            payload,
        }
    }

    /// Serialize into wire frames, ROUTER-style when a routing id is set.
    #[must_use = "use the serialized frames"]
    pub fn into_frames(self) -> Vec<Vec<u8>> {
        let mut frames = Vec::with_capacity(ROUTER_FRAMES);
        if let Some(routing_id) = self.routing_id {
            frames.push(routing_id);
            frames.push(EMPTY_DELIMITER.to_vec());
        }
        frames.push(VERSION.to_vec());
        frames.push(self.correlation_id);
        frames.push(vec![self.kind.to_u8()]);
        frames.push(self.payload);
        frames
    }
}

/// Result of classifying an inbound multipart.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Connect-probe; only the sender's routing id is interesting.
    Probe {
        /// Transport identity the probe arrived under.
        routing_id: Vec<u8>,
    },
    /// A well-formed protocol message.
    Message(Message),
}

fn read_kind(frame: &[u8]) -> Result<Kind, ProtocolError> {
    match frame {
        [byte] => Kind::from_u8(*byte),
        _ => Err(ProtocolError::BadKindFrame),
    }
}

fn check_version(frame: &[u8]) -> Result<(), ProtocolError> {
    if frame == VERSION {
        Ok(())
    } else {
        Err(ProtocolError::VersionMismatch(frame.to_vec()))
    }
}

/// Classify an inbound multipart into a probe or a [`Message`].
///
/// # Errors
/// Returns a [`ProtocolError`] for an unexpected frame count, a version
/// mismatch, or an unknown kind byte. Callers log and drop such frames.
#[must_use = "handle the result"]
pub fn classify(mut frames: Vec<Vec<u8>>) -> Result<Inbound, ProtocolError> {
    match frames.len() {
        PROBE_FRAMES => {
            let routing_id = frames.swap_remove(0);
            Ok(Inbound::Probe { routing_id })
        }
        REQ_FRAMES => {
            let payload = frames.pop().unwrap_or_default();
            let kind = read_kind(&frames.pop().unwrap_or_default())?;
            let correlation_id = frames.pop().unwrap_or_default();
            check_version(&frames.pop().unwrap_or_default())?;
            Ok(Inbound::Message(Message {
                routing_id: None,
                correlation_id,
                kind,
                payload,
            }))
        }
        ROUTER_FRAMES => {
            let payload = frames.pop().unwrap_or_default();
            let kind = read_kind(&frames.pop().unwrap_or_default())?;
            let correlation_id = frames.pop().unwrap_or_default();
            check_version(&frames.pop().unwrap_or_default())?;
            // frames now holds [routing_id, delimiter]
            let routing_id = frames.swap_remove(0);
            Ok(Inbound::Message(Message {
                routing_id: Some(routing_id),
                correlation_id,
                kind,
                payload,
            }))
        }
        other => Err(ProtocolError::FrameCount(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bytes_match_the_wire() {
        assert_eq!(Kind::Ok.to_u8(), 0x01);
        assert_eq!(Kind::Hello.to_u8(), 0x02);
        assert_eq!(Kind::Work.to_u8(), 0x03);
        assert_eq!(Kind::Authenticated.to_u8(), 0x04);
        assert_eq!(Kind::Heartbeat.to_u8(), 0x06);
        assert_eq!(Kind::Error.to_u8(), 0x10);
        assert_eq!(Kind::Unauthorized.to_u8(), 0x11);
        assert_eq!(Kind::from_u8(0x03).unwrap(), Kind::Work);
        assert!(matches!(
            Kind::from_u8(0x7f),
            Err(ProtocolError::UnknownKind(0x7f))
        ));
    }

    #[test]
    fn router_frames_round_trip() {
        let msg = Message::new(Some(b"server".to_vec()), Kind::Work, b"body".to_vec());
        let cid = msg.correlation_id.clone();
        assert_eq!(cid.len(), CORRELATION_ID_LEN);

        let frames = msg.clone().into_frames();
        assert_eq!(frames.len(), ROUTER_FRAMES);
        assert_eq!(frames[0], b"server");
        assert_eq!(frames[1], EMPTY_DELIMITER);
        assert_eq!(frames[2], VERSION);

        let Inbound::Message(parsed) = classify(frames).unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(parsed, msg);
    }

    #[test]
    fn req_frames_round_trip() {
        let msg = Message::new(None, Kind::Ok, b"value".to_vec());
        let frames = msg.clone().into_frames();
        assert_eq!(frames.len(), REQ_FRAMES);
        let Inbound::Message(parsed) = classify(frames).unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(parsed, msg);
    }

    #[test]
    fn probe_is_classified_by_length() {
        let frames = vec![b"peer".to_vec(), Vec::new()];
        assert_eq!(
            classify(frames).unwrap(),
            Inbound::Probe {
                routing_id: b"peer".to_vec()
            }
        );
    }

    #[test]
    fn version_mismatch_is_fatal_for_the_frame() {
        let mut frames = Message::new(None, Kind::Ok, Vec::new()).into_frames();
        frames[0] = b"v2".to_vec();
        assert!(matches!(
            classify(frames),
            Err(ProtocolError::VersionMismatch(_))
        ));
    }

    #[test]
    fn unexpected_frame_counts_are_rejected() {
        for count in [0usize, 1, 3, 5, 7] {
            let frames = vec![Vec::new(); count];
            assert_eq!(
                classify(frames),
                Err(ProtocolError::FrameCount(count)),
                "count {count}"
            );
        }
    }
}
