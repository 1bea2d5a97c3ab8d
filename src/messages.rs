//! # Wire Protocol Messages
//!
//! Every type that crosses a socket: overlay frames exchanged between nodes
//! and the requests/responses of the loopback control channel.
//!
//! ## Framing
//!
//! | Channel | Frame | Encoding |
//! |---------|-------|----------|
//! | Overlay (UDP) | `SGOV` magic + [`OverlayMessage`] | bincode, fixint, bounded |
//! | Control (UDP, loopback) | [`ControlRequest`] / [`ControlResponse`] | bincode, fixint, bounded |
//!
//! ## Security Limits
//!
//! - `MAX_FRAME_SIZE`: largest datagram accepted on either channel
//! - `MAX_PAYLOAD_SIZE`: largest tunnelled payload
//! - All decoding goes through [`deserialize_bounded`]

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::Identity;

/// Prefix of every overlay datagram.
pub const OVERLAY_MAGIC: [u8; 4] = *b"SGOV";

/// Largest datagram accepted on the overlay or control socket.
pub const MAX_FRAME_SIZE: usize = 65_507;

/// Largest payload carried in a single `Data`/`DataBack` frame.
pub const MAX_PAYLOAD_SIZE: usize = 60 * 1024;

/// Peer addresses exchanged per `Peers` frame.
pub const MAX_PEERS_PER_EXCHANGE: usize = 16;

/// Longest domain name carried in an [`Endpoint`].
pub const MAX_DOMAIN_LEN: usize = 255;

pub type CircuitId = u32;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Endpoints
// ============================================================================

/// Ultimate destination of tunnelled traffic, as the SOCKS5 client named it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Endpoint {
    Ip(SocketAddr),
    Domain { host: String, port: u16 },
}

impl Endpoint {
    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Ip(addr) => addr.port(),
            Endpoint::Domain { port, .. } => *port,
        }
    }

    /// Host part as text, for route keys and logs.
    pub fn host(&self) -> String {
        match self {
            Endpoint::Ip(addr) => addr.ip().to_string(),
            Endpoint::Domain { host, .. } => host.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{addr}"),
            Endpoint::Domain { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Ip(addr)
    }
}

// ============================================================================
// Overlay frames
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OverlayMessage {
    /// Ask the receiver to become the next hop of a new circuit.
    Create { cid: CircuitId, nonce: u64 },
    Created { cid: CircuitId, nonce_ack: u64 },
    /// Ask the current end of the circuit to extend it to `next_hop`.
    Extend { cid: CircuitId, next_hop: SocketAddr },
    Extended { cid: CircuitId },
    /// Towards the exit. Only the exit reads `destination`.
    Data {
        cid: CircuitId,
        seq: u64,
        destination: Endpoint,
        payload: Vec<u8>,
    },
    /// Towards the originator.
    DataBack {
        cid: CircuitId,
        seq: u64,
        origin: Endpoint,
        payload: Vec<u8>,
    },
    Ping { cid: CircuitId, nonce: u64 },
    Pong { cid: CircuitId, nonce: u64 },
    /// Best-effort teardown, forwarded hop by hop.
    Destroy { cid: CircuitId },
    Hello {
        identity: Identity,
        exit_capable: bool,
        load: u32,
    },
    Peers { addrs: Vec<SocketAddr> },
    Stats {
        relays: u32,
        circuits: u32,
        bytes_relayed: u64,
    },
}

impl OverlayMessage {
    pub fn circuit_id(&self) -> Option<CircuitId> {
        match self {
            OverlayMessage::Create { cid, .. }
            | OverlayMessage::Created { cid, .. }
            | OverlayMessage::Extend { cid, .. }
            | OverlayMessage::Extended { cid }
            | OverlayMessage::Data { cid, .. }
            | OverlayMessage::DataBack { cid, .. }
            | OverlayMessage::Ping { cid, .. }
            | OverlayMessage::Pong { cid, .. }
            | OverlayMessage::Destroy { cid } => Some(*cid),
            OverlayMessage::Hello { .. }
            | OverlayMessage::Peers { .. }
            | OverlayMessage::Stats { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OverlayMessage::Create { .. } => "create",
            OverlayMessage::Created { .. } => "created",
            OverlayMessage::Extend { .. } => "extend",
            OverlayMessage::Extended { .. } => "extended",
            OverlayMessage::Data { .. } => "data",
            OverlayMessage::DataBack { .. } => "data_back",
            OverlayMessage::Ping { .. } => "ping",
            OverlayMessage::Pong { .. } => "pong",
            OverlayMessage::Destroy { .. } => "destroy",
            OverlayMessage::Hello { .. } => "hello",
            OverlayMessage::Peers { .. } => "peers",
            OverlayMessage::Stats { .. } => "stats",
        }
    }
}

#[derive(Debug)]
pub enum FrameError {
    TooShort,
    BadMagic,
    Malformed(bincode::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooShort => write!(f, "frame shorter than magic"),
            FrameError::BadMagic => write!(f, "bad frame magic"),
            FrameError::Malformed(e) => write!(f, "malformed frame: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

pub fn encode_frame(message: &OverlayMessage) -> Result<Vec<u8>, bincode::Error> {
    let body = serialize_bounded(message)?;
    let mut frame = Vec::with_capacity(OVERLAY_MAGIC.len() + body.len());
    frame.extend_from_slice(&OVERLAY_MAGIC);
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_frame(bytes: &[u8]) -> Result<OverlayMessage, FrameError> {
    if bytes.len() < OVERLAY_MAGIC.len() {
        return Err(FrameError::TooShort);
    }
    let (magic, body) = bytes.split_at(OVERLAY_MAGIC.len());
    if magic != OVERLAY_MAGIC {
        return Err(FrameError::BadMagic);
    }
    deserialize_bounded(body).map_err(FrameError::Malformed)
}

// ============================================================================
// Control channel
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    Building,
    Ready,
    Broken,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Building => "building",
            CircuitState::Ready => "ready",
            CircuitState::Broken => "broken",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitInfo {
    pub circuit_id: CircuitId,
    pub hops: Vec<SocketAddr>,
    pub target_length: usize,
    pub state: CircuitState,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Counters reported by the `Stats` control request and periodic telemetry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayStats {
    pub bytes_exit: u64,
    pub bytes_enter: u64,
    pub bytes_relayed: u64,
    pub active_circuits: u64,
    pub relay_rules: u64,
    pub drops_unknown_route: u64,
    pub drops_no_socket: u64,
    pub drops_reordered: u64,
    pub protocol_errors: u64,
    pub refused_creates: u64,
    pub known_peers: u64,
}

impl OverlayStats {
    pub fn counters(&self) -> BTreeMap<&'static str, u64> {
        BTreeMap::from([
            ("bytes_exit", self.bytes_exit),
            ("bytes_enter", self.bytes_enter),
            ("bytes_relayed", self.bytes_relayed),
            ("active_circuits", self.active_circuits),
            ("relay_rules", self.relay_rules),
            ("drops_unknown_route", self.drops_unknown_route),
            ("drops_no_socket", self.drops_no_socket),
            ("drops_reordered", self.drops_reordered),
            ("protocol_errors", self.protocol_errors),
            ("refused_creates", self.refused_creates),
            ("known_peers", self.known_peers),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ControlRequest {
    IsOnline,
    ListCircuits,
    CreateCircuit { first_hop: SocketAddr },
    Start,
    Stop,
    Stats,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ControlResponse {
    Online { online: bool },
    Circuits { circuits: Vec<CircuitInfo> },
    CircuitCreated { circuit_id: CircuitId },
    Ack { ok: bool },
    Stats { identity: Identity, stats: OverlayStats },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity::from_bytes([7u8; 32])
    }

    #[test]
    fn frames_carry_magic() {
        let frame = encode_frame(&OverlayMessage::Extended { cid: 9 }).unwrap();
        assert_eq!(&frame[..4], b"SGOV");
        assert_eq!(decode_frame(&frame).unwrap(), OverlayMessage::Extended { cid: 9 });
    }

    #[test]
    fn data_frame_roundtrip_keeps_destination() {
        let msg = OverlayMessage::Data {
            cid: 42,
            seq: 3,
            destination: Endpoint::Domain {
                host: "example.org".into(),
                port: 53,
            },
            payload: b"query".to_vec(),
        };
        let decoded = decode_frame(&encode_frame(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.circuit_id(), Some(42));
        assert_eq!(decoded.kind(), "data");
    }

    #[test]
    fn decode_rejects_foreign_datagrams() {
        assert!(matches!(decode_frame(b"SG"), Err(FrameError::TooShort)));
        assert!(matches!(decode_frame(b"XXXX\0\0\0\0"), Err(FrameError::BadMagic)));
        assert!(matches!(
            decode_frame(b"SGOV\xff\xff\xff\xff"),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_length_prefix_is_bounded() {
        // variant 10 (Peers) followed by a vec length of u64::MAX
        let mut frame = OVERLAY_MAGIC.to_vec();
        frame.extend_from_slice(&10u32.to_le_bytes());
        frame.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(decode_frame(&frame), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn gossip_frames_have_no_circuit() {
        let hello = OverlayMessage::Hello {
            identity: identity(),
            exit_capable: true,
            load: 2,
        };
        assert_eq!(hello.circuit_id(), None);
        assert_eq!(decode_frame(&encode_frame(&hello).unwrap()).unwrap(), hello);
    }

    #[test]
    fn control_messages_roundtrip() {
        let req = ControlRequest::CreateCircuit {
            first_hop: "127.0.0.1:7000".parse().unwrap(),
        };
        let bytes = serialize_bounded(&req).unwrap();
        assert_eq!(deserialize_bounded::<ControlRequest>(&bytes).unwrap(), req);

        let resp = ControlResponse::Stats {
            identity: identity(),
            stats: OverlayStats {
                relay_rules: 4,
                ..Default::default()
            },
        };
        let bytes = serialize_bounded(&resp).unwrap();
        assert_eq!(deserialize_bounded::<ControlResponse>(&bytes).unwrap(), resp);
    }

    #[test]
    fn stats_counters_are_complete() {
        let counters = OverlayStats::default().counters();
        assert_eq!(counters.len(), 11);
        assert_eq!(counters["drops_unknown_route"], 0);
    }

    #[test]
    fn endpoint_display_and_parts() {
        let ip = Endpoint::Ip("1.2.3.4:53".parse().unwrap());
        assert_eq!(ip.to_string(), "1.2.3.4:53");
        assert_eq!(ip.host(), "1.2.3.4");
        let dom = Endpoint::Domain {
            host: "a.b".into(),
            port: 80,
        };
        assert_eq!(dom.to_string(), "a.b:80");
        assert_eq!(dom.port(), 80);
    }
}
