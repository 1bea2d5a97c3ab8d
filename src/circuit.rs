//! # Onion-Routed Circuits
//!
//! Sans-IO state machine for one overlay node. [`OverlayNode`] consumes
//! decoded frames and timer ticks and queues [`Output`]s (frames to send,
//! exit traffic, events) that the overlay actor executes. The same node plays
//! every role at once:
//!
//! | Role | State | Keyed by |
//! |------|-------|----------|
//! | Originator | [`Circuit`] | circuit id |
//! | Relay | [`RelayRule`] pairs | `(cid, peer)` of the incoming link |
//! | End / exit | [`CircuitEnd`] | `(cid, previous hop)` |
//!
//! ## Construction
//!
//! ```text
//! O --CREATE(c1)--> A                          O: building, 0 hops
//! O <--CREATED----- A                          O: building, 1 hop
//! O --EXTEND(c1,B)-> A --CREATE(c2)--> B       A: pending
//!                    A <--CREATED----- B       A: installs (c1,O)<->(c2,B)
//! O <--EXTENDED---- A                          O: building, 2 hops
//! ```
//!
//! A circuit becomes `Ready` only once it has `circuit_length` hops, and is
//! dropped (never kept half-built) when a step exceeds `extend_timeout`.
//!
//! ## Data
//!
//! `Data` frames travel towards the end, `DataBack` towards the originator.
//! Every hop restamps a per-link sequence number and drops frames that arrive
//! out of order, so a circuit never reorders.
//!
//! ## Liveness
//!
//! Ready circuits are pinged every `ping_interval`; no answer for three
//! intervals breaks the circuit. Relay pairs and ends idle for
//! `relay_idle_timeout` are expired. Peers silent for `peer_timeout` are
//! forgotten unless they came from the bootstrap list.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::identity::Identity;
use crate::messages::{
    CircuitId, CircuitInfo, CircuitState, Endpoint, MAX_PAYLOAD_SIZE, MAX_PEERS_PER_EXCHANGE,
    OverlayMessage, OverlayStats,
};

// ============================================================================
// Constants & configuration
// ============================================================================

pub const DEFAULT_CIRCUIT_LENGTH: usize = 3;
pub const DEFAULT_TARGET_CIRCUITS: usize = 2;
pub const DEFAULT_EXTEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_RELAY_RULES: usize = 2048;
pub const DEFAULT_MAX_KNOWN_PEERS: usize = 512;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Missed pings before a circuit is declared broken.
pub const PING_TOLERANCE: u32 = 3;

/// Peers gossiped to per round.
pub const GOSSIP_FANOUT: usize = 3;

/// Window over which relay bandwidth is measured for admission.
const RELAY_RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub circuit_length: usize,
    pub target_circuits: usize,
    /// Accept traffic for the Internet as a circuit end.
    pub exit_capable: bool,
    pub bootstrap: Vec<SocketAddr>,
    pub extend_timeout: Duration,
    pub ping_interval: Duration,
    pub relay_idle_timeout: Duration,
    pub peer_timeout: Duration,
    pub gossip_interval: Duration,
    /// Refuse new circuits once this many relay rules and ends exist.
    pub max_relay_rules: usize,
    /// Relay bandwidth share in KiB/s above which new circuits are refused.
    /// Zero means no limit.
    pub relay_share: f64,
    pub max_known_peers: usize,
    /// How often the overlay actor runs [`OverlayNode::tick`].
    pub tick_interval: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            circuit_length: DEFAULT_CIRCUIT_LENGTH,
            target_circuits: DEFAULT_TARGET_CIRCUITS,
            exit_capable: false,
            bootstrap: Vec::new(),
            extend_timeout: DEFAULT_EXTEND_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            relay_idle_timeout: DEFAULT_RELAY_IDLE_TIMEOUT,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            max_relay_rules: DEFAULT_MAX_RELAY_RULES,
            relay_share: 0.0,
            max_known_peers: DEFAULT_MAX_KNOWN_PEERS,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// A link between two adjacent nodes: circuit id on that link plus the peer.
pub type LinkKey = (CircuitId, SocketAddr);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitError {
    NotEnoughPeers,
    NoReadyCircuit,
    UnknownCircuit(CircuitId),
    ExtendTimeout,
    PingTimeout,
    Destroyed,
    Stopped,
    PayloadTooLarge(usize),
}

impl fmt::Display for CircuitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::NotEnoughPeers => write!(f, "not enough suitable peers"),
            CircuitError::NoReadyCircuit => write!(f, "no ready circuit"),
            CircuitError::UnknownCircuit(cid) => write!(f, "unknown circuit {cid}"),
            CircuitError::ExtendTimeout => write!(f, "extend timed out"),
            CircuitError::PingTimeout => write!(f, "ping timed out"),
            CircuitError::Destroyed => write!(f, "destroyed by peer"),
            CircuitError::Stopped => write!(f, "stopped locally"),
            CircuitError::PayloadTooLarge(n) => {
                write!(f, "payload of {n} bytes exceeds {MAX_PAYLOAD_SIZE}")
            }
        }
    }
}

impl std::error::Error for CircuitError {}

/// Work for the overlay actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Send { to: SocketAddr, message: OverlayMessage },
    /// As exit: send `payload` to `destination` from the socket of `key`.
    ExitSend {
        key: LinkKey,
        destination: Endpoint,
        payload: Vec<u8>,
    },
    /// The exit socket of `key` is no longer needed.
    ExitClose { key: LinkKey },
    /// Return traffic for the local gateway.
    Deliver {
        circuit: CircuitId,
        origin: Endpoint,
        payload: Vec<u8>,
    },
    CircuitReady { circuit: CircuitId },
    CircuitBroken { circuit: CircuitId, reason: CircuitError },
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone)]
struct PeerInfo {
    identity: Option<Identity>,
    exit_capable: bool,
    load: u32,
    relays: u32,
    last_seen: Instant,
}

impl PeerInfo {
    fn unconfirmed(now: Instant) -> Self {
        Self {
            identity: None,
            exit_capable: false,
            load: 0,
            relays: 0,
            last_seen: now,
        }
    }

    fn effective_load(&self) -> u32 {
        self.load.max(self.relays)
    }
}

/// Circuit built by this node.
#[derive(Debug, Clone)]
pub struct Circuit {
    id: CircuitId,
    path: Vec<SocketAddr>,
    hops: Vec<SocketAddr>,
    state: CircuitState,
    nonce: u64,
    step_started: Instant,
    last_seen: Instant,
    last_ping: Instant,
    ping_nonce: u64,
    next_seq: u64,
    last_back_seq: u64,
    bytes_up: u64,
    bytes_down: u64,
}

impl Circuit {
    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn hops(&self) -> &[SocketAddr] {
        &self.hops
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn target_length(&self) -> usize {
        self.path.len()
    }

    pub fn first_hop(&self) -> SocketAddr {
        self.path[0]
    }

    pub fn info(&self) -> CircuitInfo {
        CircuitInfo {
            circuit_id: self.id,
            hops: self.hops.clone(),
            target_length: self.path.len(),
            state: self.state,
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
        }
    }
}

/// Half-duplex forwarding entry. Installed in pairs.
#[derive(Debug, Clone)]
pub struct RelayRule {
    out: LinkKey,
    bytes: u64,
    last_activity: Instant,
    last_seq_in: u64,
    next_seq_out: u64,
}

impl RelayRule {
    fn new(out: LinkKey, now: Instant) -> Self {
        Self {
            out,
            bytes: 0,
            last_activity: now,
            last_seq_in: 0,
            next_seq_out: 0,
        }
    }

    pub fn out(&self) -> LinkKey {
        self.out
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// This node is the current last hop of someone else's circuit.
#[derive(Debug, Clone)]
pub struct CircuitEnd {
    last_activity: Instant,
    pending_extend: Option<LinkKey>,
    last_seq: u64,
    next_back_seq: u64,
}

#[derive(Debug, Clone)]
struct PendingCreate {
    upstream: LinkKey,
    nonce: u64,
    started: Instant,
}

// ============================================================================
// OverlayNode
// ============================================================================

#[derive(Debug)]
pub struct OverlayNode {
    config: OverlayConfig,
    identity: Identity,
    local_addr: SocketAddr,
    self_addrs: HashSet<SocketAddr>,
    peers: LruCache<SocketAddr, PeerInfo>,
    bootstrap: HashSet<SocketAddr>,
    circuits: BTreeMap<CircuitId, Circuit>,
    pins: HashMap<Endpoint, CircuitId>,
    relays: HashMap<LinkKey, RelayRule>,
    ends: HashMap<LinkKey, CircuitEnd>,
    pending_creates: HashMap<LinkKey, PendingCreate>,
    counters: OverlayStats,
    relay_window: (Instant, u64),
    relay_rate: f64,
    last_gossip: Option<Instant>,
    enabled: bool,
    outputs: Vec<Output>,
}

impl OverlayNode {
    pub fn new(config: OverlayConfig, identity: Identity, local_addr: SocketAddr, now: Instant) -> Self {
        let cap = NonZeroUsize::new(config.max_known_peers.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        let mut peers = LruCache::new(cap);
        let bootstrap: HashSet<SocketAddr> = config
            .bootstrap
            .iter()
            .copied()
            .filter(|a| *a != local_addr)
            .collect();
        for addr in &bootstrap {
            peers.put(*addr, PeerInfo::unconfirmed(now));
        }
        Self {
            config,
            identity,
            local_addr,
            self_addrs: HashSet::from([local_addr]),
            peers,
            bootstrap,
            circuits: BTreeMap::new(),
            pins: HashMap::new(),
            relays: HashMap::new(),
            ends: HashMap::new(),
            pending_creates: HashMap::new(),
            counters: OverlayStats::default(),
            relay_window: (now, 0),
            relay_rate: 0.0,
            last_gossip: None,
            enabled: true,
            outputs: Vec::new(),
        }
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the work queued since the last call.
    pub fn drain_outputs(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outputs)
    }

    fn send(&mut self, to: SocketAddr, message: OverlayMessage) {
        self.outputs.push(Output::Send { to, message });
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Pool maintenance builds circuits only while enabled.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn circuit(&self, cid: CircuitId) -> Option<&Circuit> {
        self.circuits.get(&cid)
    }

    pub fn circuits(&self) -> impl Iterator<Item = &Circuit> {
        self.circuits.values()
    }

    pub fn circuit_infos(&self) -> Vec<CircuitInfo> {
        self.circuits.values().map(Circuit::info).collect()
    }

    pub fn ready_count(&self) -> usize {
        self.circuits
            .values()
            .filter(|c| c.state == CircuitState::Ready)
            .count()
    }

    pub fn is_online(&self) -> bool {
        self.ready_count() > 0
    }

    pub fn relay_rules(&self) -> impl Iterator<Item = (&LinkKey, &RelayRule)> {
        self.relays.iter()
    }

    pub fn relay_rule_count(&self) -> usize {
        self.relays.len()
    }

    pub fn end_count(&self) -> usize {
        self.ends.len()
    }

    pub fn known_peers(&self) -> Vec<SocketAddr> {
        self.peers.iter().map(|(a, _)| *a).collect()
    }

    pub fn stats(&self) -> OverlayStats {
        OverlayStats {
            active_circuits: self.ready_count() as u64,
            relay_rules: self.relays.len() as u64,
            known_peers: self.peers.len() as u64,
            ..self.counters.clone()
        }
    }

    /// Count a frame that failed to decode.
    pub fn record_protocol_error(&mut self) {
        self.counters.protocol_errors += 1;
    }

    fn load(&self) -> u32 {
        (self.relays.len() / 2 + self.ends.len()) as u32
    }

    // ------------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------------

    pub fn add_peer(&mut self, now: Instant, addr: SocketAddr) {
        if self.self_addrs.contains(&addr) {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.last_seen = now;
        } else {
            trace!(peer = %addr, "learned peer");
            self.peers.put(addr, PeerInfo::unconfirmed(now));
        }
    }

    fn on_hello(&mut self, now: Instant, from: SocketAddr, identity: Identity, exit_capable: bool, load: u32) {
        if identity == self.identity {
            self.self_addrs.insert(from);
            self.peers.pop(&from);
            return;
        }
        let first_contact = self
            .peers
            .peek(&from)
            .is_none_or(|p| p.identity.is_none());
        if !self.peers.contains(&from) {
            self.peers.put(from, PeerInfo::unconfirmed(now));
        }
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.identity = Some(identity);
            peer.exit_capable = exit_capable;
            peer.load = load;
            peer.last_seen = now;
        }
        if first_contact {
            debug!(peer = %from, identity = %identity.short(), exit_capable, "peer confirmed");
            let hello = self.hello();
            self.send(from, hello);
        }
    }

    fn hello(&self) -> OverlayMessage {
        OverlayMessage::Hello {
            identity: self.identity,
            exit_capable: self.config.exit_capable,
            load: self.load(),
        }
    }

    fn live_peers(&self, now: Instant) -> Vec<(SocketAddr, PeerInfo)> {
        self.peers
            .iter()
            .filter(|(_, p)| {
                p.identity.is_some() && now.saturating_duration_since(p.last_seen) <= self.config.peer_timeout
            })
            .map(|(a, p)| (*a, p.clone()))
            .collect()
    }

    fn gossip(&mut self, now: Instant) {
        let mut rng = rand::thread_rng();
        let mut all: Vec<SocketAddr> = self.known_peers();
        all.shuffle(&mut rng);
        let targets: Vec<SocketAddr> = all.iter().copied().take(GOSSIP_FANOUT).collect();
        let stats = OverlayMessage::Stats {
            relays: (self.relays.len() / 2) as u32,
            circuits: self.ready_count() as u32,
            bytes_relayed: self.counters.bytes_relayed,
        };
        for to in targets {
            let addrs: Vec<SocketAddr> = self
                .live_peers(now)
                .into_iter()
                .map(|(a, _)| a)
                .filter(|a| *a != to)
                .take(MAX_PEERS_PER_EXCHANGE)
                .collect();
            let hello = self.hello();
            self.send(to, hello);
            self.send(to, OverlayMessage::Peers { addrs });
            self.send(to, stats.clone());
        }
        self.last_gossip = Some(now);
    }

    fn expire_peers(&mut self, now: Instant) {
        let stale: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(a, p)| {
                !self.bootstrap.contains(a)
                    && now.saturating_duration_since(p.last_seen) > self.config.peer_timeout
            })
            .map(|(a, _)| *a)
            .collect();
        for addr in stale {
            debug!(peer = %addr, "peer timed out");
            self.peers.pop(&addr);
        }
    }

    // ------------------------------------------------------------------------
    // Originator
    // ------------------------------------------------------------------------

    fn link_in_use(&self, key: LinkKey) -> bool {
        self.relays.contains_key(&key)
            || self.ends.contains_key(&key)
            || self.pending_creates.contains_key(&key)
            || self
                .circuits
                .get(&key.0)
                .is_some_and(|c| c.first_hop() == key.1)
    }

    fn fresh_cid(&self, peer: SocketAddr) -> CircuitId {
        loop {
            let cid: CircuitId = rand::random();
            if cid != 0 && !self.circuits.contains_key(&cid) && !self.link_in_use((cid, peer)) {
                return cid;
            }
        }
    }

    fn pick(candidates: &[(SocketAddr, PeerInfo)]) -> Option<SocketAddr> {
        let min = candidates.iter().map(|(_, p)| p.effective_load()).min()?;
        let best: Vec<SocketAddr> = candidates
            .iter()
            .filter(|(_, p)| p.effective_load() == min)
            .map(|(a, _)| *a)
            .collect();
        best.choose(&mut rand::thread_rng()).copied()
    }

    fn plan_path(&self, now: Instant, first_hop: Option<SocketAddr>) -> Result<Vec<SocketAddr>, CircuitError> {
        let length = self.config.circuit_length.max(1);
        let live = self.live_peers(now);
        let mut path: Vec<SocketAddr> = first_hop.into_iter().collect();
        if path.len() == length {
            return Ok(path);
        }

        let exits: Vec<_> = live
            .iter()
            .filter(|(a, p)| p.exit_capable && !path.contains(a))
            .cloned()
            .collect();
        let exit = Self::pick(&exits).ok_or(CircuitError::NotEnoughPeers)?;
        while path.len() < length - 1 {
            let middles: Vec<_> = live
                .iter()
                .filter(|(a, _)| !path.contains(a) && *a != exit)
                .cloned()
                .collect();
            path.push(Self::pick(&middles).ok_or(CircuitError::NotEnoughPeers)?);
        }
        path.push(exit);
        Ok(path)
    }

    /// Start building a circuit, through `first_hop` if given.
    pub fn build_circuit(&mut self, now: Instant, first_hop: Option<SocketAddr>) -> Result<CircuitId, CircuitError> {
        let path = self.plan_path(now, first_hop)?;
        let cid = self.fresh_cid(path[0]);
        let nonce: u64 = rand::random();
        let first = path[0];
        debug!(circuit = cid, first_hop = %first, length = path.len(), "building circuit");
        self.circuits.insert(
            cid,
            Circuit {
                id: cid,
                path,
                hops: Vec::new(),
                state: CircuitState::Building,
                nonce,
                step_started: now,
                last_seen: now,
                last_ping: now,
                ping_nonce: 0,
                next_seq: 0,
                last_back_seq: 0,
                bytes_up: 0,
                bytes_down: 0,
            },
        );
        self.send(first, OverlayMessage::Create { cid, nonce });
        Ok(cid)
    }

    /// Confirmed another hop: finish or extend further.
    fn advance(&mut self, now: Instant, cid: CircuitId) {
        let Some(circuit) = self.circuits.get_mut(&cid) else {
            return;
        };
        circuit.step_started = now;
        circuit.last_seen = now;
        if circuit.hops.len() == circuit.path.len() {
            circuit.state = CircuitState::Ready;
            circuit.last_ping = now;
            info!(circuit = cid, hops = circuit.hops.len(), "circuit ready");
            self.outputs.push(Output::CircuitReady { circuit: cid });
        } else {
            let next_hop = circuit.path[circuit.hops.len()];
            let first = circuit.first_hop();
            trace!(circuit = cid, next_hop = %next_hop, "extending circuit");
            self.send(first, OverlayMessage::Extend { cid, next_hop });
        }
    }

    fn originated(&self, cid: CircuitId, from: SocketAddr) -> bool {
        self.circuits.get(&cid).is_some_and(|c| c.first_hop() == from)
    }

    /// Drop one of our circuits, telling the first hop when asked to.
    pub fn break_circuit(&mut self, cid: CircuitId, reason: CircuitError, notify: bool) {
        let Some(circuit) = self.circuits.remove(&cid) else {
            return;
        };
        if notify {
            self.send(circuit.first_hop(), OverlayMessage::Destroy { cid });
        }
        self.pins.retain(|_, c| *c != cid);
        info!(circuit = cid, state = circuit.state.as_str(), reason = %reason, "circuit broken");
        self.outputs.push(Output::CircuitBroken { circuit: cid, reason });
    }

    /// Tear down every circuit we built and stop building new ones.
    pub fn stop_all(&mut self) {
        self.enabled = false;
        let ids: Vec<CircuitId> = self.circuits.keys().copied().collect();
        for cid in ids {
            self.break_circuit(cid, CircuitError::Stopped, true);
        }
    }

    /// Send `payload` to `destination` through a ready circuit. A destination
    /// sticks to the circuit first used for it while that circuit lives.
    pub fn send_data(
        &mut self,
        destination: Endpoint,
        payload: Vec<u8>,
    ) -> Result<CircuitId, CircuitError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CircuitError::PayloadTooLarge(payload.len()));
        }
        let pinned = self
            .pins
            .get(&destination)
            .copied()
            .filter(|cid| self.circuits.get(cid).is_some_and(|c| c.state == CircuitState::Ready));
        let cid = match pinned {
            Some(cid) => cid,
            None => {
                let cid = self
                    .circuits
                    .values()
                    .filter(|c| c.state == CircuitState::Ready)
                    .min_by_key(|c| c.bytes_up)
                    .map(|c| c.id)
                    .ok_or(CircuitError::NoReadyCircuit)?;
                self.pins.insert(destination.clone(), cid);
                cid
            }
        };
        let circuit = self
            .circuits
            .get_mut(&cid)
            .ok_or(CircuitError::UnknownCircuit(cid))?;
        circuit.next_seq += 1;
        circuit.bytes_up += payload.len() as u64;
        let seq = circuit.next_seq;
        let first = circuit.first_hop();
        self.counters.bytes_enter += payload.len() as u64;
        self.send(
            first,
            OverlayMessage::Data {
                cid,
                seq,
                destination,
                payload,
            },
        );
        Ok(cid)
    }

    // ------------------------------------------------------------------------
    // Exit
    // ------------------------------------------------------------------------

    /// Bytes came back to the exit socket of `key` from `origin`.
    pub fn exit_return(&mut self, now: Instant, key: LinkKey, origin: Endpoint, payload: Vec<u8>) -> bool {
        let Some(end) = self.ends.get_mut(&key) else {
            return false;
        };
        end.last_activity = now;
        end.next_back_seq += 1;
        let seq = end.next_back_seq;
        self.send(
            key.1,
            OverlayMessage::DataBack {
                cid: key.0,
                seq,
                origin,
                payload,
            },
        );
        true
    }

    fn remove_end(&mut self, key: LinkKey) {
        if let Some(end) = self.ends.remove(&key) {
            if let Some(pending) = end.pending_extend {
                self.pending_creates.remove(&pending);
            }
            self.outputs.push(Output::ExitClose { key });
        }
    }

    // ------------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------------

    pub fn handle_message(&mut self, now: Instant, from: SocketAddr, message: OverlayMessage) {
        self.add_peer(now, from);
        trace!(peer = %from, kind = message.kind(), "overlay frame");

        match message {
            OverlayMessage::Hello { identity, exit_capable, load } => {
                self.on_hello(now, from, identity, exit_capable, load);
            }
            OverlayMessage::Peers { addrs } => {
                for addr in addrs.into_iter().take(MAX_PEERS_PER_EXCHANGE) {
                    if !self.peers.contains(&addr) {
                        self.add_peer(now, addr);
                    }
                }
            }
            OverlayMessage::Stats { relays, .. } => {
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.relays = relays;
                }
            }
            OverlayMessage::Create { cid, nonce } => self.on_create(now, from, cid, nonce),
            OverlayMessage::Created { cid, nonce_ack } => self.on_created(now, from, cid, nonce_ack),
            OverlayMessage::Extend { cid, next_hop } => {
                if !self.forward(now, (cid, from), |out| OverlayMessage::Extend { cid: out, next_hop }) {
                    self.on_extend(now, from, cid, next_hop);
                }
            }
            OverlayMessage::Extended { cid } => {
                if !self.forward(now, (cid, from), |out| OverlayMessage::Extended { cid: out })
                    && self.originated(cid, from)
                    && let Some(circuit) = self.circuits.get_mut(&cid)
                    && circuit.state == CircuitState::Building
                    && !circuit.hops.is_empty()
                {
                    let hop = circuit.path[circuit.hops.len()];
                    circuit.hops.push(hop);
                    self.advance(now, cid);
                }
            }
            OverlayMessage::Data { cid, seq, destination, payload } => {
                self.on_data(now, (cid, from), seq, destination, payload);
            }
            OverlayMessage::DataBack { cid, seq, origin, payload } => {
                self.on_data_back(now, (cid, from), seq, origin, payload);
            }
            OverlayMessage::Ping { cid, nonce } => {
                if !self.forward(now, (cid, from), |out| OverlayMessage::Ping { cid: out, nonce })
                    && let Some(end) = self.ends.get_mut(&(cid, from))
                {
                    end.last_activity = now;
                    self.send(from, OverlayMessage::Pong { cid, nonce });
                }
            }
            OverlayMessage::Pong { cid, nonce } => {
                if !self.forward(now, (cid, from), |out| OverlayMessage::Pong { cid: out, nonce })
                    && self.originated(cid, from)
                    && let Some(circuit) = self.circuits.get_mut(&cid)
                    && circuit.ping_nonce == nonce
                {
                    circuit.last_seen = now;
                }
            }
            OverlayMessage::Destroy { cid } => self.on_destroy((cid, from)),
        }
    }

    /// Forward a control frame along the relay rule of `key`. Returns false
    /// when this node has no rule for it.
    fn forward(&mut self, now: Instant, key: LinkKey, build: impl FnOnce(CircuitId) -> OverlayMessage) -> bool {
        let Some(rule) = self.relays.get_mut(&key) else {
            return false;
        };
        rule.last_activity = now;
        let (out_cid, out_peer) = rule.out;
        self.send(out_peer, build(out_cid));
        true
    }

    fn on_create(&mut self, now: Instant, from: SocketAddr, cid: CircuitId, nonce: u64) {
        if self.link_in_use((cid, from)) {
            trace!(peer = %from, cid, "create on a link already in use");
            return;
        }
        if !self.admits(2) {
            self.counters.refused_creates += 1;
            debug!(peer = %from, cid, rules = self.relays.len(), rate = self.relay_rate, "refusing create");
            return;
        }
        self.ends.insert(
            (cid, from),
            CircuitEnd {
                last_activity: now,
                pending_extend: None,
                last_seq: 0,
                next_back_seq: 0,
            },
        );
        self.send(from, OverlayMessage::Created { cid, nonce_ack: nonce });
    }

    /// Admission control for `extra` more relay entries.
    fn admits(&self, extra: usize) -> bool {
        let used = self.relays.len() + self.ends.len();
        let over_share = self.config.relay_share > 0.0 && self.relay_rate > self.config.relay_share;
        used + extra <= self.config.max_relay_rules && !over_share
    }

    fn on_created(&mut self, now: Instant, from: SocketAddr, cid: CircuitId, nonce_ack: u64) {
        if self.originated(cid, from)
            && let Some(circuit) = self.circuits.get_mut(&cid)
            && circuit.state == CircuitState::Building
            && circuit.hops.is_empty()
        {
            if circuit.nonce != nonce_ack {
                self.counters.protocol_errors += 1;
                return;
            }
            circuit.hops.push(from);
            self.advance(now, cid);
            return;
        }

        let Some(pending) = self.pending_creates.remove(&(cid, from)) else {
            trace!(peer = %from, cid, "created for unknown circuit");
            return;
        };
        if pending.nonce != nonce_ack {
            self.counters.protocol_errors += 1;
            self.send(from, OverlayMessage::Destroy { cid });
            return;
        }
        let upstream = pending.upstream;
        if !self.ends.contains_key(&upstream) {
            self.send(from, OverlayMessage::Destroy { cid });
            return;
        }
        self.ends.remove(&upstream);
        self.outputs.push(Output::ExitClose { key: upstream });

        let downstream = (cid, from);
        self.relays.insert(upstream, RelayRule::new(downstream, now));
        self.relays.insert(downstream, RelayRule::new(upstream, now));
        debug!(
            upstream = %upstream.1,
            downstream = %from,
            in_cid = upstream.0,
            out_cid = cid,
            "relaying circuit"
        );
        self.send(upstream.1, OverlayMessage::Extended { cid: upstream.0 });
    }

    fn on_extend(&mut self, now: Instant, from: SocketAddr, cid: CircuitId, next_hop: SocketAddr) {
        let key = (cid, from);
        let Some(end) = self.ends.get(&key) else {
            trace!(peer = %from, cid, "extend for unknown circuit");
            return;
        };
        if end.pending_extend.is_some() || next_hop == from || self.self_addrs.contains(&next_hop) {
            return;
        }
        // the end entry turns into a relay pair
        if !self.admits(1) {
            self.counters.refused_creates += 1;
            return;
        }
        let out_cid = self.fresh_cid(next_hop);
        let nonce: u64 = rand::random();
        if let Some(end) = self.ends.get_mut(&key) {
            end.pending_extend = Some((out_cid, next_hop));
            end.last_activity = now;
        }
        self.pending_creates.insert(
            (out_cid, next_hop),
            PendingCreate {
                upstream: key,
                nonce,
                started: now,
            },
        );
        self.add_peer(now, next_hop);
        self.send(next_hop, OverlayMessage::Create { cid: out_cid, nonce });
    }

    fn on_data(&mut self, now: Instant, key: LinkKey, seq: u64, destination: Endpoint, payload: Vec<u8>) {
        if let Some(rule) = self.relays.get_mut(&key) {
            if seq <= rule.last_seq_in {
                self.counters.drops_reordered += 1;
                return;
            }
            rule.last_seq_in = seq;
            rule.next_seq_out += 1;
            rule.bytes += payload.len() as u64;
            rule.last_activity = now;
            let (out_cid, out_peer) = rule.out;
            let seq = rule.next_seq_out;
            self.counters.bytes_relayed += payload.len() as u64;
            self.send(
                out_peer,
                OverlayMessage::Data {
                    cid: out_cid,
                    seq,
                    destination,
                    payload,
                },
            );
            return;
        }

        let exit_capable = self.config.exit_capable;
        let Some(end) = self.ends.get_mut(&key) else {
            trace!(peer = %key.1, cid = key.0, "data for unknown circuit");
            return;
        };
        if !exit_capable {
            trace!(peer = %key.1, cid = key.0, "not an exit, dropping data");
            return;
        }
        if seq <= end.last_seq {
            self.counters.drops_reordered += 1;
            return;
        }
        end.last_seq = seq;
        end.last_activity = now;
        self.counters.bytes_exit += payload.len() as u64;
        self.outputs.push(Output::ExitSend {
            key,
            destination,
            payload,
        });
    }

    fn on_data_back(&mut self, now: Instant, key: LinkKey, seq: u64, origin: Endpoint, payload: Vec<u8>) {
        if let Some(rule) = self.relays.get_mut(&key) {
            if seq <= rule.last_seq_in {
                self.counters.drops_reordered += 1;
                return;
            }
            rule.last_seq_in = seq;
            rule.next_seq_out += 1;
            rule.bytes += payload.len() as u64;
            rule.last_activity = now;
            let (out_cid, out_peer) = rule.out;
            let seq = rule.next_seq_out;
            self.counters.bytes_relayed += payload.len() as u64;
            self.send(
                out_peer,
                OverlayMessage::DataBack {
                    cid: out_cid,
                    seq,
                    origin,
                    payload,
                },
            );
            return;
        }

        let (cid, from) = key;
        if !self.originated(cid, from) {
            trace!(peer = %from, cid, "data back for unknown circuit");
            return;
        }
        let Some(circuit) = self.circuits.get_mut(&cid) else {
            return;
        };
        if seq <= circuit.last_back_seq {
            self.counters.drops_reordered += 1;
            return;
        }
        circuit.last_back_seq = seq;
        circuit.last_seen = now;
        circuit.bytes_down += payload.len() as u64;
        self.outputs.push(Output::Deliver {
            circuit: cid,
            origin,
            payload,
        });
    }

    fn on_destroy(&mut self, key: LinkKey) {
        if let Some(rule) = self.relays.remove(&key) {
            self.relays.remove(&rule.out);
            debug!(in_cid = key.0, peer = %key.1, "relay torn down");
            self.send(rule.out.1, OverlayMessage::Destroy { cid: rule.out.0 });
        } else if self.ends.contains_key(&key) {
            self.remove_end(key);
        } else if self.originated(key.0, key.1) {
            self.break_circuit(key.0, CircuitError::Destroyed, false);
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Periodic work: timeouts, pings, expiry, gossip and pool maintenance.
    pub fn tick(&mut self, now: Instant) {
        self.update_relay_rate(now);
        self.check_circuits(now);
        self.expire(now);
        self.expire_peers(now);

        let gossip_due = self
            .last_gossip
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.gossip_interval);
        if gossip_due {
            self.gossip(now);
        }
        if self.enabled {
            self.maintain_pool(now);
        }
    }

    fn update_relay_rate(&mut self, now: Instant) {
        let (started, bytes) = self.relay_window;
        let elapsed = now.saturating_duration_since(started);
        if elapsed >= RELAY_RATE_WINDOW {
            let delta = self.counters.bytes_relayed.saturating_sub(bytes) as f64;
            self.relay_rate = delta / 1024.0 / elapsed.as_secs_f64();
            self.relay_window = (now, self.counters.bytes_relayed);
        }
    }

    fn check_circuits(&mut self, now: Instant) {
        let ping_timeout = self.config.ping_interval * PING_TOLERANCE;
        let mut broken = Vec::new();
        let mut pings = Vec::new();
        for circuit in self.circuits.values_mut() {
            match circuit.state {
                CircuitState::Building => {
                    if now.saturating_duration_since(circuit.step_started) > self.config.extend_timeout {
                        broken.push((circuit.id, CircuitError::ExtendTimeout));
                    }
                }
                CircuitState::Ready => {
                    if now.saturating_duration_since(circuit.last_seen) > ping_timeout {
                        broken.push((circuit.id, CircuitError::PingTimeout));
                    } else if now.saturating_duration_since(circuit.last_ping) >= self.config.ping_interval {
                        circuit.ping_nonce = rand::random();
                        circuit.last_ping = now;
                        pings.push((circuit.first_hop(), circuit.id, circuit.ping_nonce));
                    }
                }
                CircuitState::Broken => broken.push((circuit.id, CircuitError::Destroyed)),
            }
        }
        for (to, cid, nonce) in pings {
            self.send(to, OverlayMessage::Ping { cid, nonce });
        }
        for (cid, reason) in broken {
            self.break_circuit(cid, reason, true);
        }
    }

    fn expire(&mut self, now: Instant) {
        let idle = self.config.relay_idle_timeout;
        let is_idle = |at: Instant| now.saturating_duration_since(at) > idle;

        let stale_rules: Vec<LinkKey> = self
            .relays
            .iter()
            .filter(|(_, rule)| {
                is_idle(rule.last_activity)
                    && self
                        .relays
                        .get(&rule.out)
                        .is_none_or(|inverse| is_idle(inverse.last_activity))
            })
            .map(|(key, _)| *key)
            .collect();
        for key in stale_rules {
            if let Some(rule) = self.relays.remove(&key) {
                self.relays.remove(&rule.out);
                debug!(in_cid = key.0, peer = %key.1, "relay expired");
            }
        }

        let stale_ends: Vec<LinkKey> = self
            .ends
            .iter()
            .filter(|(_, end)| is_idle(end.last_activity))
            .map(|(key, _)| *key)
            .collect();
        for key in stale_ends {
            debug!(cid = key.0, peer = %key.1, "circuit end expired");
            self.remove_end(key);
        }

        let extend_timeout = self.config.extend_timeout;
        let stale_pending: Vec<LinkKey> = self
            .pending_creates
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.started) > extend_timeout)
            .map(|(key, _)| *key)
            .collect();
        for key in stale_pending {
            if let Some(pending) = self.pending_creates.remove(&key)
                && let Some(end) = self.ends.get_mut(&pending.upstream)
            {
                end.pending_extend = None;
            }
        }
    }

    fn maintain_pool(&mut self, now: Instant) {
        let live = self
            .circuits
            .values()
            .filter(|c| c.state != CircuitState::Broken)
            .count();
        for _ in live..self.config.target_circuits {
            if let Err(e) = self.build_circuit(now, None) {
                trace!(error = %e, "cannot build circuit yet");
                break;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::messages::{decode_frame, encode_frame};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn ident(n: u8) -> Identity {
        Identity::from_bytes([n; 32])
    }

    /// In-memory network of nodes that delivers frames one at a time.
    struct Net {
        now: Instant,
        nodes: BTreeMap<SocketAddr, OverlayNode>,
        queue: VecDeque<(SocketAddr, SocketAddr, OverlayMessage)>,
        exits: Vec<(SocketAddr, LinkKey, Endpoint, Vec<u8>)>,
        delivered: Vec<(SocketAddr, CircuitId, Endpoint, Vec<u8>)>,
        events: Vec<(SocketAddr, Output)>,
    }

    impl Net {
        fn new() -> Self {
            Self {
                now: Instant::now(),
                nodes: BTreeMap::new(),
                queue: VecDeque::new(),
                exits: Vec::new(),
                delivered: Vec::new(),
                events: Vec::new(),
            }
        }

        fn add(&mut self, port: u16, exit: bool, length: usize) {
            let config = OverlayConfig {
                circuit_length: length,
                target_circuits: 0,
                exit_capable: exit,
                ..Default::default()
            };
            let node = OverlayNode::new(config, ident(port as u8), addr(port), self.now);
            self.nodes.insert(addr(port), node);
        }

        /// Every node learns every other node through a Hello.
        fn introduce_all(&mut self) {
            let addrs: Vec<SocketAddr> = self.nodes.keys().copied().collect();
            for &a in &addrs {
                for &b in &addrs {
                    if a != b {
                        let hello = self.nodes[&b].hello();
                        let now = self.now;
                        self.node(a).handle_message(now, b, hello);
                        self.node(a).drain_outputs();
                    }
                }
            }
        }

        fn node(&mut self, a: SocketAddr) -> &mut OverlayNode {
            self.nodes.get_mut(&a).unwrap()
        }

        fn collect(&mut self, from: SocketAddr) {
            let outputs = self.node(from).drain_outputs();
            for out in outputs {
                match out {
                    Output::Send { to, message } => {
                        // through the real codec
                        let frame = encode_frame(&message).unwrap();
                        self.queue.push_back((from, to, decode_frame(&frame).unwrap()));
                    }
                    Output::ExitSend { key, destination, payload } => {
                        self.exits.push((from, key, destination, payload));
                    }
                    Output::Deliver { circuit, origin, payload } => {
                        self.delivered.push((from, circuit, origin, payload));
                    }
                    other => self.events.push((from, other)),
                }
            }
        }

        fn step(&mut self) -> bool {
            let Some((from, to, msg)) = self.queue.pop_front() else {
                return false;
            };
            let now = self.now;
            if let Some(node) = self.nodes.get_mut(&to) {
                node.handle_message(now, from, msg);
                self.collect(to);
            }
            true
        }

        fn run(&mut self) {
            while self.step() {}
        }
    }

    fn three_hop_net() -> Net {
        let mut net = Net::new();
        net.add(1000, false, 3);
        net.add(1001, false, 3);
        net.add(1002, false, 3);
        net.add(1003, true, 3);
        net.introduce_all();
        net
    }

    fn assert_rule_pairs(node: &OverlayNode) {
        for (key, rule) in node.relay_rules() {
            let inverse = node.relays.get(&rule.out()).expect("inverse rule");
            assert_eq!(inverse.out(), *key);
        }
    }

    #[test]
    fn circuit_extends_hop_by_hop() {
        let mut net = three_hop_net();
        let origin = addr(1000);
        let now = net.now;
        let cid = net.node(origin).build_circuit(now, None).unwrap();
        net.collect(origin);

        let mut trace = Vec::new();
        while net.step() {
            if let Some(c) = net.nodes[&origin].circuit(cid) {
                let entry = (c.hops().len(), c.state());
                if trace.last() != Some(&entry) {
                    trace.push(entry);
                }
                if c.state() == CircuitState::Ready {
                    assert_eq!(c.hops().len(), c.target_length());
                }
            }
        }
        assert_eq!(
            trace,
            vec![
                (0, CircuitState::Building),
                (1, CircuitState::Building),
                (2, CircuitState::Building),
                (3, CircuitState::Ready),
            ]
        );
        assert!(net.nodes[&origin].is_online());
        assert_eq!(*net.nodes[&origin].circuit(cid).unwrap().hops().last().unwrap(), addr(1003));
        assert!(net.events.contains(&(origin, Output::CircuitReady { circuit: cid })));

        for a in [addr(1001), addr(1002)] {
            assert_eq!(net.nodes[&a].relay_rule_count(), 2);
            assert_rule_pairs(&net.nodes[&a]);
        }
        assert_eq!(net.nodes[&addr(1003)].end_count(), 1);
    }

    #[test]
    fn data_reaches_exit_and_comes_back() {
        let mut net = three_hop_net();
        let origin = addr(1000);
        let now = net.now;
        let cid = net.node(origin).build_circuit(now, None).unwrap();
        net.collect(origin);
        net.run();

        let dest = Endpoint::Ip("1.2.3.4:53".parse().unwrap());
        net.node(origin).send_data(dest.clone(), b"q".to_vec()).unwrap();
        net.collect(origin);
        net.run();

        assert_eq!(net.exits.len(), 1);
        let (exit, key, seen_dest, payload) = net.exits[0].clone();
        assert_eq!(exit, addr(1003));
        assert_eq!(seen_dest, dest);
        assert_eq!(payload, b"q");

        assert!(net.node(exit).exit_return(now, key, dest.clone(), b"a".to_vec()));
        net.collect(exit);
        net.run();
        assert_eq!(net.delivered, vec![(origin, cid, dest, b"a".to_vec())]);

        let relayed: u64 = [addr(1001), addr(1002)]
            .iter()
            .map(|a| net.nodes[a].stats().bytes_relayed)
            .sum();
        assert_eq!(relayed, 4);
        assert_eq!(net.nodes[&exit].stats().bytes_exit, 1);
        assert_eq!(net.nodes[&origin].stats().bytes_enter, 1);
    }

    #[test]
    fn not_enough_peers_without_exit() {
        let mut net = Net::new();
        net.add(1100, false, 2);
        net.add(1101, false, 2);
        net.add(1102, false, 2);
        net.introduce_all();
        let now = net.now;
        assert_eq!(
            net.node(addr(1100)).build_circuit(now, None),
            Err(CircuitError::NotEnoughPeers)
        );
    }

    #[test]
    fn extend_timeout_breaks_circuit() {
        let mut net = three_hop_net();
        let origin = addr(1000);
        let now = net.now;
        // first hop does not exist: the create is never answered
        let cid = net
            .node(origin)
            .build_circuit(now, Some(addr(1999)))
            .unwrap();
        net.node(origin).drain_outputs();
        net.node(origin).tick(now + Duration::from_secs(5));
        assert!(net.nodes[&origin].circuit(cid).is_some());
        net.node(origin).tick(now + Duration::from_secs(11));
        let outputs = net.node(origin).drain_outputs();
        assert!(outputs.contains(&Output::CircuitBroken {
            circuit: cid,
            reason: CircuitError::ExtendTimeout
        }));
        assert!(net.nodes[&origin].circuit(cid).is_none());
    }

    #[test]
    fn create_refused_over_rule_cap() {
        let now = Instant::now();
        let config = OverlayConfig {
            max_relay_rules: 0,
            ..Default::default()
        };
        let mut node = OverlayNode::new(config, ident(1), addr(1200), now);
        node.handle_message(now, addr(1201), OverlayMessage::Create { cid: 5, nonce: 9 });
        let sent: Vec<_> = node
            .drain_outputs()
            .into_iter()
            .filter(|o| matches!(o, Output::Send { message: OverlayMessage::Created { .. }, .. }))
            .collect();
        assert!(sent.is_empty());
        assert_eq!(node.stats().refused_creates, 1);
        assert_eq!(node.end_count(), 0);
    }

    #[test]
    fn reordered_data_is_dropped_at_exit() {
        let now = Instant::now();
        let config = OverlayConfig {
            exit_capable: true,
            ..Default::default()
        };
        let mut exit = OverlayNode::new(config, ident(1), addr(1300), now);
        let prev = addr(1301);
        exit.handle_message(now, prev, OverlayMessage::Create { cid: 7, nonce: 1 });
        let dest = Endpoint::Ip("8.8.8.8:53".parse().unwrap());
        for seq in [2, 1, 3] {
            exit.handle_message(
                now,
                prev,
                OverlayMessage::Data {
                    cid: 7,
                    seq,
                    destination: dest.clone(),
                    payload: vec![seq as u8],
                },
            );
        }
        let sent: Vec<Vec<u8>> = exit
            .drain_outputs()
            .into_iter()
            .filter_map(|o| match o {
                Output::ExitSend { payload, .. } => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![vec![2], vec![3]]);
        assert_eq!(exit.stats().drops_reordered, 1);
    }

    #[test]
    fn non_exit_end_drops_data() {
        let now = Instant::now();
        let mut node = OverlayNode::new(OverlayConfig::default(), ident(1), addr(1310), now);
        node.handle_message(now, addr(1311), OverlayMessage::Create { cid: 1, nonce: 1 });
        node.drain_outputs();
        node.handle_message(
            now,
            addr(1311),
            OverlayMessage::Data {
                cid: 1,
                seq: 1,
                destination: Endpoint::Ip("8.8.8.8:53".parse().unwrap()),
                payload: vec![1],
            },
        );
        assert!(node.drain_outputs().is_empty());
    }

    #[test]
    fn destroy_tears_down_the_path() {
        let mut net = three_hop_net();
        let origin = addr(1000);
        let now = net.now;
        net.node(origin).build_circuit(now, None).unwrap();
        net.collect(origin);
        net.run();

        net.node(origin).stop_all();
        net.collect(origin);
        net.run();

        assert!(!net.nodes[&origin].is_online());
        assert!(!net.nodes[&origin].is_enabled());
        for a in [addr(1001), addr(1002)] {
            assert_eq!(net.nodes[&a].relay_rule_count(), 0);
        }
        assert_eq!(net.nodes[&addr(1003)].end_count(), 0);
        assert!(net
            .events
            .iter()
            .any(|(a, o)| *a == addr(1003) && matches!(o, Output::ExitClose { .. })));
    }

    #[test]
    fn unanswered_pings_break_circuit() {
        let mut net = three_hop_net();
        let origin = addr(1000);
        let now = net.now;
        let cid = net.node(origin).build_circuit(now, None).unwrap();
        net.collect(origin);
        net.run();

        net.node(origin).tick(now + Duration::from_secs(10));
        let pings = net.node(origin).drain_outputs();
        assert!(pings.iter().any(|o| matches!(
            o,
            Output::Send { message: OverlayMessage::Ping { .. }, .. }
        )));
        net.node(origin).tick(now + Duration::from_secs(31));
        assert!(net
            .node(origin)
            .drain_outputs()
            .contains(&Output::CircuitBroken {
                circuit: cid,
                reason: CircuitError::PingTimeout
            }));
    }

    #[test]
    fn answered_pings_keep_circuit() {
        let mut net = three_hop_net();
        let origin = addr(1000);
        let cid = {
            let now = net.now;
            let cid = net.node(origin).build_circuit(now, None).unwrap();
            net.collect(origin);
            net.run();
            cid
        };
        for _ in 0..4 {
            net.now += Duration::from_secs(10);
            let now = net.now;
            net.node(origin).tick(now);
            net.collect(origin);
            net.run();
        }
        assert_eq!(
            net.nodes[&origin].circuit(cid).map(|c| c.state()),
            Some(CircuitState::Ready)
        );
    }

    #[test]
    fn idle_relays_expire_in_pairs() {
        let mut net = three_hop_net();
        let origin = addr(1000);
        let now = net.now;
        net.node(origin).build_circuit(now, None).unwrap();
        net.collect(origin);
        net.run();

        let later = now + DEFAULT_RELAY_IDLE_TIMEOUT + Duration::from_secs(1);
        for a in [addr(1001), addr(1002), addr(1003)] {
            net.node(a).tick(later);
            assert_eq!(net.nodes[&a].relay_rule_count(), 0);
            assert_eq!(net.nodes[&a].end_count(), 0);
        }
    }

    #[test]
    fn destinations_stick_to_their_circuit() {
        let mut net = three_hop_net();
        let origin = addr(1000);
        let now = net.now;
        net.node(origin).build_circuit(now, None).unwrap();
        net.node(origin).build_circuit(now, None).unwrap();
        net.collect(origin);
        net.run();
        assert_eq!(net.nodes[&origin].ready_count(), 2);

        let a = Endpoint::Ip("1.1.1.1:53".parse().unwrap());
        let b = Endpoint::Ip("9.9.9.9:53".parse().unwrap());
        let first = net.node(origin).send_data(a.clone(), vec![0; 10]).unwrap();
        let other = net.node(origin).send_data(b, vec![0; 10]).unwrap();
        assert_ne!(first, other);
        assert_eq!(net.node(origin).send_data(a, vec![0; 10]).unwrap(), first);
    }

    #[test]
    fn send_without_circuit_fails() {
        let now = Instant::now();
        let mut node = OverlayNode::new(OverlayConfig::default(), ident(1), addr(1400), now);
        let dest = Endpoint::Ip("1.1.1.1:53".parse().unwrap());
        assert_eq!(
            node.send_data(dest.clone(), vec![1]),
            Err(CircuitError::NoReadyCircuit)
        );
        assert_eq!(
            node.send_data(dest, vec![0; MAX_PAYLOAD_SIZE + 1]),
            Err(CircuitError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
        );
    }

    #[test]
    fn hello_confirms_peer_and_answers_once() {
        let now = Instant::now();
        let mut node = OverlayNode::new(OverlayConfig::default(), ident(1), addr(1500), now);
        let hello = OverlayMessage::Hello {
            identity: ident(2),
            exit_capable: true,
            load: 0,
        };
        node.handle_message(now, addr(1501), hello.clone());
        assert_eq!(node.drain_outputs().len(), 1);
        node.handle_message(now, addr(1501), hello);
        assert!(node.drain_outputs().is_empty());
        assert_eq!(node.known_peers(), vec![addr(1501)]);
    }

    #[test]
    fn own_hello_marks_self_address() {
        let now = Instant::now();
        let mut node = OverlayNode::new(OverlayConfig::default(), ident(1), addr(1600), now);
        let alias = addr(1601);
        let own = node.hello();
        node.handle_message(now, alias, own);
        assert!(node.known_peers().is_empty());
        node.handle_message(now, addr(1602), OverlayMessage::Peers { addrs: vec![alias] });
        assert_eq!(node.known_peers(), vec![addr(1602)]);
    }

    #[test]
    fn silent_peers_expire_but_bootstrap_stays() {
        let now = Instant::now();
        let config = OverlayConfig {
            bootstrap: vec![addr(1701)],
            ..Default::default()
        };
        let mut node = OverlayNode::new(config, ident(1), addr(1700), now);
        node.add_peer(now, addr(1702));
        node.tick(now + DEFAULT_PEER_TIMEOUT + Duration::from_secs(1));
        assert_eq!(node.known_peers(), vec![addr(1701)]);
    }

    #[test]
    fn pool_maintenance_builds_target_circuits() {
        let mut net = three_hop_net();
        let origin = addr(1000);
        net.node(origin).config.target_circuits = 2;
        let now = net.now;
        net.node(origin).tick(now);
        net.collect(origin);
        net.run();
        assert_eq!(net.nodes[&origin].ready_count(), 2);

        net.node(origin).tick(now);
        let creates = net
            .node(origin)
            .drain_outputs()
            .into_iter()
            .filter(|o| matches!(o, Output::Send { message: OverlayMessage::Create { .. }, .. }))
            .count();
        assert_eq!(creates, 0);
    }
}
