//! # Overlay Actor
//!
//! Drives an [`OverlayNode`] over a real UDP socket. The actor owns the node,
//! the overlay socket and one exit socket per circuit this node terminates,
//! and executes every [`Output`] the node queues.
//!
//! ```text
//!   OverlayHandle ──cmd──▶ OverlayActor ──frames──▶ UdpSocket (overlay)
//!                              │  ▲
//!                   ExitSend   │  │ ExitInbound
//!                              ▼  │
//!                    exit writer / reader tasks ──▶ UdpSocket (0.0.0.0:0)
//! ```
//!
//! Return traffic for the local gateway leaves through the
//! [`ReturnData`] receiver handed out by [`OverlayHandle::bind`]. The number
//! of ready circuits is published on a `watch` channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::circuit::{CircuitError, LinkKey, OverlayConfig, OverlayNode, Output};
use crate::events::{EventBus, Topic};
use crate::identity::Identity;
use crate::messages::{
    CircuitId, CircuitInfo, Endpoint, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, OverlayStats, decode_frame,
    encode_frame,
};
use crate::protocols::DataPlane;

const COMMAND_CHANNEL_CAPACITY: usize = 256;
pub const RETURN_CHANNEL_CAPACITY: usize = 1024;
const EXIT_CHANNEL_CAPACITY: usize = 1024;
/// Per exit socket queue of datagrams waiting to be sent.
const EXIT_QUEUE_CAPACITY: usize = 256;

/// Bytes from the Internet arriving back at this originator.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnData {
    pub circuit: CircuitId,
    pub origin: Endpoint,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct ExitInbound {
    key: LinkKey,
    origin: Endpoint,
    payload: Vec<u8>,
}

enum OverlayCommand {
    Tunnel {
        destination: Endpoint,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<CircuitId, CircuitError>>,
    },
    ListCircuits {
        reply: oneshot::Sender<Vec<CircuitInfo>>,
    },
    CreateCircuit {
        first_hop: Option<SocketAddr>,
        reply: oneshot::Sender<Result<CircuitId, CircuitError>>,
    },
    SetEnabled {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<OverlayStats>,
    },
    AddPeer {
        addr: SocketAddr,
    },
    Quit,
}

// ============================================================================
// OverlayHandle (public API - cheap to clone)
// ============================================================================

/// Handle to the overlay actor. Cheap to clone.
#[derive(Clone)]
pub struct OverlayHandle {
    cmd_tx: mpsc::Sender<OverlayCommand>,
    local_addr: SocketAddr,
    identity: Identity,
    ready_rx: watch::Receiver<usize>,
}

impl std::fmt::Debug for OverlayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayHandle")
            .field("local_addr", &self.local_addr)
            .field("identity", &self.identity)
            .finish()
    }
}

impl OverlayHandle {
    /// Bind the overlay socket and spawn the actor.
    pub async fn bind(
        config: OverlayConfig,
        identity: Identity,
        bind_addr: SocketAddr,
        events: EventBus,
    ) -> Result<(Self, mpsc::Receiver<ReturnData>)> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind overlay socket on {bind_addr}"))?;
        let local_addr = socket.local_addr().context("overlay socket has no address")?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (return_tx, return_rx) = mpsc::channel(RETURN_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = mpsc::channel(EXIT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = watch::channel(0usize);

        info!(
            addr = %local_addr,
            identity = %identity.short(),
            exit = config.exit_capable,
            hops = config.circuit_length,
            "overlay started"
        );
        let node = OverlayNode::new(config, identity, local_addr, Instant::now());
        let actor = OverlayActor {
            node,
            socket: Arc::new(socket),
            exits: HashMap::new(),
            exit_tx,
            return_tx,
            ready_tx,
            events,
        };
        tokio::spawn(actor.run(cmd_rx, exit_rx));

        Ok((
            Self {
                cmd_tx,
                local_addr,
                identity,
                ready_rx,
            },
            return_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn ready_count(&self) -> usize {
        *self.ready_rx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.ready_count() > 0
    }

    /// Watch the number of ready circuits.
    pub fn watch_ready(&self) -> watch::Receiver<usize> {
        self.ready_rx.clone()
    }

    /// Resolve once at least `count` circuits are ready.
    pub async fn wait_ready(&self, count: usize) -> Result<()> {
        let mut rx = self.ready_rx.clone();
        rx.wait_for(|n| *n >= count)
            .await
            .map(|_| ())
            .map_err(|_| anyhow!("overlay actor closed"))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> OverlayCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| anyhow!("overlay actor closed"))?;
        reply_rx.await.map_err(|_| anyhow!("overlay actor closed"))
    }

    /// Send `payload` to `destination` through a ready circuit.
    pub async fn tunnel(&self, destination: Endpoint, payload: Vec<u8>) -> Result<CircuitId> {
        self.request(|reply| OverlayCommand::Tunnel {
            destination,
            payload,
            reply,
        })
        .await?
        .map_err(anyhow::Error::new)
    }

    pub async fn list_circuits(&self) -> Result<Vec<CircuitInfo>> {
        self.request(|reply| OverlayCommand::ListCircuits { reply }).await
    }

    pub async fn create_circuit(&self, first_hop: Option<SocketAddr>) -> Result<CircuitId> {
        self.request(|reply| OverlayCommand::CreateCircuit { first_hop, reply })
            .await?
            .map_err(anyhow::Error::new)
    }

    /// Resume building circuits.
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| OverlayCommand::SetEnabled {
            enabled: true,
            reply,
        })
        .await
    }

    /// Tear down every circuit and stop building new ones.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| OverlayCommand::SetEnabled {
            enabled: false,
            reply,
        })
        .await
    }

    pub async fn stats(&self) -> Result<OverlayStats> {
        self.request(|reply| OverlayCommand::Stats { reply }).await
    }

    pub async fn add_peer(&self, addr: SocketAddr) {
        let _ = self.cmd_tx.send(OverlayCommand::AddPeer { addr }).await;
    }

    /// Destroy our circuits and shut the actor down.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(OverlayCommand::Quit).await;
    }
}

#[async_trait]
impl DataPlane for OverlayHandle {
    async fn send_data(&self, destination: Endpoint, payload: Vec<u8>) -> Result<()> {
        self.tunnel(destination, payload).await.map(|_| ())
    }
}

// ============================================================================
// Exit sockets
// ============================================================================

/// Destination-side socket of one circuit end. Reused for every destination
/// of that circuit.
struct ExitSocket {
    queue: mpsc::Sender<(Endpoint, Vec<u8>)>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl ExitSocket {
    fn open(key: LinkKey, inbound: mpsc::Sender<ExitInbound>) -> Result<Self> {
        let std_socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).context("failed to bind exit socket")?;
        std_socket
            .set_nonblocking(true)
            .context("failed to configure exit socket")?;
        let socket = Arc::new(UdpSocket::from_std(std_socket).context("failed to register exit socket")?);
        // resolved address -> endpoint the originator asked for
        let origins: Arc<Mutex<HashMap<SocketAddr, Endpoint>>> = Arc::default();

        let (queue, queue_rx) = mpsc::channel(EXIT_QUEUE_CAPACITY);
        let writer = tokio::spawn(exit_writer(socket.clone(), origins.clone(), queue_rx));
        let reader = tokio::spawn(exit_reader(key, socket, origins, inbound));
        Ok(Self { queue, writer, reader })
    }

    fn close(self) {
        self.writer.abort();
        self.reader.abort();
    }
}

async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr> {
    match endpoint {
        Endpoint::Ip(addr) => Ok(*addr),
        Endpoint::Domain { host, port } => tokio::net::lookup_host((host.as_str(), *port))
            .await
            .with_context(|| format!("failed to resolve {host}"))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| anyhow!("no IPv4 address for {host}")),
    }
}

async fn exit_writer(
    socket: Arc<UdpSocket>,
    origins: Arc<Mutex<HashMap<SocketAddr, Endpoint>>>,
    mut queue: mpsc::Receiver<(Endpoint, Vec<u8>)>,
) {
    while let Some((destination, payload)) = queue.recv().await {
        let target = match resolve(&destination).await {
            Ok(target) => target,
            Err(e) => {
                debug!(destination = %destination, error = %e, "exit cannot resolve destination");
                continue;
            }
        };
        if let Ok(mut map) = origins.lock() {
            map.insert(target, destination);
        }
        if let Err(e) = socket.send_to(&payload, target).await {
            debug!(target = %target, error = %e, "exit send failed");
        }
    }
}

async fn exit_reader(
    key: LinkKey,
    socket: Arc<UdpSocket>,
    origins: Arc<Mutex<HashMap<SocketAddr, Endpoint>>>,
    inbound: mpsc::Sender<ExitInbound>,
) {
    let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(cid = key.0, error = %e, "exit socket closed");
                return;
            }
        };
        let origin = origins.lock().ok().and_then(|m| m.get(&from).cloned());
        let Some(origin) = origin else {
            trace!(from = %from, "unsolicited datagram at exit");
            continue;
        };
        let msg = ExitInbound {
            key,
            origin,
            payload: buf[..len].to_vec(),
        };
        if inbound.send(msg).await.is_err() {
            return;
        }
    }
}

// ============================================================================
// OverlayActor
// ============================================================================

struct OverlayActor {
    node: OverlayNode,
    socket: Arc<UdpSocket>,
    exits: HashMap<LinkKey, ExitSocket>,
    exit_tx: mpsc::Sender<ExitInbound>,
    return_tx: mpsc::Sender<ReturnData>,
    ready_tx: watch::Sender<usize>,
    events: EventBus,
}

impl OverlayActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<OverlayCommand>,
        mut exit_rx: mpsc::Receiver<ExitInbound>,
    ) {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        let mut tick = tokio::time::interval(self.node.config().tick_interval);
        tick.tick().await;

        // announce ourselves to the bootstrap peers right away
        self.node.tick(Instant::now());
        self.flush().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(OverlayCommand::Tunnel { destination, payload, reply }) => {
                            let _ = reply.send(self.node.send_data(destination, payload));
                        }
                        Some(OverlayCommand::ListCircuits { reply }) => {
                            let _ = reply.send(self.node.circuit_infos());
                        }
                        Some(OverlayCommand::CreateCircuit { first_hop, reply }) => {
                            let result = self.node.build_circuit(Instant::now(), first_hop);
                            let _ = reply.send(result);
                        }
                        Some(OverlayCommand::SetEnabled { enabled, reply }) => {
                            if enabled {
                                info!("overlay building circuits");
                                self.node.set_enabled(true);
                            } else {
                                info!("overlay stopped, tearing down circuits");
                                self.node.stop_all();
                            }
                            // ready count must be settled when the caller resumes
                            self.flush().await;
                            let _ = reply.send(());
                        }
                        Some(OverlayCommand::Stats { reply }) => {
                            let _ = reply.send(self.node.stats());
                        }
                        Some(OverlayCommand::AddPeer { addr }) => {
                            self.node.add_peer(Instant::now(), addr);
                        }
                        Some(OverlayCommand::Quit) | None => {
                            debug!("overlay actor shutting down");
                            break;
                        }
                    }
                }

                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.on_datagram(&buf[..len], from),
                        // ICMP errors from earlier sends surface here; nothing to do
                        Err(e) => trace!(error = %e, "overlay recv error"),
                    }
                }

                Some(inbound) = exit_rx.recv() => {
                    let ExitInbound { key, origin, payload } = inbound;
                    self.node.exit_return(Instant::now(), key, origin, payload);
                }

                _ = tick.tick() => {
                    self.node.tick(Instant::now());
                }
            }
            self.flush().await;
        }

        self.node.stop_all();
        self.flush().await;
        for (_, exit) in self.exits.drain() {
            exit.close();
        }
    }

    fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        match decode_frame(bytes) {
            Ok(message) => self.node.handle_message(Instant::now(), from, message),
            Err(e) => {
                self.node.record_protocol_error();
                debug!(peer = %from, error = %e, "dropping malformed overlay frame");
            }
        }
    }

    /// Execute everything the node queued.
    async fn flush(&mut self) {
        for output in self.node.drain_outputs() {
            match output {
                Output::Send { to, message } => match encode_frame(&message) {
                    Ok(frame) => {
                        if let Err(e) = self.socket.send_to(&frame, to).await {
                            debug!(peer = %to, kind = message.kind(), error = %e, "overlay send failed");
                        }
                    }
                    Err(e) => warn!(kind = message.kind(), error = %e, "failed to encode overlay frame"),
                },
                Output::ExitSend { key, destination, payload } => self.exit_send(key, destination, payload),
                Output::ExitClose { key } => {
                    if let Some(exit) = self.exits.remove(&key) {
                        exit.close();
                        debug!(cid = key.0, peer = %key.1, "closed exit socket");
                    }
                }
                Output::Deliver { circuit, origin, payload } => {
                    let data = ReturnData { circuit, origin, payload };
                    if self.return_tx.try_send(data).is_err() {
                        debug!(circuit, "return queue full, dropping datagram");
                    }
                }
                Output::CircuitReady { circuit } => {
                    self.events.emit(Topic::CircuitReady, format!("circuit {circuit} ready"));
                }
                Output::CircuitBroken { circuit, reason } => {
                    self.events
                        .emit(Topic::CircuitBroken, format!("circuit {circuit} broken: {reason}"));
                }
            }
        }
        let ready = self.node.ready_count();
        self.ready_tx.send_if_modified(|current| {
            let changed = *current != ready;
            *current = ready;
            changed
        });
    }

    fn exit_send(&mut self, key: LinkKey, destination: Endpoint, payload: Vec<u8>) {
        if !self.exits.contains_key(&key) {
            match ExitSocket::open(key, self.exit_tx.clone()) {
                Ok(exit) => {
                    debug!(cid = key.0, peer = %key.1, "opened exit socket");
                    self.exits.insert(key, exit);
                }
                Err(e) => {
                    warn!(error = %e, "cannot open exit socket");
                    return;
                }
            }
        }
        if let Some(exit) = self.exits.get(&key)
            && exit.queue.try_send((destination, payload)).is_err()
        {
            debug!(cid = key.0, "exit queue full, dropping datagram");
        }
    }
}
