//! # SOCKS5 Gateway
//!
//! Accepts SOCKS5 clients on a local TCP port and connects them to the
//! overlay. `CONNECT` requests are relayed byte for byte to the destination;
//! `UDP ASSOCIATE` requests get a per-client UDP socket whose datagrams enter
//! the overlay through a [`DataPlane`] and whose replies come back through
//! the [`UdpRelayTable`].
//!
//! ## Accepting
//!
//! `accept_incoming` is true only while the gateway is started and, unless
//! [`GatewayConfig::require_circuits`] is off, at least one circuit is ready.
//! When it drops to false, connected clients are closed so they retry later.
//! `stop` also closes the listening socket; `start` binds it again.
//! A client beyond [`GatewayConfig::max_clients`] completes method
//! negotiation and then gets `GENERAL_FAILURE` for its request.
//!
//! | Timeout | Default | On expiry |
//! |---------|---------|-----------|
//! | `handshake_timeout` | 10 s | connection closed |
//! | `connect_timeout` | 30 s | reply `0x04`, connection closed |

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::events::{EventBus, Topic};
use crate::messages::Endpoint;
use crate::overlay::ReturnData;
use crate::protocols::DataPlane;
use crate::socks5::{self, Command, ReplyCode, Socks5Connection, SocksEvent};
use crate::udprelay::{ConnectionId, RelayDrop, ReturnDatagram, UdpRelayTable};

// ============================================================================
// Configuration
// ============================================================================

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CLIENTS: usize = 512;

const COMMAND_CHANNEL_CAPACITY: usize = 1024;
const UDP_BUFFER_SIZE: usize = 65_535;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_clients: usize,
    /// Refuse clients while no circuit is ready.
    pub require_circuits: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_clients: DEFAULT_MAX_CLIENTS,
            require_circuits: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub accepting: bool,
    pub clients: usize,
    pub udp_routes: usize,
    pub udp_sockets: usize,
    pub drops_unknown_route: u64,
    pub drops_no_socket: u64,
    pub drops_malformed: u64,
    pub drops_foreign: u64,
}

enum GatewayCommand {
    Outbound {
        conn: ConnectionId,
        client: SocketAddr,
        socket: Arc<UdpSocket>,
        datagram: Vec<u8>,
    },
    Foreign {
        conn: ConnectionId,
        from: SocketAddr,
    },
    CloseConnection {
        conn: ConnectionId,
    },
    SetEnabled {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<GatewayStats>,
    },
    Quit,
}

// ============================================================================
// GatewayHandle (public API - cheap to clone)
// ============================================================================

/// Handle to the gateway actor. Cheap to clone.
#[derive(Clone, Debug)]
pub struct GatewayHandle {
    cmd_tx: mpsc::Sender<GatewayCommand>,
    local_addr: SocketAddr,
    accept_rx: watch::Receiver<bool>,
}

impl GatewayHandle {
    /// Bind the SOCKS5 listener and spawn the actor. `returns` carries
    /// overlay return traffic; `ready` the number of ready circuits.
    pub async fn bind(
        config: GatewayConfig,
        listen_addr: SocketAddr,
        data_plane: Arc<dyn DataPlane>,
        returns: mpsc::Receiver<ReturnData>,
        ready: watch::Receiver<usize>,
        events: EventBus,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind SOCKS5 listener on {listen_addr}"))?;
        let local_addr = listener.local_addr().context("SOCKS5 listener has no address")?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (accept_tx, accept_rx) = watch::channel(false);
        let clients = ClientContext {
            config: config.clone(),
            cmd_tx: cmd_tx.clone(),
            accept_rx: accept_rx.clone(),
            next_conn: Arc::new(AtomicU64::new(1)),
            active: Arc::new(AtomicUsize::new(0)),
        };

        info!(addr = %local_addr, "SOCKS5 gateway listening");
        let mut actor = GatewayActor {
            config,
            local_addr,
            listener: None,
            clients,
            enabled: true,
            table: UdpRelayTable::new(),
            drops_foreign: 0,
            data_plane,
            accept_tx,
            ready,
            events,
        };
        actor.listener = Some(tokio::spawn(accept_loop(listener, actor.clients.clone())));
        actor.update_accepting();
        tokio::spawn(actor.run(cmd_rx, returns));

        Ok(Self {
            cmd_tx,
            local_addr,
            accept_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_accepting(&self) -> bool {
        *self.accept_rx.borrow()
    }

    pub fn watch_accepting(&self) -> watch::Receiver<bool> {
        self.accept_rx.clone()
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(GatewayCommand::SetEnabled {
                enabled,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow!("gateway actor closed"))?;
        reply_rx.await.map_err(|_| anyhow!("gateway actor closed"))?
    }

    /// Re-open the listener after [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        self.set_enabled(true).await
    }

    /// Close the listener and every connected client.
    pub async fn stop(&self) -> Result<()> {
        self.set_enabled(false).await
    }

    pub async fn stats(&self) -> Result<GatewayStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(GatewayCommand::Stats { reply: reply_tx })
            .await
            .map_err(|_| anyhow!("gateway actor closed"))?;
        reply_rx.await.map_err(|_| anyhow!("gateway actor closed"))
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(GatewayCommand::Quit).await;
    }
}

// ============================================================================
// Client connections
// ============================================================================

#[derive(Clone)]
struct ClientContext {
    config: GatewayConfig,
    cmd_tx: mpsc::Sender<GatewayCommand>,
    accept_rx: watch::Receiver<bool>,
    next_conn: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
}

async fn accept_loop(listener: TcpListener, ctx: ClientContext) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(error = %e, "SOCKS5 accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        if !*ctx.accept_rx.borrow() {
            debug!(peer = %peer, "refusing SOCKS5 client, gateway not ready");
            continue;
        }
        // the slot is taken before spawning so a burst cannot overshoot
        if ctx.active.fetch_add(1, Ordering::Relaxed) >= ctx.config.max_clients {
            ctx.active.fetch_sub(1, Ordering::Relaxed);
            warn!(peer = %peer, max = ctx.config.max_clients, "too many SOCKS5 clients");
            tokio::spawn(refuse_client(stream, peer, ctx.config.handshake_timeout));
            continue;
        }

        let conn = ctx.next_conn.fetch_add(1, Ordering::Relaxed);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            trace!(conn, peer = %peer, "SOCKS5 client connected");
            let mut accept_rx = ctx.accept_rx.clone();
            let result = tokio::select! {
                served = serve_client(conn, stream, peer, &ctx) => served,
                _ = gateway_closed(&mut accept_rx) => {
                    debug!(conn, "force-closing SOCKS5 client");
                    Ok(())
                }
            };
            if let Err(e) = result {
                debug!(conn, peer = %peer, error = %e, "SOCKS5 client closed");
            }
            ctx.active.fetch_sub(1, Ordering::Relaxed);
            let _ = ctx.cmd_tx.send(GatewayCommand::CloseConnection { conn }).await;
        });
    }
}

/// Finish method negotiation with a client over the limit, then answer its
/// request with `GENERAL_FAILURE` and close.
async fn refuse_client(mut stream: TcpStream, peer: SocketAddr, handshake_timeout: Duration) {
    let mut socks = Socks5Connection::new();
    match tokio::time::timeout(handshake_timeout, negotiate(&mut stream, &mut socks)).await {
        Ok(Ok(Some(_))) => {
            let _ = stream
                .write_all(&socks5::encode_failure(ReplyCode::GeneralFailure))
                .await;
            let _ = stream.shutdown().await;
        }
        Ok(Ok(None)) => {}
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "refused SOCKS5 client closed"),
        Err(_) => debug!(peer = %peer, "refused SOCKS5 client timed out"),
    }
}

/// Resolves once the gateway stops accepting.
async fn gateway_closed(accept_rx: &mut watch::Receiver<bool>) {
    let _ = accept_rx.wait_for(|open| !*open).await;
}

/// Run the method and request exchange. `None` when the client offered no
/// acceptable method.
async fn negotiate(
    stream: &mut TcpStream,
    socks: &mut Socks5Connection,
) -> Result<Option<(Command, Endpoint)>> {
    let mut buf = [0u8; 512];
    loop {
        match socks.poll() {
            Ok(Some(SocksEvent::MethodSelected { accepted, reply })) => {
                stream.write_all(&reply).await?;
                if !accepted {
                    return Ok(None);
                }
                socks.method_reply_sent();
                continue;
            }
            Ok(Some(SocksEvent::Request {
                command,
                destination,
            })) => return Ok(Some((command, destination))),
            Ok(None) => {}
            Err(e) => {
                if let Some(code) = e.reply_code() {
                    let _ = stream.write_all(&socks5::encode_failure(code)).await;
                }
                return Err(anyhow::Error::new(e));
            }
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            bail!("client closed during handshake");
        }
        socks.feed(&buf[..n]);
    }
}

async fn serve_client(
    conn: ConnectionId,
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: &ClientContext,
) -> Result<()> {
    let mut socks = Socks5Connection::new();
    let negotiated = tokio::time::timeout(ctx.config.handshake_timeout, negotiate(&mut stream, &mut socks))
        .await
        .map_err(|_| anyhow!("SOCKS5 handshake timed out"))??;
    let Some((command, destination)) = negotiated else {
        return Ok(());
    };

    match command {
        Command::Connect => {
            let outbound = match tokio::time::timeout(ctx.config.connect_timeout, connect(&destination)).await {
                Ok(Ok(outbound)) => outbound,
                Ok(Err(e)) => {
                    let code = connect_failure_code(&e);
                    let _ = stream.write_all(&socks5::encode_failure(code)).await;
                    return Err(e).with_context(|| format!("connect to {destination} failed"));
                }
                Err(_) => {
                    let _ = stream
                        .write_all(&socks5::encode_failure(ReplyCode::HostUnreachable))
                        .await;
                    bail!("connect to {destination} timed out");
                }
            };
            let bound = outbound.local_addr()?;
            stream
                .write_all(&socks5::encode_reply(ReplyCode::Succeeded, bound))
                .await?;
            debug!(conn, destination = %destination, "SOCKS5 connect");
            let leftover = socks.start_relay();
            relay_tcp(conn, stream, outbound, leftover).await
        }
        Command::UdpAssociate => {
            let local_ip = stream.local_addr()?.ip();
            let socket = match UdpSocket::bind((local_ip, 0)).await {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    let _ = stream
                        .write_all(&socks5::encode_failure(ReplyCode::GeneralFailure))
                        .await;
                    return Err(e).context("failed to allocate UDP relay socket");
                }
            };
            let bound = socket.local_addr()?;
            stream
                .write_all(&socks5::encode_reply(ReplyCode::Succeeded, bound))
                .await?;
            socks.udp_accepted();
            debug!(conn, bound = %bound, "SOCKS5 UDP associate");
            associate(conn, stream, peer, socket, ctx).await
        }
        Command::Bind | Command::Unknown(_) => {
            stream
                .write_all(&socks5::encode_failure(ReplyCode::CommandNotSupported))
                .await?;
            debug!(conn, command = ?command, "SOCKS5 command not supported");
            Ok(())
        }
    }
}

async fn connect(destination: &Endpoint) -> std::io::Result<TcpStream> {
    match destination {
        Endpoint::Ip(addr) => TcpStream::connect(addr).await,
        Endpoint::Domain { host, port } => TcpStream::connect((host.as_str(), *port)).await,
    }
}

fn connect_failure_code(err: &std::io::Error) -> ReplyCode {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::TimedOut
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::NotFound => ReplyCode::HostUnreachable,
        _ => ReplyCode::GeneralFailure,
    }
}

async fn relay_tcp(
    conn: ConnectionId,
    mut client: TcpStream,
    mut outbound: TcpStream,
    leftover: Vec<u8>,
) -> Result<()> {
    if !leftover.is_empty() {
        outbound.write_all(&leftover).await?;
    }
    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut outbound).await?;
    debug!(conn, up, down, "TCP relay finished");
    Ok(())
}

/// Pump datagrams of one UDP association until its TCP connection closes.
async fn associate(
    conn: ConnectionId,
    mut control: TcpStream,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    ctx: &ClientContext,
) -> Result<()> {
    let mut datagram = vec![0u8; UDP_BUFFER_SIZE];
    let mut scratch = [0u8; 64];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut datagram) => {
                let (len, from) = received.context("UDP relay socket failed")?;
                let command = if from.ip() == peer.ip() {
                    GatewayCommand::Outbound {
                        conn,
                        client: from,
                        socket: socket.clone(),
                        datagram: datagram[..len].to_vec(),
                    }
                } else {
                    GatewayCommand::Foreign { conn, from }
                };
                if ctx.cmd_tx.send(command).await.is_err() {
                    return Ok(());
                }
            }
            read = control.read(&mut scratch) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// GatewayActor
// ============================================================================

struct GatewayActor {
    config: GatewayConfig,
    local_addr: SocketAddr,
    listener: Option<JoinHandle<()>>,
    clients: ClientContext,
    enabled: bool,
    table: UdpRelayTable<Arc<UdpSocket>>,
    drops_foreign: u64,
    data_plane: Arc<dyn DataPlane>,
    accept_tx: watch::Sender<bool>,
    ready: watch::Receiver<usize>,
    events: EventBus,
}

impl GatewayActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<GatewayCommand>,
        mut returns: mpsc::Receiver<ReturnData>,
    ) {
        let mut ready = self.ready.clone();
        let mut overlay_gone = false;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(GatewayCommand::Outbound { conn, client, socket, datagram }) => {
                            self.outbound(conn, client, socket, &datagram).await;
                        }
                        Some(GatewayCommand::Foreign { conn, from }) => {
                            self.drops_foreign += 1;
                            debug!(conn, reason = %RelayDrop::ForeignClient(from), "dropping client datagram");
                        }
                        Some(GatewayCommand::CloseConnection { conn }) => {
                            self.table.clear_connection(conn);
                        }
                        Some(GatewayCommand::SetEnabled { enabled, reply }) => {
                            let _ = reply.send(self.set_enabled(enabled).await);
                        }
                        Some(GatewayCommand::Stats { reply }) => {
                            let _ = reply.send(self.stats());
                        }
                        Some(GatewayCommand::Quit) | None => {
                            debug!("gateway actor shutting down");
                            break;
                        }
                    }
                }

                Some(data) = returns.recv() => {
                    self.inbound(data).await;
                }

                changed = ready.changed(), if !overlay_gone => {
                    if changed.is_err() {
                        overlay_gone = true;
                        self.ready = watch::channel(0).1;
                    }
                    self.update_accepting();
                }
            }
        }

        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.accept_tx.send_replace(false);
    }

    async fn outbound(&mut self, conn: ConnectionId, client: SocketAddr, socket: Arc<UdpSocket>, datagram: &[u8]) {
        match self.table.outbound(conn, client, socket, datagram) {
            Ok((destination, payload)) => {
                if let Err(e) = self.data_plane.send_data(destination.clone(), payload).await {
                    debug!(conn, destination = %destination, error = %e, "overlay refused datagram");
                }
            }
            Err(reason) => debug!(conn, client = %client, reason = %reason, "dropping client datagram"),
        }
    }

    async fn inbound(&mut self, data: ReturnData) {
        let Ok(ReturnDatagram { socket, client, bytes }) = self.table.inbound(&data.origin, &data.payload) else {
            return;
        };
        if let Err(e) = socket.send_to(&bytes, client).await {
            debug!(client = %client, error = %e, "UDP relay socket failed");
            self.table.remove_socket(client);
        }
    }

    async fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        if enabled && self.listener.is_none() {
            let listener = TcpListener::bind(self.local_addr)
                .await
                .with_context(|| format!("failed to re-bind SOCKS5 listener on {}", self.local_addr))?;
            self.listener = Some(tokio::spawn(accept_loop(listener, self.clients.clone())));
            info!(addr = %self.local_addr, "SOCKS5 gateway started");
        } else if !enabled && let Some(listener) = self.listener.take() {
            listener.abort();
            // the socket is released only once the task is dropped
            let _ = listener.await;
            info!(addr = %self.local_addr, "SOCKS5 gateway stopped");
        }
        self.enabled = enabled;
        self.update_accepting();
        Ok(())
    }

    fn update_accepting(&mut self) {
        let ready = !self.config.require_circuits || *self.ready.borrow() > 0;
        let accepting = self.enabled && ready;
        let changed = self.accept_tx.send_if_modified(|current| {
            let changed = *current != accepting;
            *current = accepting;
            changed
        });
        if changed {
            if accepting {
                info!("accepting SOCKS5 clients");
                self.events.emit(Topic::GatewayAccepting, "accepting SOCKS5 clients");
            } else {
                info!("refusing SOCKS5 clients");
                self.events.emit(Topic::GatewayRefusing, "refusing SOCKS5 clients");
            }
        }
    }

    fn stats(&self) -> GatewayStats {
        GatewayStats {
            accepting: *self.accept_tx.borrow(),
            clients: self.clients.active.load(Ordering::Relaxed),
            udp_routes: self.table.route_count(),
            udp_sockets: self.table.socket_count(),
            drops_unknown_route: self.table.drops_unknown_route(),
            drops_no_socket: self.table.drops_no_socket(),
            drops_malformed: self.table.drops_malformed(),
            drops_foreign: self.drops_foreign,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct FakePlane {
        tx: mpsc::UnboundedSender<(Endpoint, Vec<u8>)>,
    }

    #[async_trait]
    impl DataPlane for FakePlane {
        async fn send_data(&self, destination: Endpoint, payload: Vec<u8>) -> Result<()> {
            let _ = self.tx.send((destination, payload));
            Ok(())
        }
    }

    struct Harness {
        gateway: GatewayHandle,
        sent: mpsc::UnboundedReceiver<(Endpoint, Vec<u8>)>,
        returns: mpsc::Sender<ReturnData>,
        ready: watch::Sender<usize>,
        events: EventBus,
    }

    async fn harness(ready_circuits: usize) -> Harness {
        let (tx, sent) = mpsc::unbounded_channel();
        let (returns, returns_rx) = mpsc::channel(16);
        let (ready, ready_rx) = watch::channel(ready_circuits);
        let events = EventBus::default();
        let gateway = GatewayHandle::bind(
            GatewayConfig::default(),
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(FakePlane { tx }),
            returns_rx,
            ready_rx,
            events.clone(),
        )
        .await
        .unwrap();
        Harness {
            gateway,
            sent,
            returns,
            ready,
            events,
        }
    }

    async fn handshake(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
        stream
    }

    async fn read_reply(stream: &mut TcpStream) -> (u8, SocketAddr) {
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[3], 0x01);
        let ip = std::net::Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
        let port = u16::from_be_bytes([reply[8], reply[9]]);
        (reply[1], SocketAddr::from((ip, port)))
    }

    async fn wait_accepting(gateway: &GatewayHandle, accepting: bool) {
        let mut rx = gateway.watch_accepting();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|a| *a == accepting))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn udp_associate_round_trip() {
        let mut h = harness(1).await;
        let mut control = handshake(h.gateway.local_addr()).await;
        control
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let (code, relay) = read_reply(&mut control).await;
        assert_eq!(code, 0x00);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dns = Endpoint::Ip("1.2.3.4:53".parse().unwrap());
        client
            .send_to(&socks5::encode_udp(&dns, b"q").unwrap(), relay)
            .await
            .unwrap();

        let (dest, payload) = tokio::time::timeout(Duration::from_secs(2), h.sent.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dest, dns);
        assert_eq!(payload, b"q");

        h.returns
            .send(ReturnData {
                circuit: 1,
                origin: dns.clone(),
                payload: b"a".to_vec(),
            })
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, relay);
        assert_eq!(&buf[..n], &[0, 0, 0, 0x01, 1, 2, 3, 4, 0, 53, b'a']);

        // a reply from nowhere is counted and dropped
        h.returns
            .send(ReturnData {
                circuit: 1,
                origin: Endpoint::Ip("9.9.9.9:1".parse().unwrap()),
                payload: b"x".to_vec(),
            })
            .await
            .unwrap();
        let mut drops = 0;
        for _ in 0..50 {
            drops = h.gateway.stats().await.unwrap().drops_unknown_route;
            if drops > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(drops, 1);

        drop(control);
        let mut routes = 1;
        for _ in 0..50 {
            routes = h.gateway.stats().await.unwrap().udp_routes;
            if routes == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(routes, 0);
    }

    #[tokio::test]
    async fn connect_relays_bytes() {
        let h = harness(1).await;
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = s.read(&mut buf).await.unwrap();
            s.write_all(&buf[..n]).await.unwrap();
        });

        let mut stream = handshake(h.gateway.local_addr()).await;
        let port = echo_addr.port().to_be_bytes();
        stream
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, port[0], port[1]])
            .await
            .unwrap();
        let (code, _) = read_reply(&mut stream).await;
        assert_eq!(code, 0x00);

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn bind_is_not_supported() {
        let h = harness(1).await;
        let mut stream = handshake(h.gateway.local_addr()).await;
        stream
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let (code, _) = read_reply(&mut stream).await;
        assert_eq!(code, 0x07);
    }

    #[tokio::test]
    async fn clients_wait_for_circuits() {
        let h = harness(0).await;
        assert!(!h.gateway.is_accepting());

        let mut refused = TcpStream::connect(h.gateway.local_addr()).await.unwrap();
        let _ = refused.write_all(&[0x05, 0x01, 0x00]).await;
        let mut buf = [0u8; 2];
        let read = tokio::time::timeout(Duration::from_secs(2), refused.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        h.ready.send_replace(1);
        wait_accepting(&h.gateway, true).await;
        let mut stream = handshake(h.gateway.local_addr()).await;

        // the pool empties: connected clients are closed
        h.ready.send_replace(0);
        wait_accepting(&h.gateway, false).await;
        stream
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .ok();
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.is_err() || rest.len() <= 10);

        let topics: Vec<Topic> = h.events.drain().into_iter().map(|e| e.topic).collect();
        assert!(topics.contains(&Topic::GatewayAccepting));
        assert!(topics.contains(&Topic::GatewayRefusing));
    }

    #[tokio::test]
    async fn stop_closes_listener() {
        let h = harness(1).await;
        let addr = h.gateway.local_addr();
        h.gateway.stop().await.unwrap();
        assert!(!h.gateway.is_accepting());

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused);

        h.gateway.start().await.unwrap();
        assert!(h.gateway.is_accepting());
        handshake(addr).await;
    }
}
