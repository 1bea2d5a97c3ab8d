//! # Control Channel
//!
//! Loopback UDP command socket. Each datagram holds one bincode
//! [`ControlRequest`]; the answer is one [`ControlResponse`] sent back to the
//! requester. Being bound to loopback is the only authentication.
//!
//! | Request | Response |
//! |---------|----------|
//! | `IsOnline` | `Online { online }` |
//! | `ListCircuits` | `Circuits { circuits }` |
//! | `CreateCircuit { first_hop }` | `CircuitCreated { circuit_id }` |
//! | `Start` / `Stop` | `Ack { ok }` |
//! | `Stats` | `Stats { identity, stats }` |
//!
//! Anything undecodable gets `Error { message }`; nothing here is fatal.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gateway::GatewayHandle;
use crate::messages::{ControlRequest, ControlResponse, MAX_FRAME_SIZE, deserialize_bounded, serialize_bounded};
use crate::overlay::OverlayHandle;

pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    NotLoopback(SocketAddr),
    Malformed(String),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::NotLoopback(addr) => write!(f, "control socket must be loopback, got {addr}"),
            ControlError::Malformed(reason) => write!(f, "malformed control request: {reason}"),
        }
    }
}

impl std::error::Error for ControlError {}

/// What the control channel operates on.
#[derive(Clone, Debug)]
pub struct ControlTarget {
    pub overlay: OverlayHandle,
    pub gateway: Option<GatewayHandle>,
}

impl ControlTarget {
    async fn handle(&self, request: ControlRequest) -> ControlResponse {
        let result = match request {
            ControlRequest::IsOnline => Ok(ControlResponse::Online {
                online: self.overlay.is_online(),
            }),
            ControlRequest::ListCircuits => self
                .overlay
                .list_circuits()
                .await
                .map(|circuits| ControlResponse::Circuits { circuits }),
            ControlRequest::CreateCircuit { first_hop } => self
                .overlay
                .create_circuit(Some(first_hop))
                .await
                .map(|circuit_id| ControlResponse::CircuitCreated { circuit_id }),
            ControlRequest::Start => self.start().await.map(|_| ControlResponse::Ack { ok: true }),
            ControlRequest::Stop => self.stop().await.map(|_| ControlResponse::Ack { ok: true }),
            ControlRequest::Stats => self.stats().await,
        };
        result.unwrap_or_else(|e| ControlResponse::Error {
            message: format!("{e:#}"),
        })
    }

    async fn start(&self) -> Result<()> {
        self.overlay.start().await?;
        if let Some(gateway) = &self.gateway {
            gateway.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(gateway) = &self.gateway {
            gateway.stop().await?;
        }
        self.overlay.stop().await
    }

    async fn stats(&self) -> Result<ControlResponse> {
        let mut stats = self.overlay.stats().await?;
        if let Some(gateway) = &self.gateway {
            let g = gateway.stats().await?;
            stats.drops_unknown_route = g.drops_unknown_route;
            stats.drops_no_socket = g.drops_no_socket;
        }
        Ok(ControlResponse::Stats {
            identity: self.overlay.identity(),
            stats,
        })
    }
}

/// Running control socket. Dropping it leaves the task running; call
/// [`shutdown`](Self::shutdown).
#[derive(Debug)]
pub struct ControlServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ControlServer {
    pub async fn bind(addr: SocketAddr, target: ControlTarget) -> Result<Self> {
        if !addr.ip().is_loopback() {
            return Err(ControlError::NotLoopback(addr).into());
        }
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind control socket on {addr}"))?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "control channel listening");
        let task = tokio::spawn(serve(socket, target));
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

async fn serve(socket: UdpSocket, target: ControlTarget) {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "control recv error");
                continue;
            }
        };
        let response = match deserialize_bounded::<ControlRequest>(&buf[..len]) {
            Ok(request) => {
                debug!(from = %from, request = ?request, "control request");
                target.handle(request).await
            }
            Err(e) => ControlResponse::Error {
                message: ControlError::Malformed(e.to_string()).to_string(),
            },
        };
        match serialize_bounded(&response) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, from).await {
                    debug!(to = %from, error = %e, "control reply failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode control response"),
        }
    }
}

/// Send one request to a control socket and wait for the answer.
pub async fn control_request(
    addr: SocketAddr,
    request: &ControlRequest,
    timeout: Duration,
) -> Result<ControlResponse> {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
    let bytes = serialize_bounded(request).context("failed to encode control request")?;
    socket.send_to(&bytes, addr).await?;
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    let (len, from) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .context("control request timed out")??;
    if from != addr {
        bail!("control reply from unexpected address {from}");
    }
    deserialize_bounded(&buf[..len]).context("malformed control response")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::circuit::OverlayConfig;
    use crate::events::EventBus;
    use crate::gateway::GatewayConfig;
    use crate::identity::Identity;

    async fn node() -> (ControlServer, OverlayHandle, GatewayHandle) {
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = OverlayConfig {
            circuit_length: 1,
            target_circuits: 0,
            ..Default::default()
        };
        let (overlay, returns) = OverlayHandle::bind(config, Identity::from_bytes([5; 32]), loopback, EventBus::default())
            .await
            .unwrap();
        let gateway = GatewayHandle::bind(
            GatewayConfig::default(),
            loopback,
            Arc::new(overlay.clone()),
            returns,
            overlay.watch_ready(),
            EventBus::default(),
        )
        .await
        .unwrap();
        let target = ControlTarget {
            overlay: overlay.clone(),
            gateway: Some(gateway.clone()),
        };
        let server = ControlServer::bind(loopback, target).await.unwrap();
        (server, overlay, gateway)
    }

    async fn ask(server: &ControlServer, request: ControlRequest) -> ControlResponse {
        control_request(server.local_addr(), &request, DEFAULT_CONTROL_TIMEOUT)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn answers_queries() {
        let (server, overlay, _gateway) = node().await;
        assert_eq!(
            ask(&server, ControlRequest::IsOnline).await,
            ControlResponse::Online { online: false }
        );
        assert_eq!(
            ask(&server, ControlRequest::ListCircuits).await,
            ControlResponse::Circuits { circuits: vec![] }
        );
        match ask(&server, ControlRequest::Stats).await {
            ControlResponse::Stats { identity, stats } => {
                assert_eq!(identity, overlay.identity());
                assert_eq!(stats.active_circuits, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn create_circuit_returns_its_id() {
        let (server, _overlay, _gateway) = node().await;
        let first_hop: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let ControlResponse::CircuitCreated { circuit_id } =
            ask(&server, ControlRequest::CreateCircuit { first_hop }).await
        else {
            panic!("no circuit id");
        };
        let ControlResponse::Circuits { circuits } = ask(&server, ControlRequest::ListCircuits).await else {
            panic!("no circuit list");
        };
        assert_eq!(circuits.len(), 1);
        assert_eq!(circuits[0].circuit_id, circuit_id);
        assert!(circuits[0].hops.is_empty());
        server.shutdown();
    }

    #[tokio::test]
    async fn stop_and_start_toggle_the_gateway() {
        let (server, _overlay, gateway) = node().await;
        assert_eq!(ask(&server, ControlRequest::Stop).await, ControlResponse::Ack { ok: true });
        assert!(PortCheck::refused(gateway.local_addr()).await);
        assert_eq!(ask(&server, ControlRequest::Start).await, ControlResponse::Ack { ok: true });
        assert!(!PortCheck::refused(gateway.local_addr()).await);
        server.shutdown();
    }

    #[tokio::test]
    async fn garbage_gets_an_error() {
        let (server, _overlay, _gateway) = node().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&[0xff; 3], server.local_addr()).await.unwrap();
        let mut buf = vec![0u8; 1024];
        let (n, _) = tokio::time::timeout(DEFAULT_CONTROL_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response: ControlResponse = deserialize_bounded(&buf[..n]).unwrap();
        assert!(matches!(response, ControlResponse::Error { .. }));
        server.shutdown();
    }

    #[tokio::test]
    async fn refuses_non_loopback_bind() {
        let (overlay, _returns) = OverlayHandle::bind(
            OverlayConfig::default(),
            Identity::from_bytes([6; 32]),
            "127.0.0.1:0".parse().unwrap(),
            EventBus::default(),
        )
        .await
        .unwrap();
        let target = ControlTarget {
            overlay,
            gateway: None,
        };
        let err = ControlServer::bind("0.0.0.0:0".parse().unwrap(), target)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ControlError>().is_some());
    }

    struct PortCheck;

    impl PortCheck {
        /// Whether connecting is refused, retrying briefly while the
        /// listener state settles.
        async fn refused(addr: SocketAddr) -> bool {
            let mut last = false;
            for _ in 0..50 {
                last = tokio::net::TcpStream::connect(addr).await.is_err();
                if last {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            last
        }
    }
}
