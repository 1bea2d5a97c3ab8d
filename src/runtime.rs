//! # Runtime
//!
//! [`Runtime`] owns every component of a node and is the only place they are
//! wired together:
//!
//! ```text
//!   SchedulerHandle ── SwarmTransport (external engine)
//!                   └─ HandleStore (<statedir>/handles)
//!   OverlayHandle ──── returns ──> GatewayHandle (SOCKS5, 127.0.0.1)
//!         ^                              |
//!         └──────── DataPlane ───────────┘
//!   ControlServer (127.0.0.1, UDP) ──> OverlayHandle + GatewayHandle
//!   EventBus ──> pump_events() ──> EventSink + Notifier
//! ```
//!
//! The event bus is drained only by [`Runtime::pump_events`], so notifier
//! callbacks always run on the caller's loop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control::{ControlServer, ControlTarget};
use crate::events::{Event, EventBus, EventSink, Notifier, SubscriptionId, Topic};
use crate::gateway::{GatewayHandle, GatewayStats};
use crate::handle::{DownloadHandle, Fingerprint, PerDir};
use crate::identity::Identity;
use crate::messages::OverlayStats;
use crate::overlay::OverlayHandle;
use crate::protocols::{HandleStore, SwarmTransport};
use crate::scheduler::{ActivityCounts, SchedulerHandle};

/// Point-in-time view of a node, logged by the binary on every telemetry tick.
#[derive(Clone, Debug, PartialEq)]
pub struct Telemetry {
    pub identity: Identity,
    pub ready_circuits: usize,
    pub overlay: OverlayStats,
    pub gateway: GatewayStats,
    pub handles: ActivityCounts,
    /// KiB/s, infinite when unlimited.
    pub max_rate: PerDir<f64>,
}

/// Collaborators a runtime cannot create itself.
pub struct RuntimeParts {
    pub identity: Identity,
    pub transport: Arc<dyn SwarmTransport>,
    pub store: Arc<dyn HandleStore>,
    pub sink: Arc<dyn EventSink>,
}

pub struct Runtime {
    config: Config,
    identity: Identity,
    scheduler: SchedulerHandle,
    overlay: OverlayHandle,
    gateway: GatewayHandle,
    control: Option<ControlServer>,
    events: EventBus,
    notifier: Notifier,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("identity", &self.identity)
            .field("overlay", &self.overlay.local_addr())
            .field("gateway", &self.gateway.local_addr())
            .field("control", &self.control.as_ref().map(ControlServer::local_addr))
            .finish()
    }
}

impl Runtime {
    /// Bind every socket and spawn every actor.
    ///
    /// The overlay listens on all interfaces; the SOCKS5 gateway and the
    /// control channel on loopback only. A control socket that cannot be
    /// bound is logged and skipped; any other bind failure is fatal.
    pub async fn start(config: Config, parts: RuntimeParts) -> Result<Self> {
        let RuntimeParts {
            identity,
            transport,
            store,
            sink,
        } = parts;
        let session = &config.session;
        let events = EventBus::default();

        let scheduler = SchedulerHandle::spawn(
            config.scheduler.clone(),
            config.rate.clone(),
            config.urm.clone(),
            transport,
            store,
        )
        .await
        .context("failed to start scheduler")?;

        let overlay_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), session.overlay_port);
        let (overlay, returns) = OverlayHandle::bind(config.overlay.clone(), identity, overlay_addr, events.clone())
            .await
            .context("failed to start overlay")?;

        let socks_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), session.socks_port);
        let gateway = GatewayHandle::bind(
            config.gateway.clone(),
            socks_addr,
            Arc::new(overlay.clone()),
            returns,
            overlay.watch_ready(),
            events.clone(),
        )
        .await
        .context("failed to start SOCKS5 gateway")?;

        let control_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), session.control_port);
        let target = ControlTarget {
            overlay: overlay.clone(),
            gateway: Some(gateway.clone()),
        };
        let control = match ControlServer::bind(control_addr, target).await {
            Ok(server) => Some(server),
            Err(e) => {
                warn!(addr = %control_addr, error = %e, "control channel unavailable");
                None
            }
        };

        info!(
            identity = %identity,
            overlay = %overlay.local_addr(),
            socks = %gateway.local_addr(),
            "node started"
        );

        Ok(Self {
            config,
            identity,
            scheduler,
            overlay,
            gateway,
            control,
            events,
            notifier: Notifier::new(),
            sink,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn overlay(&self) -> &OverlayHandle {
        &self.overlay
    }

    pub fn gateway(&self) -> &GatewayHandle {
        &self.gateway
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control.as_ref().map(ControlServer::local_addr)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(
        &mut self,
        topic: Topic,
        once: bool,
        callback: impl FnMut(&Event) + Send + 'static,
    ) -> SubscriptionId {
        self.notifier.subscribe(topic, once, callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    /// Queue a handle and announce it on the bus.
    pub async fn add_handle(&self, handle: DownloadHandle) -> Result<usize> {
        let fingerprint = handle.fingerprint();
        let index = self.scheduler.add(handle).await?;
        self.events
            .emit(Topic::HandleAdded, format!("{fingerprint} at {index}"));
        Ok(index)
    }

    pub async fn remove_handles(&self, selection: Vec<usize>, delete_files: bool) -> Result<Vec<Fingerprint>> {
        let removed = self.scheduler.remove(selection, delete_files).await?;
        for fingerprint in &removed {
            self.events.emit(Topic::HandleRemoved, fingerprint.to_hex());
        }
        Ok(removed)
    }

    /// Drain the bus into the sink and fire subscribed callbacks. Returns
    /// how many events were delivered.
    pub fn pump_events(&mut self) -> usize {
        let events = self.events.drain();
        for event in &events {
            self.sink.deliver(event);
            self.notifier.notify(event);
        }
        events.len()
    }

    pub async fn telemetry(&self) -> Result<Telemetry> {
        let snapshot = self.scheduler.snapshot().await?;
        let gateway = self.gateway.stats().await?;
        let mut overlay = self.overlay.stats().await?;
        overlay.drops_unknown_route = gateway.drops_unknown_route;
        overlay.drops_no_socket = gateway.drops_no_socket;
        let telemetry = Telemetry {
            identity: self.identity,
            ready_circuits: self.overlay.ready_count(),
            overlay,
            gateway,
            handles: snapshot.counts,
            max_rate: snapshot.max_rate,
        };
        self.events.emit(
            Topic::Stats,
            format!(
                "circuits={} relays={} handles={}",
                telemetry.ready_circuits,
                telemetry.overlay.relay_rules,
                telemetry.handles.active + telemetry.handles.inactive
            ),
        );
        Ok(telemetry)
    }

    /// Stop accepting clients, persist the queue and stop every actor.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        if let Some(control) = self.control.take() {
            control.shutdown();
        }
        self.gateway.quit().await;
        self.scheduler.quit().await;
        self.overlay.quit().await;
        let delivered = self.pump_events();
        debug!(delivered, "final events delivered");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::SessionConfig;
    use crate::events::RecordingSink;
    use crate::protocols::DetachedTransport;
    use crate::store::MemoryStore;

    fn loopback_config() -> Config {
        let mut session = SessionConfig::with_statedir("/nonexistent");
        session.overlay_port = 0;
        session.socks_port = 0;
        session.control_port = 0;
        Config::from_session(session)
    }

    async fn runtime(sink: Arc<RecordingSink>, store: Arc<MemoryStore>) -> Runtime {
        Runtime::start(
            loopback_config(),
            RuntimeParts {
                identity: Identity::from_bytes([8; 32]),
                transport: Arc::new(DetachedTransport),
                store,
                sink,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn handle_events_reach_sink_and_subscribers() {
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(MemoryStore::new());
        let mut rt = runtime(sink.clone(), store.clone()).await;

        let added = Arc::new(AtomicUsize::new(0));
        let counter = added.clone();
        rt.subscribe(Topic::HandleAdded, true, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let fp = Fingerprint::from_bytes([1; 20]);
        assert_eq!(rt.add_handle(DownloadHandle::new(fp, vec![])).await.unwrap(), 0);
        rt.add_handle(DownloadHandle::new(Fingerprint::from_bytes([2; 20]), vec![]))
            .await
            .unwrap();
        assert_eq!(rt.remove_handles(vec![0], false).await.unwrap(), vec![fp]);
        rt.pump_events();

        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(Topic::HandleAdded), 2);
        assert_eq!(sink.count(Topic::HandleRemoved), 1);

        rt.shutdown().await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn telemetry_reports_an_idle_node() {
        let sink = Arc::new(RecordingSink::new());
        let mut rt = runtime(sink.clone(), Arc::new(MemoryStore::new())).await;
        assert!(rt.control_addr().is_some());

        let t = rt.telemetry().await.unwrap();
        assert_eq!(t.identity, rt.identity());
        assert_eq!(t.ready_circuits, 0);
        assert_eq!(t.overlay.active_circuits, 0);
        assert!(!t.gateway.accepting);
        assert_eq!(t.handles, ActivityCounts::default());

        rt.pump_events();
        assert_eq!(sink.count(Topic::Stats), 1);
        rt.shutdown().await;
    }
}
