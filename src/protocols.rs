//! Seams between swarmgate and its external collaborators.
//!
//! The rate controller and the scheduler never talk to a BitTorrent engine,
//! a disk or a socket directly. They go through the traits below so the
//! binary can plug in real collaborators and the tests can plug in fakes.
//!
//! | Seam | Trait | Implemented by |
//! |------|-------|----------------|
//! | Swarm transport | [`SwarmTransport`] | the piece/peer engine (external) |
//! | Handle persistence | [`HandleStore`] | [`crate::store::FileStore`], [`crate::store::MemoryStore`] |
//! | Overlay data plane | [`DataPlane`] | [`crate::overlay::OverlayHandle`] |
//!
//! [`DetachedTransport`] stands in for the swarm engine when none is attached.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::handle::{Fingerprint, HandleRecord, HandleStatus, Priority, TransferTotals};
use crate::messages::Endpoint;

/// One handle's state as reported by the transport on a sampling tick.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportSample {
    pub fingerprint: Fingerprint,
    pub status: HandleStatus,
    pub peers: usize,
    pub totals: TransferTotals,
}

/// The engine that actually moves swarm bytes. Caps are in KiB/s, `0` meaning
/// unlimited; the engine must honour a new cap within one tick.
#[async_trait]
pub trait SwarmTransport: Send + Sync + 'static {
    /// Report every handle the transport currently runs.
    async fn sample(&self) -> Result<Vec<TransportSample>>;

    async fn apply_caps(&self, fingerprint: Fingerprint, up: f64, down: f64) -> Result<()>;

    async fn start(&self, fingerprint: Fingerprint, sources: &[String], priority: Priority)
    -> Result<()>;

    async fn stop(&self, fingerprint: Fingerprint) -> Result<()>;

    /// Shut a handle down for good, optionally deleting its files.
    async fn remove(&self, fingerprint: Fingerprint, delete_files: bool) -> Result<()>;
}

/// Keyed store for handle records. Calls block and are made from
/// `spawn_blocking`.
pub trait HandleStore: Send + Sync + 'static {
    fn load_all(&self) -> Result<Vec<HandleRecord>>;

    /// Replace the stored set with `records`.
    fn save_all(&self, records: &[HandleRecord]) -> Result<()>;

    fn delete(&self, fingerprint: Fingerprint) -> Result<()>;
}

/// Entry point into the onion-routed overlay.
#[async_trait]
pub trait DataPlane: Send + Sync + 'static {
    /// Forward `payload` to `destination` through a ready circuit.
    async fn send_data(&self, destination: Endpoint, payload: Vec<u8>) -> Result<()>;
}

/// Swarm transport for a node running without a piece/peer engine. Reports
/// nothing and accepts every request, so handles stay queued with zero rates.
#[derive(Clone, Copy, Debug, Default)]
pub struct DetachedTransport;

#[async_trait]
impl SwarmTransport for DetachedTransport {
    async fn sample(&self) -> Result<Vec<TransportSample>> {
        Ok(Vec::new())
    }

    async fn apply_caps(&self, fingerprint: Fingerprint, up: f64, down: f64) -> Result<()> {
        debug!(handle = %fingerprint, up, down, "no swarm engine attached, cap ignored");
        Ok(())
    }

    async fn start(&self, fingerprint: Fingerprint, _sources: &[String], _priority: Priority) -> Result<()> {
        debug!(handle = %fingerprint, "no swarm engine attached, start ignored");
        Ok(())
    }

    async fn stop(&self, _fingerprint: Fingerprint) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _fingerprint: Fingerprint, _delete_files: bool) -> Result<()> {
        Ok(())
    }
}
