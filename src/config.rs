//! # Configuration
//!
//! Tunables are plain structs with `Default` impls, one per component, each
//! defined next to the code it tunes. This module gathers them into
//! [`Config`] and defines [`SessionConfig`], the part persisted to
//! `<statedir>/sessconfig`.
//!
//! | Struct | Module |
//! |--------|--------|
//! | [`RateConfig`] | `ratecontrol` |
//! | [`UrmConfig`] | `urm` |
//! | [`SchedulerConfig`] | `scheduler` |
//! | [`OverlayConfig`] | `circuit` |
//! | [`GatewayConfig`] | `gateway` |
//!
//! Command-line flags arrive as [`SessionOverrides`]; set fields replace the
//! persisted values and the merged session is written back.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::circuit::OverlayConfig;
use crate::gateway::GatewayConfig;
use crate::ratecontrol::RateConfig;
use crate::scheduler::SchedulerConfig;
use crate::urm::UrmConfig;

pub const DEFAULT_STATEDIR: &str = ".swarmgate";
pub const DEFAULT_OVERLAY_PORT: u16 = 7759;
pub const DEFAULT_TRANSPORT_PORT: u16 = 7760;
pub const DEFAULT_SOCKS_PORT: u16 = 1080;
pub const DEFAULT_CONTROL_PORT: u16 = 1081;

pub const SESSCONFIG_FILE: &str = "sessconfig";
pub const KEYPAIR_FILE: &str = "keypair";
pub const HANDLES_DIR: &str = "handles";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub statedir: PathBuf,
    pub install_dir: Option<PathBuf>,
    /// Overlay UDP port.
    pub overlay_port: u16,
    /// Swarm transport listen port, handed to the external engine.
    pub transport_port: u16,
    pub manhole_port: Option<u16>,
    pub restapi_port: Option<u16>,
    pub socks_port: u16,
    pub control_port: u16,
    pub bootstrap: Vec<SocketAddr>,
    pub hops: usize,
    pub circuits: usize,
    pub exit_capable: bool,
    /// Start extra queued handles while the upload budget sits idle.
    pub urm: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let overlay = OverlayConfig::default();
        Self {
            statedir: PathBuf::from(DEFAULT_STATEDIR),
            install_dir: None,
            overlay_port: DEFAULT_OVERLAY_PORT,
            transport_port: DEFAULT_TRANSPORT_PORT,
            manhole_port: None,
            restapi_port: None,
            socks_port: DEFAULT_SOCKS_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            bootstrap: Vec::new(),
            hops: overlay.circuit_length,
            circuits: overlay.target_circuits,
            exit_capable: overlay.exit_capable,
            urm: UrmConfig::default().enabled,
        }
    }
}

impl SessionConfig {
    pub fn with_statedir(statedir: impl Into<PathBuf>) -> Self {
        Self {
            statedir: statedir.into(),
            ..Self::default()
        }
    }

    pub fn sessconfig_path(&self) -> PathBuf {
        self.statedir.join(SESSCONFIG_FILE)
    }

    pub fn keypair_path(&self) -> PathBuf {
        self.statedir.join(KEYPAIR_FILE)
    }

    pub fn handles_dir(&self) -> PathBuf {
        self.statedir.join(HANDLES_DIR)
    }

    pub fn statedir(&self) -> &Path {
        &self.statedir
    }
}

/// Values given on the command line or in the environment.
#[derive(Clone, Debug, Default)]
pub struct SessionOverrides {
    pub overlay_port: Option<u16>,
    pub transport_port: Option<u16>,
    pub manhole_port: Option<u16>,
    pub restapi_port: Option<u16>,
    pub socks_port: Option<u16>,
    pub control_port: Option<u16>,
    pub bootstrap: Vec<SocketAddr>,
    pub hops: Option<usize>,
    pub circuits: Option<usize>,
    pub exit_capable: Option<bool>,
    pub urm: Option<bool>,
}

impl SessionOverrides {
    pub fn apply(&self, session: &mut SessionConfig) {
        if let Some(port) = self.overlay_port {
            session.overlay_port = port;
        }
        if let Some(port) = self.transport_port {
            session.transport_port = port;
        }
        if self.manhole_port.is_some() {
            session.manhole_port = self.manhole_port;
        }
        if self.restapi_port.is_some() {
            session.restapi_port = self.restapi_port;
        }
        if let Some(port) = self.socks_port {
            session.socks_port = port;
        }
        if let Some(port) = self.control_port {
            session.control_port = port;
        }
        if !self.bootstrap.is_empty() {
            session.bootstrap = self.bootstrap.clone();
        }
        if let Some(hops) = self.hops {
            session.hops = hops.max(1);
        }
        if let Some(circuits) = self.circuits {
            session.circuits = circuits;
        }
        if let Some(exit) = self.exit_capable {
            session.exit_capable = exit;
        }
        if let Some(urm) = self.urm {
            session.urm = urm;
        }
    }
}

/// Every tunable of a node.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub session: SessionConfig,
    pub rate: RateConfig,
    pub urm: UrmConfig,
    pub scheduler: SchedulerConfig,
    pub overlay: OverlayConfig,
    pub gateway: GatewayConfig,
}

impl Config {
    /// Derive component configs from a session, keeping other defaults.
    pub fn from_session(session: SessionConfig) -> Self {
        let mut config = Self {
            session,
            ..Self::default()
        };
        config.sync_from_session();
        config
    }

    pub fn sync_from_session(&mut self) {
        self.overlay.circuit_length = self.session.hops.max(1);
        self.overlay.target_circuits = self.session.circuits;
        self.overlay.exit_capable = self.session.exit_capable;
        self.overlay.bootstrap = self.session.bootstrap.clone();
        self.urm.enabled = self.session.urm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_ports() {
        let s = SessionConfig::default();
        assert_eq!(s.socks_port, 1080);
        assert_eq!(s.control_port, 1081);
        assert_eq!(s.hops, 3);
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let mut s = SessionConfig::with_statedir("/tmp/sg");
        s.restapi_port = Some(8085);
        let overrides = SessionOverrides {
            socks_port: Some(2080),
            hops: Some(0),
            exit_capable: Some(true),
            ..Default::default()
        };
        overrides.apply(&mut s);
        assert_eq!(s.socks_port, 2080);
        assert_eq!(s.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(s.restapi_port, Some(8085));
        assert_eq!(s.hops, 1);
        assert!(s.exit_capable);
    }

    #[test]
    fn config_follows_session() {
        let mut s = SessionConfig::with_statedir("/tmp/sg");
        s.hops = 2;
        s.circuits = 5;
        s.bootstrap = vec!["127.0.0.1:9000".parse().unwrap()];
        let c = Config::from_session(s);
        assert_eq!(c.overlay.circuit_length, 2);
        assert_eq!(c.overlay.target_circuits, 5);
        assert_eq!(c.overlay.bootstrap.len(), 1);
        assert!(!c.urm.enabled);
        assert_eq!(c.session.keypair_path(), PathBuf::from("/tmp/sg/keypair"));

        let mut s = SessionConfig::with_statedir("/tmp/sg");
        SessionOverrides { urm: Some(true), ..Default::default() }.apply(&mut s);
        assert!(Config::from_session(s).urm.enabled);
    }
}
