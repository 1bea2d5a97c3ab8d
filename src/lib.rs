//! # swarmgate - Swarm Rate Control and Anonymising SOCKS5 Gateway
//!
//! swarmgate runs two cooperating halves on one tokio runtime:
//!
//! - **Swarm control**: a fair-share Rate Controller that splits a global
//!   upload/download budget between download handles, a scheduler that
//!   queues, promotes and persists those handles, and an Upload Rate
//!   Maximiser that starts extra work when upload capacity sits idle.
//! - **Anonymity**: a SOCKS5 gateway whose UDP traffic is tunnelled through
//!   onion-style circuits built over a UDP overlay of peers.
//!
//! ## Architecture
//!
//! Stateful components follow the **Actor Pattern**:
//! - Each component (Scheduler, Overlay, Gateway) has a public Handle and a
//!   private Actor
//! - Handles are cheap to clone and talk to their actor over bounded channels
//! - Actors own all mutable state and process commands sequentially
//!
//! The protocol logic itself (rate passes, circuit state machine, SOCKS5
//! parsing, UDP route table) is sans-IO and tested without sockets.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `runtime` | Owns and wires every component |
//! | `handle` | Download handles, fingerprints, per-direction values |
//! | `ratecontrol` | Fair-share rate allocation passes |
//! | `urm` | Upload Rate Maximiser |
//! | `scheduler` | Download queue, promotion, persistence actor |
//! | `store` | Handle records and session config on disk |
//! | `protocols` | Trait seams: swarm transport, handle store, data plane |
//! | `socks5` | SOCKS5 wire codec and connection state machine |
//! | `udprelay` | SOCKS5 UDP association route table |
//! | `gateway` | SOCKS5 listener, TCP relay, UDP associations |
//! | `circuit` | Sans-IO overlay: circuits, relay rules, exits, peers |
//! | `overlay` | Overlay actor owning the UDP socket and exit sockets |
//! | `messages` | Overlay frames and control channel types |
//! | `control` | Loopback UDP control channel |
//! | `events` | Bounded event bus, topic notifier, sinks |
//! | `identity` | Ed25519 keypair and node identity |
//! | `config` | Session config and tunables |

pub mod circuit;
pub mod config;
pub mod control;
pub mod events;
pub mod gateway;
pub mod handle;
pub mod identity;
pub mod messages;
pub mod overlay;
pub mod protocols;
pub mod ratecontrol;
pub mod runtime;
pub mod scheduler;
pub mod socks5;
pub mod store;
pub mod udprelay;
pub mod urm;

pub use config::{Config, SessionConfig, SessionOverrides};
pub use control::{ControlServer, ControlTarget, control_request};
pub use events::{Event, EventBus, EventSink, Notifier, NullSink, RecordingSink, Topic};
pub use gateway::{GatewayConfig, GatewayHandle};
pub use handle::{Direction, DownloadHandle, Fingerprint, HandleStatus, PerDir, Priority};
pub use identity::{Identity, Keypair};
pub use messages::{ControlRequest, ControlResponse, Endpoint, OverlayStats};
pub use overlay::OverlayHandle;
pub use protocols::{DataPlane, DetachedTransport, HandleStore, SwarmTransport, TransportSample};
pub use runtime::{Runtime, RuntimeParts, Telemetry};
pub use scheduler::{MoveDirection, SchedulerHandle};
pub use store::{FileStore, MemoryStore};
