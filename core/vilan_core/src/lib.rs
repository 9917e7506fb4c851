//! Virtual LAN Peer Core
//!
//! This crate provides the peer side of a virtual Ethernet overlay:
//! - Frame codec for the control and data channels
//! - Control session with the rendezvous server (registration, heartbeats,
//!   directory, neighbor discovery, configuration push, routes)
//! - NAT traversal engine that upgrades relayed traffic to direct links
//! - Connection handlers gluing transports to the components above
//!
//! ```text
//!   virtual interface ──► ControlSession::post_tuntap_data
//!                              │
//!                 direct link? ├──► NatTraversal ──► peer (UDP)
//!                              └──► server connection ──► relay
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod addr;
pub mod codec;
pub mod completion;
pub mod config;
pub mod crypto;
pub mod device;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod medium;
pub mod nat;
pub mod probe;
pub mod protocol;
pub mod session;
pub mod state;
pub mod stats;
pub mod transport;
pub mod worker;

pub use addr::{IpNet, PeerId};
pub use codec::{FrameCodec, FrameContext};
pub use config::{AppConfig, ConfigStore, JsonFileStore, MemoryStore};
pub use device::{NullDevice, VirtualDevice};
pub use error::{Error, Outcome, Result};
pub use medium::{LinkSample, LinkSampler, SysLinkSampler};
pub use nat::NatTraversal;
pub use session::{ControlSession, SessionParts};
pub use state::{PeerState, StateCell};
pub use transport::{SocketTransport, Transport};
