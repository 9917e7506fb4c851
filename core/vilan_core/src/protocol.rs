//! Wire messages
//!
//! Two independent families share the same sockets:
//!
//! - **Control** frames travel between a peer and the rendezvous server
//!   (registration, heartbeats, directory, traversal brokering, config push).
//! - **Data** frames carry Ethernet payloads (relayed through the server or
//!   sent over a direct link) and the direct-link handshake (try/ping/pong).
//!
//! Both are serialized with bincode; the codec prefixes each family with a
//! distinct two-byte tag so a receiver can tell them apart.

use std::net::{Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::addr::{IpNet, PeerId};

// ============================================================================
// Shared Types
// ============================================================================

/// Physical medium the peer reaches the network through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkMode {
    #[default]
    Unknown,
    Ethernet,
    Wifi,
    Cellular,
}

/// Kind of virtual interface a peer runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DevType {
    #[default]
    Tap,
    Tun,
}

/// Cumulative traffic counters, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub relay_send: u64,
    pub relay_receive: u64,
    pub direct_send: u64,
    pub direct_receive: u64,
}

/// A group member as reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub name: String,
    pub dev_type: DevType,
    /// Virtual address inside the overlay
    pub net_addr: IpNet,
    /// Address on the peer's own LAN
    pub inner_addr: Option<IpNet>,
    pub online: bool,
    pub link_mode: LinkMode,
    pub link_quality: u32,
    pub stats: Statistics,
}

/// A neighbor on a peer's local segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub addr: Ipv4Addr,
}

// ============================================================================
// Control Family
// ============================================================================

/// Registration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub peer_name: String,
    pub group: String,
    /// Obfuscated group credential
    pub credential: String,
    pub os: String,
    pub link_mode: LinkMode,
    pub link_quality: u32,
    pub dev_type: DevType,
    /// Ask the server to assign a hardware address
    pub auto_mac: bool,
    pub peer_mac: PeerId,
    /// Ask the server to assign a virtual IP
    pub auto_ip: bool,
    pub peer_addr: Option<IpNet>,
    pub inner_addr: Option<IpNet>,
}

/// Registration response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAck {
    /// Non-negative on success, see `AuthFailure` for the rest
    pub result: i32,
    pub token: u32,
    pub assign_mac: bool,
    pub peer_mac: PeerId,
    pub assign_ip: bool,
    pub peer_addr: Option<IpNet>,
    /// This peer's address as observed by the server
    pub extern_sock: Option<SocketAddr>,
}

/// Deregistration notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnAuth {
    pub peer_mac: PeerId,
    pub group: String,
    pub token: u32,
}

/// Heartbeat carrying link quality and traffic counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub peer_name: String,
    pub peer_addr: Option<IpNet>,
    pub inner_addr: Option<IpNet>,
    pub link_mode: LinkMode,
    pub link_quality: u32,
    pub stats: Statistics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub extern_sock: Option<SocketAddr>,
}

/// "Ready to punch towards `dst`"; relayed by the server to `dst` as well
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2PTrigger {
    pub src: PeerId,
    pub dst: PeerId,
}

/// Server verdict for a punch attempt with the peer's external socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2PAck {
    pub peer_id: PeerId,
    pub valid: bool,
    pub other_extern: Option<SocketAddr>,
}

/// Peer went online or offline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStateChange {
    pub peer_id: PeerId,
    pub online: bool,
    pub info: Option<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPeersRequest {
    pub src: PeerId,
    pub group: String,
}

/// One page of the group directory; pages of one snapshot share a cookie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPeersResponse {
    pub cookie: u32,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLinksRequest {
    pub src: PeerId,
    pub dst: PeerId,
}

/// One page of a peer's local neighbors; pages of one answer share a cookie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLinksResponse {
    pub src: PeerId,
    pub dst: PeerId,
    pub cookie: u32,
    pub links: Vec<LinkInfo>,
}

/// Remote configuration change request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub src: PeerId,
    pub dst: PeerId,
    pub peer_name: Option<String>,
    pub inner_addr: Option<IpNet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAck {
    pub src: PeerId,
    pub dst: PeerId,
    pub ok: bool,
    pub tip: String,
}

/// Control message bodies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Auth(AuthRequest),
    AuthAck(AuthAck),
    UnAuth(UnAuth),
    Ping(Ping),
    Pong(Pong),
    P2PTrigger(P2PTrigger),
    P2PAck(P2PAck),
    StateChanged(PeerStateChange),
    GroupPeersRequest(GroupPeersRequest),
    GroupPeersResponse(GroupPeersResponse),
    PeerLinksRequest(PeerLinksRequest),
    PeerLinksResponse(PeerLinksResponse),
    Config(ConfigUpdate),
    ConfigAck(ConfigAck),
}

impl ControlMessage {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Auth(_) => "auth",
            ControlMessage::AuthAck(_) => "auth-ack",
            ControlMessage::UnAuth(_) => "unauth",
            ControlMessage::Ping(_) => "ping",
            ControlMessage::Pong(_) => "pong",
            ControlMessage::P2PTrigger(_) => "p2p-trigger",
            ControlMessage::P2PAck(_) => "p2p-ack",
            ControlMessage::StateChanged(_) => "state-changed",
            ControlMessage::GroupPeersRequest(_) => "group-peers-request",
            ControlMessage::GroupPeersResponse(_) => "group-peers-response",
            ControlMessage::PeerLinksRequest(_) => "peer-links-request",
            ControlMessage::PeerLinksResponse(_) => "peer-links-response",
            ControlMessage::Config(_) => "config",
            ControlMessage::ConfigAck(_) => "config-ack",
        }
    }
}

/// Control frame: sender identity, session token and body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    pub peer_id: PeerId,
    pub token: u32,
    pub body: ControlMessage,
}

impl ControlFrame {
    pub fn new(peer_id: PeerId, token: u32, body: ControlMessage) -> Self {
        ControlFrame {
            peer_id,
            token,
            body,
        }
    }
}

// ============================================================================
// Data Family
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    /// Ethernet payload
    Packet,
    /// Direct-link handshake probe
    P2PTry,
    Ping,
    Pong,
}

/// Data frame; a token of zero marks direct-link traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    pub kind: DataKind,
    pub src: PeerId,
    pub dst: PeerId,
    pub token: u32,
    pub data: Vec<u8>,
}

impl DataFrame {
    pub fn packet(src: PeerId, dst: PeerId, data: Vec<u8>) -> Self {
        DataFrame {
            kind: DataKind::Packet,
            src,
            dst,
            token: 0,
            data,
        }
    }

    /// Handshake or keepalive frame without payload
    pub fn signal(kind: DataKind, src: PeerId, dst: PeerId) -> Self {
        DataFrame {
            kind,
            src,
            dst,
            token: 0,
            data: Vec::new(),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.token == 0
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Any message that can travel on a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Data(DataFrame),
}

impl From<ControlFrame> for Frame {
    fn from(frame: ControlFrame) -> Self {
        Frame::Control(frame)
    }
}

impl From<DataFrame> for Frame {
    fn from(frame: DataFrame) -> Self {
        Frame::Data(frame)
    }
}
