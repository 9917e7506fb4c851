//! Peer identities and virtual network addresses
//!
//! Every member of the overlay is identified by its 48-bit hardware address,
//! carried in the low six bytes of a `u64` (first octet in the lowest byte).

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Mask covering the six meaningful bytes of a hardware address
const MAC_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Group (I/G) bit of the first octet
const GROUP_BIT: u64 = 0x01;

// ============================================================================
// PeerId
// ============================================================================

/// 48-bit hardware address identifying a peer
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Ethernet broadcast address
    pub const BROADCAST: PeerId = PeerId(MAC_MASK);

    /// Unassigned identity (the server picks one when registering)
    pub const UNASSIGNED: PeerId = PeerId(0);

    /// Build an identity from the six octets of a hardware address
    pub fn from_octets(octets: [u8; 6]) -> Self {
        let mut raw = [0u8; 8];
        raw[..6].copy_from_slice(&octets);
        PeerId(u64::from_le_bytes(raw))
    }

    /// The six octets of the hardware address, first octet first
    pub fn octets(&self) -> [u8; 6] {
        let raw = self.0.to_le_bytes();
        [raw[0], raw[1], raw[2], raw[3], raw[4], raw[5]]
    }

    /// True for individual addresses (neither broadcast nor group)
    pub fn is_unicast(&self) -> bool {
        self.0 & GROUP_BIT == 0
    }

    pub fn is_unassigned(&self) -> bool {
        self.0 & MAC_MASK == 0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.octets();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(format!("invalid hardware address: {}", s));
        }
        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid hardware address: {}", s))?;
        }
        Ok(PeerId::from_octets(octets))
    }
}

// ============================================================================
// IpNet
// ============================================================================

/// IPv4 address with its prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpNet {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl IpNet {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        IpNet {
            addr,
            prefix_len: prefix_len.min(32),
        }
    }

    /// Network mask for the prefix
    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_mask(self.prefix_len))
    }

    /// Network address (host bits cleared)
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & prefix_mask(self.prefix_len))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = prefix_mask(self.prefix_len);
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }

    /// An address usable as an interface address
    pub fn is_assignable(&self) -> bool {
        !self.addr.is_unspecified() && !self.addr.is_broadcast() && self.prefix_len > 0
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

fn prefix_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => u32::MAX << (32 - n),
    }
}

// ============================================================================
// Tests
// ============================================================================
