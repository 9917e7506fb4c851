//! Local-segment neighbor discovery
//!
//! A peer asked for its links harvests its neighbor (ARP) table, keeps the
//! addresses inside its own LAN subnet and answers in pages that share one
//! cookie. The requester accumulates pages in a cache guarded by a
//! read/write lock so a polling reader can watch it fill.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::addr::{IpNet, PeerId};
use crate::protocol::LinkInfo;

/// Neighbors per response page
pub const LINK_BATCH_SIZE: usize = 50;

/// Interval between cache polls while waiting for pages
pub const LINK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polls before giving up on more pages
pub const LINK_POLL_LIMIT: usize = 15;

// ============================================================================
// Neighbor Table
// ============================================================================

pub trait NeighborTable: Send + Sync {
    fn neighbors(&self) -> Vec<Ipv4Addr>;
}

/// Linux ARP cache (`/proc/net/arp`)
pub struct ProcArpTable {
    path: PathBuf,
}

impl ProcArpTable {
    pub fn new() -> Self {
        ProcArpTable {
            path: PathBuf::from("/proc/net/arp"),
        }
    }
}

impl Default for ProcArpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NeighborTable for ProcArpTable {
    fn neighbors(&self) -> Vec<Ipv4Addr> {
        match fs::read_to_string(&self.path) {
            Ok(text) => parse_arp_table(&text),
            Err(e) => {
                log::debug!("cannot read {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }
}

/// Complete entries of an ARP table dump (header line skipped)
pub fn parse_arp_table(text: &str) -> Vec<Ipv4Addr> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let ip = cols.next()?.parse::<Ipv4Addr>().ok()?;
            let flags = cols.nth(1)?;
            (flags != "0x0").then_some(ip)
        })
        .collect()
}

/// Neighbors inside `subnet`, split into response pages
pub fn collect_links(table: &dyn NeighborTable, subnet: Option<IpNet>) -> Vec<Vec<LinkInfo>> {
    let links: Vec<LinkInfo> = table
        .neighbors()
        .into_iter()
        .filter(|ip| subnet.map_or(true, |net| net.contains(*ip)))
        .map(|addr| LinkInfo { addr })
        .collect();
    links
        .chunks(LINK_BATCH_SIZE)
        .map(|page| page.to_vec())
        .collect()
}

// ============================================================================
// Link Cache
// ============================================================================

struct CachedLinks {
    cookie: u32,
    links: Vec<LinkInfo>,
}

/// Link pages received per peer
#[derive(Default)]
pub struct LinkCache {
    entries: RwLock<HashMap<PeerId, CachedLinks>>,
}

impl LinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PeerId, CachedLinks>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PeerId, CachedLinks>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn clear(&self, peer: PeerId) {
        self.write().remove(&peer);
    }

    /// A new cookie starts over; the current cookie appends
    pub fn merge(&self, peer: PeerId, cookie: u32, links: Vec<LinkInfo>) {
        let mut entries = self.write();
        match entries.get_mut(&peer) {
            Some(entry) if entry.cookie == cookie => entry.links.extend(links),
            _ => {
                entries.insert(peer, CachedLinks { cookie, links });
            }
        }
    }

    pub fn len(&self, peer: PeerId) -> usize {
        self.read().get(&peer).map_or(0, |e| e.links.len())
    }

    pub fn get(&self, peer: PeerId) -> Vec<LinkInfo> {
        self.read()
            .get(&peer)
            .map(|e| e.links.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARP: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
192.168.1.77     0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.20     0x1         0x2         aa:bb:cc:dd:ee:01     *        eth0
10.9.0.1         0x1         0x2         aa:bb:cc:dd:ee:02     *        eth1
";

    struct FixedTable(Vec<Ipv4Addr>);

    impl NeighborTable for FixedTable {
        fn neighbors(&self) -> Vec<Ipv4Addr> {
            self.0.clone()
        }
    }

    #[test]
    fn test_parse_arp_table() {
        assert_eq!(
            parse_arp_table(ARP),
            vec![
                Ipv4Addr::new(192, 168, 1, 1),
                Ipv4Addr::new(192, 168, 1, 20),
                Ipv4Addr::new(10, 9, 0, 1),
            ]
        );
        assert!(parse_arp_table("").is_empty());
    }

    #[test]
    fn test_collect_links_filters_and_pages() {
        let mut ips: Vec<Ipv4Addr> = (1..=120).map(|i| Ipv4Addr::new(192, 168, 1, i)).collect();
        ips.push(Ipv4Addr::new(10, 0, 0, 1));
        let table = FixedTable(ips);

        let pages = collect_links(&table, Some(IpNet::new(Ipv4Addr::new(192, 168, 1, 5), 24)));
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].len(), LINK_BATCH_SIZE);
        assert_eq!(pages[2].len(), 20);
        assert!(pages.iter().flatten().all(|l| l.addr.octets()[0] == 192));
    }

    #[test]
    fn test_collect_links_empty() {
        assert!(collect_links(&FixedTable(vec![]), None).is_empty());
    }

    #[test]
    fn test_link_cache_cookie_semantics() {
        let cache = LinkCache::new();
        let peer = PeerId(0x0000_1122_3344_5566);
        let link = |d| LinkInfo {
            addr: Ipv4Addr::new(192, 168, 1, d),
        };

        cache.merge(peer, 10, vec![link(1), link(2)]);
        cache.merge(peer, 10, vec![link(3)]);
        assert_eq!(cache.len(peer), 3);

        cache.merge(peer, 11, vec![link(9)]);
        assert_eq!(cache.get(peer), vec![link(9)]);

        cache.clear(peer);
        assert_eq!(cache.len(peer), 0);
        assert!(cache.get(peer).is_empty());
    }
}
