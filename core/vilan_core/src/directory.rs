//! Cached view of the group's members
//!
//! Refreshed from directory responses (cookie-tagged pages) and from
//! online/offline notices. Each entry also notes whether a direct link to the
//! member is currently up.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::addr::PeerId;
use crate::protocol::PeerInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub info: PeerInfo,
    /// Traffic to this peer uses a direct link
    pub direct: bool,
}

#[derive(Default)]
struct Inner {
    cookie: Option<u32>,
    peers: HashMap<PeerId, DirectoryEntry>,
}

#[derive(Default)]
pub struct Directory {
    inner: RwLock<Inner>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn find(&self, peer: PeerId) -> Option<DirectoryEntry> {
        self.read().peers.get(&peer).cloned()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.read().peers.contains_key(&peer)
    }

    pub fn len(&self) -> usize {
        self.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().peers.is_empty()
    }

    /// Entries sorted by peer id
    pub fn snapshot(&self) -> Vec<DirectoryEntry> {
        let mut entries: Vec<DirectoryEntry> = self.read().peers.values().cloned().collect();
        entries.sort_by_key(|e| e.info.peer_id);
        entries
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        inner.peers.clear();
        inner.cookie = None;
    }

    /// Merge one response page; a page from a new snapshot replaces the view
    pub fn merge_response(&self, cookie: u32, peers: Vec<PeerInfo>) {
        let mut inner = self.write();
        if inner.cookie != Some(cookie) {
            inner.peers.clear();
            inner.cookie = Some(cookie);
        }
        for info in peers {
            upsert(&mut inner.peers, info);
        }
    }

    /// Apply an online/offline notice
    pub fn apply_state_change(&self, peer: PeerId, online: bool, info: Option<PeerInfo>) {
        let mut inner = self.write();
        match (online, info) {
            (true, Some(info)) => upsert(&mut inner.peers, info),
            _ => {
                if let Some(entry) = inner.peers.get_mut(&peer) {
                    entry.info.online = online;
                    entry.direct = false;
                }
            }
        }
    }

    /// Record whether traffic to `peer` goes over a direct link
    pub fn set_direct(&self, peer: PeerId, direct: bool) {
        if let Some(entry) = self.write().peers.get_mut(&peer) {
            entry.direct = direct;
        }
    }
}

fn upsert(peers: &mut HashMap<PeerId, DirectoryEntry>, info: PeerInfo) {
    let direct = peers.get(&info.peer_id).map_or(false, |e| e.direct);
    peers.insert(info.peer_id, DirectoryEntry { info, direct });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::IpNet;
    use crate::protocol::{DevType, LinkMode, Statistics};
    use std::net::Ipv4Addr;

    fn info(id: u64, name: &str) -> PeerInfo {
        PeerInfo {
            peer_id: PeerId(id),
            name: name.into(),
            dev_type: DevType::Tap,
            net_addr: IpNet::new(Ipv4Addr::new(10, 0, 0, id as u8), 24),
            inner_addr: None,
            online: true,
            link_mode: LinkMode::Ethernet,
            link_quality: 100,
            stats: Statistics::default(),
        }
    }

    #[test]
    fn test_same_cookie_merges() {
        let dir = Directory::new();
        dir.merge_response(1, vec![info(2, "a")]);
        dir.merge_response(1, vec![info(4, "b")]);
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_new_cookie_replaces() {
        let dir = Directory::new();
        dir.merge_response(1, vec![info(2, "a"), info(4, "b")]);
        dir.merge_response(2, vec![info(6, "c")]);
        assert_eq!(dir.len(), 1);
        assert!(dir.contains(PeerId(6)));
        assert!(!dir.contains(PeerId(2)));
    }

    #[test]
    fn test_state_change_online_and_offline() {
        let dir = Directory::new();
        dir.apply_state_change(PeerId(2), true, Some(info(2, "a")));
        dir.set_direct(PeerId(2), true);
        assert!(dir.find(PeerId(2)).unwrap().direct);

        dir.apply_state_change(PeerId(2), false, None);
        let entry = dir.find(PeerId(2)).unwrap();
        assert!(!entry.info.online);
        assert!(!entry.direct);

        // Offline notice for an unknown peer is ignored
        dir.apply_state_change(PeerId(8), false, None);
        assert!(!dir.contains(PeerId(8)));
    }

    #[test]
    fn test_refresh_keeps_direct_flag() {
        let dir = Directory::new();
        dir.merge_response(1, vec![info(2, "a")]);
        dir.set_direct(PeerId(2), true);
        dir.merge_response(1, vec![info(2, "renamed")]);
        let entry = dir.find(PeerId(2)).unwrap();
        assert!(entry.direct);
        assert_eq!(entry.info.name, "renamed");
    }

    #[test]
    fn test_clear_and_snapshot_order() {
        let dir = Directory::new();
        dir.merge_response(1, vec![info(6, "c"), info(2, "a"), info(4, "b")]);
        let ids: Vec<u64> = dir.snapshot().iter().map(|e| e.info.peer_id.0).collect();
        assert_eq!(ids, vec![2, 4, 6]);
        dir.clear();
        assert!(dir.is_empty());
    }
}
