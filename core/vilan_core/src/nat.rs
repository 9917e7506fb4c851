//! NAT traversal engine
//!
//! Negotiates direct UDP links between peers with the rendezvous server's
//! help and keeps them alive.
//!
//! # Punch Protocol
//!
//! ```text
//! Peer A                      Server                       Peer B
//!   │── P2PTrigger(A→B) ─────►│ (punch socket)               │
//!   │                         │──── P2PTrigger(A→B) ────────►│
//!   │                         │◄─── P2PTrigger(B→A) ─────────│ (punch socket)
//!   │◄─ P2PAck(B's socket) ───│──── P2PAck(A's socket) ─────►│
//!   │                                                        │
//!   │═══════════ P2PTry (pending link, same local port) ════►│
//!   │◄══════════ P2PTry ═════════════════════════════════════│
//!   │             both sides promote pending → active        │
//! ```
//!
//! # Registries
//!
//! Punch sockets, pending links, active links and failure records live in
//! lock-striped shards keyed by peer id. All four maps for one peer sit in
//! the same shard, so per-peer transitions (promotion, eviction) are atomic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use crate::addr::PeerId;
use crate::codec::MAX_PEER_FRAME_LEN;
use crate::config::AppConfig;
use crate::device::VirtualDevice;
use crate::directory::Directory;
use crate::error::TraversalError;
use crate::handler::{PeerLinkHandler, PunchHandler};
use crate::protocol::{ControlFrame, ControlMessage, DataFrame, DataKind, P2PAck, P2PTrigger};
use crate::transport::{ConnectOptions, Connection, Transport};
use crate::worker::{Worker, MAINTENANCE_INTERVAL};

// ============================================================================
// Constants
// ============================================================================

/// Read-idle interval of a direct link (a ping follows)
pub const LINK_HEARTBEAT: Duration = Duration::from_secs(5);

/// Silence after which a direct link is evicted
pub const LINK_OFFLINE: Duration = Duration::from_secs(15);

/// Grace on top of the heartbeat before extra pings are sent
pub const LINK_GRACE: Duration = Duration::from_secs(2);

/// Extra pings tolerated before a silent link is evicted
pub const MAX_MISSED_PINGS: u32 = 3;

const SHARD_COUNT: usize = 16;

// ============================================================================
// Settings
// ============================================================================

/// Traversal tuning, derived from the application configuration
#[derive(Debug, Clone)]
pub struct P2pSettings {
    /// Probes sent on a pending link before it is abandoned
    pub try_count: u32,
    /// Backoff after a failure
    pub retry_interval: Duration,
    /// Failures after which traversal to a peer stops
    pub max_failures: u32,
    /// Lifetime of a punch socket
    pub punch_timeout: Duration,
    /// Frame ceiling on punch sockets (control protocol)
    pub max_control_frame: usize,
    pub link_heartbeat: Duration,
    pub link_offline: Duration,
}

impl P2pSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        P2pSettings {
            try_count: config.p2p_try_count,
            retry_interval: config.retry_interval(),
            max_failures: config.p2p_max_failures,
            punch_timeout: config.heartbeat_interval(),
            max_control_frame: config.max_packet_size,
            link_heartbeat: LINK_HEARTBEAT,
            link_offline: LINK_OFFLINE,
        }
    }
}

impl Default for P2pSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Who we are towards the server
#[derive(Debug, Clone, Copy)]
struct LocalIdentity {
    peer_id: PeerId,
    token: u32,
    server: Option<SocketAddr>,
}

// ============================================================================
// Registry Records
// ============================================================================

struct PunchSocket {
    generation: u64,
    started: Instant,
    conn: Option<Connection>,
    /// Local address the punch socket was bound to
    local: Option<SocketAddr>,
}

struct PeerLink {
    generation: u64,
    conn: Option<Connection>,
    try_count: u32,
    last_try: Option<Instant>,
    last_receive: Instant,
    missed_pings: u32,
    connected: bool,
}

impl PeerLink {
    fn new(generation: u64, conn: Option<Connection>) -> Self {
        PeerLink {
            generation,
            connected: conn.is_some(),
            conn,
            try_count: 0,
            last_try: None,
            last_receive: Instant::now(),
            missed_pings: 0,
        }
    }

    fn owns(&self, conn: &Connection) -> bool {
        self.conn.as_ref().map_or(false, |c| c.same(conn))
    }

    fn touch(&mut self) {
        self.last_receive = Instant::now();
        self.missed_pings = 0;
        self.connected = true;
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: u32,
    last_failure: Instant,
}

#[derive(Default)]
struct Shard {
    punch: HashMap<PeerId, PunchSocket>,
    pending: HashMap<PeerId, PeerLink>,
    active: HashMap<PeerId, PeerLink>,
    failures: HashMap<PeerId, FailureRecord>,
}

impl Shard {
    /// Count a failure and drop the punch socket it came from
    fn record_failure(&mut self, peer: PeerId) -> Option<Connection> {
        let now = Instant::now();
        let record = self.failures.entry(peer).or_insert(FailureRecord {
            count: 0,
            last_failure: now,
        });
        record.count += 1;
        record.last_failure = now;
        log::debug!("traversal to {} failed ({} so far)", peer, record.count);
        self.punch.remove(&peer).and_then(|p| p.conn)
    }
}

/// Registry sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounts {
    pub punch: usize,
    pub pending: usize,
    pub active: usize,
    pub failures: usize,
}

fn close_all(conns: impl IntoIterator<Item = Option<Connection>>) {
    for conn in conns.into_iter().flatten() {
        conn.close();
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct NatTraversal {
    me: Weak<NatTraversal>,
    transport: Arc<dyn Transport>,
    directory: Arc<Directory>,
    device: Arc<dyn VirtualDevice>,
    settings: RwLock<P2pSettings>,
    local: RwLock<LocalIdentity>,
    shards: Vec<Mutex<Shard>>,
    generation: AtomicU64,
    worker: Mutex<Option<Worker>>,
}

impl NatTraversal {
    pub fn new(
        transport: Arc<dyn Transport>,
        directory: Arc<Directory>,
        device: Arc<dyn VirtualDevice>,
        settings: P2pSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| NatTraversal {
            me: me.clone(),
            transport,
            directory,
            device,
            settings: RwLock::new(settings),
            local: RwLock::new(LocalIdentity {
                peer_id: PeerId::UNASSIGNED,
                token: 0,
                server: None,
            }),
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect(),
            generation: AtomicU64::new(1),
            worker: Mutex::new(None),
        })
    }

    fn shard(&self, peer: PeerId) -> MutexGuard<'_, Shard> {
        let mixed = peer.0 ^ (peer.0 >> 24) ^ (peer.0 >> 40);
        let lock = &self.shards[(mixed as usize) % SHARD_COUNT];
        match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn each_shard(&self) -> impl Iterator<Item = MutexGuard<'_, Shard>> {
        self.shards.iter().map(|lock| match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    fn settings(&self) -> P2pSettings {
        match self.settings.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn local(&self) -> LocalIdentity {
        match self.local.read() {
            Ok(l) => *l,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn local_id(&self) -> PeerId {
        self.local().peer_id
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_settings(&self, settings: P2pSettings) {
        match self.settings.write() {
            Ok(mut s) => *s = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }

    /// Identity, session token and server used for traversal brokering
    pub fn set_local(&self, peer_id: PeerId, token: u32, server: SocketAddr) {
        let identity = LocalIdentity {
            peer_id,
            token,
            server: Some(server),
        };
        match self.local.write() {
            Ok(mut l) => *l = identity,
            Err(poisoned) => *poisoned.into_inner() = identity,
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Launch the maintenance loop
    pub fn start(&self) -> std::io::Result<()> {
        let mut slot = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().map_or(false, |w| w.is_running()) {
            return Ok(());
        }
        let tick_engine = self.me.clone();
        let exit_engine = self.me.clone();
        *slot = Some(Worker::spawn(
            "p2p-maintenance",
            MAINTENANCE_INTERVAL,
            move || {
                if let Some(engine) = tick_engine.upgrade() {
                    engine.maintenance_tick();
                }
            },
            move || {
                if let Some(engine) = exit_engine.upgrade() {
                    engine.reset();
                }
            },
        )?);
        log::info!("p2p engine started");
        Ok(())
    }

    /// Stop the maintenance loop and close every link; idempotent
    pub fn stop(&self) {
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut worker) = worker {
            worker.stop();
            log::info!("p2p engine stopped");
        }
        self.reset();
    }

    // ------------------------------------------------------------------------
    // Forwarding
    // ------------------------------------------------------------------------

    /// Deliver `frame` over a direct link; false means the caller relays it
    pub fn try_forward(&self, dst: PeerId, frame: &DataFrame) -> bool {
        if !dst.is_unicast() {
            return false;
        }

        let conn = self
            .shard(dst)
            .active
            .get(&dst)
            .filter(|l| l.connected)
            .and_then(|l| l.conn.clone());
        if let Some(conn) = conn {
            match conn.write(frame.clone()) {
                Ok(()) => return true,
                Err(e) => log::debug!("direct send to {} failed: {}", dst, e),
            }
        }

        if self.is_need_p2p(dst) {
            if let Err(e) = self.start_punch(dst, false) {
                log::debug!("punch towards {} not started: {}", dst, e);
            }
        }
        false
    }

    /// Whether a new traversal attempt towards `dst` is warranted
    pub fn is_need_p2p(&self, dst: PeerId) -> bool {
        if !dst.is_unicast() {
            return false;
        }
        let settings = self.settings();
        {
            let shard = self.shard(dst);
            if let Some(failure) = shard.failures.get(&dst) {
                if failure.count >= settings.max_failures {
                    return false;
                }
                if failure.last_failure.elapsed() < settings.retry_interval {
                    return false;
                }
            }
            if shard.pending.contains_key(&dst) || shard.active.contains_key(&dst) {
                return false;
            }
        }
        self.directory.contains(dst)
    }

    pub fn is_p2p(&self, peer: PeerId) -> bool {
        self.shard(peer)
            .active
            .get(&peer)
            .map_or(false, |l| l.connected && l.conn.is_some())
    }

    // ------------------------------------------------------------------------
    // Punch
    // ------------------------------------------------------------------------

    /// Open a punch socket towards the server for `dst`
    ///
    /// An existing, fresh punch socket is reused: the trigger is re-sent when
    /// the peer asked for it, otherwise nothing happens. An expired one is
    /// closed and reported.
    pub fn start_punch(&self, dst: PeerId, triggered_by_peer: bool) -> Result<(), TraversalError> {
        if !dst.is_unicast() {
            return Err(TraversalError::NotUnicast);
        }
        let settings = self.settings();
        let server = self
            .local()
            .server
            .ok_or_else(|| TraversalError::Socket("no server address".into()))?;

        let generation = self.next_generation();
        {
            let mut shard = self.shard(dst);
            if let Some(punch) = shard.punch.get(&dst) {
                if punch.started.elapsed() < settings.punch_timeout {
                    let conn = punch.conn.clone();
                    drop(shard);
                    if triggered_by_peer && conn.is_some() {
                        self.send_p2p_trigger(dst)?;
                    }
                    return Ok(());
                }
                let expired = shard.punch.remove(&dst).and_then(|p| p.conn);
                drop(shard);
                close_all([expired]);
                return Err(TraversalError::PunchExpired);
            }
            shard.punch.insert(
                dst,
                PunchSocket {
                    generation,
                    started: Instant::now(),
                    conn: None,
                    local: None,
                },
            );
        }

        let any: SocketAddr = match server {
            SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
            SocketAddr::V6(_) => ([0u16; 8], 0).into(),
        };
        let options = ConnectOptions::new(server)
            .bind(any)
            .reuse_addr()
            .max_frame_len(settings.max_control_frame);
        let handler = Arc::new(PunchHandler::new(dst, generation, self.me.clone()));

        match self.transport.connect(options, handler) {
            Ok(conn) => {
                log::debug!("punch socket for {} at {}", dst, conn.local_addr());
                self.attach_punch(dst, generation, &conn);
                Ok(())
            }
            Err(e) => {
                let stale = {
                    let mut shard = self.shard(dst);
                    shard.record_failure(dst)
                };
                close_all([stale]);
                Err(TraversalError::Socket(e.to_string()))
            }
        }
    }

    /// Bind a connection to its punch record; false if the record is gone
    fn attach_punch(&self, dst: PeerId, generation: u64, conn: &Connection) -> bool {
        let mut shard = self.shard(dst);
        match shard.punch.get_mut(&dst) {
            Some(punch) if punch.generation == generation => {
                if punch.conn.is_none() {
                    punch.conn = Some(conn.clone());
                }
                punch.local = Some(conn.local_addr());
                true
            }
            _ => {
                drop(shard);
                conn.close();
                false
            }
        }
    }

    /// Punch socket became active: announce readiness
    pub(crate) fn punch_active(&self, dst: PeerId, generation: u64, conn: &Connection) {
        if self.attach_punch(dst, generation, conn) {
            if let Err(e) = self.send_p2p_trigger(dst) {
                log::debug!("trigger towards {} not sent: {}", dst, e);
            }
        }
    }

    pub(crate) fn punch_closed(&self, dst: PeerId, conn: &Connection) {
        let mut shard = self.shard(dst);
        let owned = shard
            .punch
            .get(&dst)
            .and_then(|p| p.conn.as_ref())
            .map_or(false, |c| c.same(conn));
        if owned {
            shard.punch.remove(&dst);
        }
    }

    /// Ask the server, over the punch socket, to broker a link with `dst`
    pub fn send_p2p_trigger(&self, dst: PeerId) -> Result<(), TraversalError> {
        let conn = self
            .shard(dst)
            .punch
            .get(&dst)
            .and_then(|p| p.conn.clone())
            .ok_or(TraversalError::NoPunchSocket)?;
        let local = self.local();
        let frame = ControlFrame::new(
            local.peer_id,
            local.token,
            ControlMessage::P2PTrigger(P2PTrigger {
                src: local.peer_id,
                dst,
            }),
        );
        conn.write(frame)
            .map_err(|e| TraversalError::Socket(e.to_string()))
    }

    /// A peer announced it is ready to punch towards us
    pub fn process_p2p_trigger(&self, src: PeerId) -> Result<(), TraversalError> {
        if !src.is_unicast() {
            return Err(TraversalError::NotUnicast);
        }
        {
            let shard = self.shard(src);
            if shard.pending.contains_key(&src) || shard.active.contains_key(&src) {
                log::debug!("trigger from {} ignored, link in progress", src);
                return Ok(());
            }
        }
        self.start_punch(src, true)
    }

    /// Server verdict carrying the peer's external socket
    pub fn process_p2p_ack(&self, ack: &P2PAck) -> Result<(), TraversalError> {
        let peer = ack.peer_id;
        let remote = match (ack.valid, ack.other_extern) {
            (true, Some(remote)) => remote,
            _ => {
                let stale = self.shard(peer).record_failure(peer);
                close_all([stale]);
                return Err(TraversalError::Incompatible);
            }
        };

        let generation = self.next_generation();
        let local = {
            let mut shard = self.shard(peer);
            if shard.active.contains_key(&peer) {
                let punch = shard.punch.remove(&peer).and_then(|p| p.conn);
                drop(shard);
                close_all([punch]);
                log::debug!("ack for {} after direct link came up", peer);
                return Ok(());
            }
            let local = shard
                .punch
                .get(&peer)
                .and_then(|p| p.local.or_else(|| p.conn.as_ref().map(|c| c.local_addr())))
                .ok_or(TraversalError::NoPunchSocket)?;
            let replaced = shard
                .pending
                .insert(peer, PeerLink::new(generation, None))
                .and_then(|l| l.conn);
            drop(shard);
            close_all([replaced]);
            local
        };

        let settings = self.settings();
        let options = ConnectOptions::new(remote)
            .bind(local)
            .reuse_addr()
            .read_idle(settings.link_heartbeat)
            .max_frame_len(MAX_PEER_FRAME_LEN);
        let handler = Arc::new(PeerLinkHandler::new(
            peer,
            generation,
            self.me.clone(),
            self.device.clone(),
        ));

        match self.transport.connect(options, handler) {
            Ok(conn) => {
                log::debug!("pending link to {} via {} -> {}", peer, local, remote);
                self.attach_link(peer, generation, &conn);
                Ok(())
            }
            Err(e) => {
                let stale = {
                    let mut shard = self.shard(peer);
                    if shard.pending.get(&peer).map(|l| l.generation) == Some(generation) {
                        shard.pending.remove(&peer);
                    }
                    shard.record_failure(peer)
                };
                close_all([stale]);
                Err(TraversalError::Socket(e.to_string()))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Direct Links
    // ------------------------------------------------------------------------

    /// Bind a connection to its pending or active record
    fn attach_link(&self, peer: PeerId, generation: u64, conn: &Connection) -> bool {
        let mut guard = self.shard(peer);
        let Shard {
            pending, active, ..
        } = &mut *guard;
        let record = pending
            .get_mut(&peer)
            .filter(|l| l.generation == generation)
            .or_else(|| active.get_mut(&peer).filter(|l| l.generation == generation));
        match record {
            Some(link) => {
                if link.conn.is_none() {
                    link.conn = Some(conn.clone());
                    link.connected = true;
                }
                true
            }
            None => {
                conn.close();
                false
            }
        }
    }

    /// Direct socket became active: open with a ping
    pub(crate) fn link_active(&self, peer: PeerId, generation: u64, conn: &Connection) {
        if self.attach_link(peer, generation, conn) {
            let me = self.local().peer_id;
            if let Err(e) = conn.write(DataFrame::signal(DataKind::Ping, me, peer)) {
                log::debug!("opening ping to {} failed: {}", peer, e);
            }
        }
    }

    /// Any frame arrived on a direct socket
    pub(crate) fn link_received(&self, peer: PeerId, conn: &Connection) {
        let mut shard = self.shard(peer);
        if let Some(link) = shard.active.get_mut(&peer).filter(|l| l.owns(conn)) {
            link.touch();
        } else if let Some(link) = shard.pending.get_mut(&peer).filter(|l| l.owns(conn)) {
            link.touch();
        }
    }

    /// Read-idle on a direct socket: count a missed ping and ping again
    pub(crate) fn link_idle(&self, peer: PeerId, conn: &Connection) {
        {
            let mut shard = self.shard(peer);
            if let Some(link) = shard.active.get_mut(&peer).filter(|l| l.owns(conn)) {
                link.missed_pings += 1;
            }
        }
        let me = self.local().peer_id;
        if let Err(e) = conn.write(DataFrame::signal(DataKind::Ping, me, peer)) {
            log::debug!("idle ping to {} failed: {}", peer, e);
        }
    }

    pub(crate) fn link_closed(&self, peer: PeerId, conn: &Connection) {
        let mut guard = self.shard(peer);
        let Shard {
            pending, active, ..
        } = &mut *guard;
        for link in [active.get_mut(&peer), pending.get_mut(&peer)]
            .into_iter()
            .flatten()
        {
            if link.owns(conn) {
                link.connected = false;
            }
        }
    }

    /// Send one probe on the pending link to `dst`
    pub fn send_p2p_try(&self, dst: PeerId) -> Result<(), TraversalError> {
        let settings = self.settings();
        let conn = {
            let mut shard = self.shard(dst);
            let link = shard
                .pending
                .get_mut(&dst)
                .ok_or(TraversalError::NoPendingLink)?;

            if link.try_count >= settings.try_count {
                let abandoned = shard.pending.remove(&dst).and_then(|l| l.conn);
                let stale = shard.record_failure(dst);
                drop(shard);
                close_all([abandoned, stale]);
                return Err(TraversalError::TriesExhausted);
            }

            match link.conn.clone() {
                Some(conn) => {
                    link.try_count += 1;
                    link.last_try = Some(Instant::now());
                    conn
                }
                None => {
                    // Socket still being opened; retried on the next tick
                    log::trace!("pending link to {} not attached yet", dst);
                    return Ok(());
                }
            }
        };

        let me = self.local().peer_id;
        conn.write(DataFrame::signal(DataKind::P2PTry, me, dst))
            .map_err(|e| TraversalError::Socket(e.to_string()))
    }

    /// A probe from `src` arrived on `conn`: the path works both ways
    pub fn p2p_success(&self, src: PeerId, conn: &Connection) {
        let echo = {
            let mut shard = self.shard(src);
            if let Some(link) = shard.active.get_mut(&src) {
                if link.conn.is_none() {
                    link.conn = Some(conn.clone());
                }
                link.touch();
                None
            } else if let Some(mut link) = shard.pending.remove(&src) {
                if link.conn.is_none() {
                    link.conn = Some(conn.clone());
                }
                link.touch();
                let echo = link.conn.clone();
                shard.active.insert(src, link);
                echo
            } else {
                let mut link = PeerLink::new(0, Some(conn.clone()));
                link.touch();
                shard.active.insert(src, link);
                None
            }
        };

        log::info!("direct link to {} established", src);
        if let Some(echo) = echo {
            let me = self.local().peer_id;
            if let Err(e) = echo.write(DataFrame::signal(DataKind::P2PTry, me, src)) {
                log::debug!("probe echo to {} failed: {}", src, e);
            }
        }
        self.directory.set_direct(src, true);
    }

    // ------------------------------------------------------------------------
    // Resets
    // ------------------------------------------------------------------------

    /// A peer went online or offline: forget everything about its links
    pub fn peer_state_changed(&self, peer: PeerId, online: bool) {
        let closed = {
            let mut shard = self.shard(peer);
            shard.failures.remove(&peer);
            [
                shard.pending.remove(&peer).and_then(|l| l.conn),
                shard.active.remove(&peer).and_then(|l| l.conn),
            ]
        };
        close_all(closed);
        self.directory.set_direct(peer, false);
        log::debug!(
            "{} went {}, traversal state cleared",
            peer,
            if online { "online" } else { "offline" }
        );
    }

    /// Drop every punch socket, link and failure record
    pub fn reset(&self) {
        let mut closed = Vec::new();
        for mut shard in self.each_shard() {
            closed.extend(shard.punch.drain().map(|(_, p)| p.conn));
            closed.extend(shard.pending.drain().map(|(_, l)| l.conn));
            for (peer, link) in shard.active.drain() {
                self.directory.set_direct(peer, false);
                closed.push(link.conn);
            }
            shard.failures.clear();
        }
        close_all(closed);
    }

    /// Forget the failure history of one peer
    pub fn delete_failed(&self, peer: PeerId) {
        self.shard(peer).failures.remove(&peer);
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// One pass of the maintenance loop
    pub fn maintenance_tick(&self) {
        let settings = self.settings();
        let me = self.local().peer_id;
        let ping_after = settings.link_heartbeat + LINK_GRACE;

        let mut pings = Vec::new();
        let mut evicted = Vec::new();
        let mut closed = Vec::new();
        let mut pending = Vec::new();

        for mut shard in self.each_shard() {
            shard.active.retain(|peer, link| {
                let silent = link.last_receive.elapsed();
                let evict = if !link.connected || silent > settings.link_offline {
                    true
                } else if silent > ping_after {
                    match link.conn.clone() {
                        Some(conn) if link.missed_pings < MAX_MISSED_PINGS => {
                            link.missed_pings += 1;
                            pings.push((*peer, conn));
                            false
                        }
                        _ => true,
                    }
                } else {
                    false
                };
                if evict {
                    evicted.push(*peer);
                    closed.push(link.conn.take());
                }
                !evict
            });

            shard.punch.retain(|_, punch| {
                let fresh = punch.started.elapsed() < settings.punch_timeout;
                if !fresh {
                    closed.push(punch.conn.take());
                }
                fresh
            });

            pending.extend(shard.pending.keys().copied());
        }

        close_all(closed);
        for peer in evicted {
            log::info!("direct link to {} lost", peer);
            self.directory.set_direct(peer, false);
        }
        for (peer, conn) in pings {
            if let Err(e) = conn.write(DataFrame::signal(DataKind::Ping, me, peer)) {
                log::debug!("keepalive to {} failed: {}", peer, e);
            }
        }
        for peer in pending {
            if let Err(e) = self.send_p2p_try(peer) {
                log::debug!("probe to {} not sent: {}", peer, e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn counts(&self) -> LinkCounts {
        let mut counts = LinkCounts::default();
        for shard in self.each_shard() {
            counts.punch += shard.punch.len();
            counts.pending += shard.pending.len();
            counts.active += shard.active.len();
            counts.failures += shard.failures.len();
        }
        counts
    }

    pub fn failure_count(&self, peer: PeerId) -> u32 {
        self.shard(peer).failures.get(&peer).map_or(0, |f| f.count)
    }

    pub fn has_pending(&self, peer: PeerId) -> bool {
        self.shard(peer).pending.contains_key(&peer)
    }

    pub fn has_punch(&self, peer: PeerId) -> bool {
        self.shard(peer).punch.contains_key(&peer)
    }

    /// Peers with an active direct link
    pub fn active_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .each_shard()
            .flat_map(|s| s.active.keys().copied().collect::<Vec<_>>())
            .collect();
        peers.sort();
        peers
    }

    #[cfg(test)]
    fn backdate(&self, peer: PeerId, by: Duration) {
        let mut guard = self.shard(peer);
        let shard = &mut *guard;
        for link in shard.active.values_mut().chain(shard.pending.values_mut()) {
            link.last_receive -= by;
        }
        if let Some(punch) = shard.punch.get_mut(&peer) {
            punch.started -= by;
        }
        if let Some(failure) = shard.failures.get_mut(&peer) {
            failure.last_failure -= by;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
