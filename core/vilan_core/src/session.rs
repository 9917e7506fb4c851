//! Control session with the rendezvous server
//!
//! Owns the single control connection, the registration handshake,
//! heartbeats, the group directory, neighbor discovery, configuration push
//! and routes. Relayed data leaves through here when no direct link exists.
//!
//! # States
//!
//! ```text
//! UnInit ─► InitError
//!    │
//!    ▼
//! InitOk ─► UnConn ⇄ ConnOk ─► UnAck ─► Ok
//!              ▲                  │
//!              │                  └───► AuthFail (until re-registration)
//!              └──── liveness check failed (any connected state)
//! ```
//!
//! A maintenance loop runs every three seconds: a dead connection is torn
//! down and re-opened, a live but unregistered one re-sends registration.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::addr::{IpNet, PeerId};
use crate::codec::{FrameContext, PayloadError};
use crate::completion::Completions;
use crate::config::{AppConfig, ConfigStore, IpMode};
use crate::crypto::{build_cipher, generate_cookie, obfuscate_credential};
use crate::device::{DeviceConfig, DeviceState, Route, VirtualDevice};
use crate::directory::{Directory, DirectoryEntry};
use crate::discovery::{collect_links, LinkCache, NeighborTable, LINK_POLL_INTERVAL, LINK_POLL_LIMIT};
use crate::error::{AuthFailure, Error, Outcome, Result};
use crate::handler::{dispatch_control, ServerHandler};
use crate::medium::{LinkSample, LinkSampler};
use crate::nat::{NatTraversal, P2pSettings};
use crate::probe::Reachability;
use crate::protocol::{
    AuthAck, AuthRequest, ConfigAck, ConfigUpdate, ControlFrame, ControlMessage, DataFrame,
    DataKind, Frame, GroupPeersRequest, GroupPeersResponse, LinkInfo, PeerInfo,
    PeerLinksRequest, PeerLinksResponse, PeerStateChange, Ping, Pong, Statistics, UnAuth,
};
use crate::state::PeerState;
use crate::transport::{ConnectOptions, Connection, Transport};
use crate::worker::{Worker, MAINTENANCE_INTERVAL};

// ============================================================================
// Constants
// ============================================================================

/// Silence past the heartbeat after which the reachability probe decides
pub const SERVER_GRACE: Duration = Duration::from_secs(3);

/// LAN prefix assumed when the interface's own is unknown or a host route
pub const FALLBACK_LAN_PREFIX: u8 = 24;

/// Wait for a configuration acknowledgment
pub const CONFIG_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for a directory response
pub const DIRECTORY_TIMEOUT: Duration = Duration::from_millis(1200);

pub const CONFIG_REJECTED_TIP: &str = "configuration of this peer cannot be changed remotely";

// ============================================================================
// Construction
// ============================================================================

/// Collaborators a session is built from
pub struct SessionParts {
    pub store: Arc<dyn ConfigStore>,
    pub transport: Arc<dyn Transport>,
    /// Shared with the transport's codec: state, cipher and counters
    pub context: Arc<FrameContext>,
    pub device: Arc<dyn VirtualDevice>,
    pub probe: Box<dyn Reachability>,
    pub neighbors: Box<dyn NeighborTable>,
    pub sampler: Box<dyn LinkSampler>,
}

struct ServerLink {
    /// Bumped on every (re)connect; events from older connections are stale
    generation: u64,
    conn: Option<Connection>,
    addr: Option<SocketAddr>,
    token: u32,
    last_receive: Instant,
    extern_sock: Option<SocketAddr>,
    /// Local end of the control connection
    local: Option<SocketAddr>,
    /// LAN the control connection leaves from
    local_net: Option<IpNet>,
}

pub struct ControlSession {
    me: Weak<ControlSession>,
    store: Arc<dyn ConfigStore>,
    transport: Arc<dyn Transport>,
    context: Arc<FrameContext>,
    device: Arc<dyn VirtualDevice>,
    probe: Box<dyn Reachability>,
    neighbors: Box<dyn NeighborTable>,
    sampler: Box<dyn LinkSampler>,
    config: RwLock<AppConfig>,
    server: Mutex<ServerLink>,
    directory: Arc<Directory>,
    links: LinkCache,
    config_acks: Completions<PeerId, ConfigAck>,
    directory_waits: Completions<(), u32>,
    /// One directory refresh in flight at a time
    refresh: Mutex<()>,
    nat: Arc<NatTraversal>,
    route: Mutex<Option<Route>>,
    worker: Mutex<Option<Worker>>,
}

/// Host routes and unknown prefixes fall back to a /24
fn lan_of(addr: SocketAddr, prefix_len: Option<u8>) -> Option<IpNet> {
    let prefix_len = prefix_len
        .filter(|p| (1..32).contains(p))
        .unwrap_or(FALLBACK_LAN_PREFIX);
    match addr.ip() {
        IpAddr::V4(ip) => Some(IpNet::new(ip, prefix_len)).filter(|net| net.is_assignable()),
        IpAddr::V6(_) => None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ControlSession {
    /// Load configuration and wire the traversal engine; nothing runs yet
    pub fn new(parts: SessionParts) -> Result<Arc<Self>> {
        let config = match parts.store.load().and_then(|c| c.validate().map(|_| c)) {
            Ok(config) => config,
            Err(e) => {
                parts.context.set_state(PeerState::InitError);
                log::error!("session init failed: {}", e);
                return Err(e);
            }
        };

        let directory = Arc::new(Directory::new());
        let nat = NatTraversal::new(
            parts.transport.clone(),
            directory.clone(),
            parts.device.clone(),
            P2pSettings::from_config(&config),
        );

        let session = Arc::new_cyclic(|me| ControlSession {
            me: me.clone(),
            store: parts.store,
            transport: parts.transport,
            context: parts.context,
            device: parts.device,
            probe: parts.probe,
            neighbors: parts.neighbors,
            sampler: parts.sampler,
            config: RwLock::new(config),
            server: Mutex::new(ServerLink {
                generation: 0,
                conn: None,
                addr: None,
                token: 0,
                last_receive: Instant::now(),
                extern_sock: None,
                local: None,
                local_net: None,
            }),
            directory,
            links: LinkCache::new(),
            config_acks: Completions::new(),
            directory_waits: Completions::new(),
            refresh: Mutex::new(()),
            nat,
            route: Mutex::new(None),
            worker: Mutex::new(None),
        });
        session.context.set_state(PeerState::InitOk);
        Ok(session)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> PeerState {
        self.context.state()
    }

    pub fn config(&self) -> AppConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_config(&self, config: AppConfig) {
        match self.config.write() {
            Ok(mut slot) => *slot = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        match self.config.read() {
            Ok(config) => config.tap.hw_mac,
            Err(poisoned) => poisoned.into_inner().tap.hw_mac,
        }
    }

    pub fn token(&self) -> u32 {
        lock(&self.server).token
    }

    /// Our socket as the server sees it
    pub fn extern_sock(&self) -> Option<SocketAddr> {
        lock(&self.server).extern_sock
    }

    pub fn local_net(&self) -> Option<IpNet> {
        lock(&self.server).local_net
    }

    pub fn nat(&self) -> &Arc<NatTraversal> {
        &self.nat
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn is_p2p(&self, peer: PeerId) -> bool {
        self.nat.is_p2p(peer)
    }

    pub fn stats(&self) -> Statistics {
        self.context.stats().snapshot()
    }

    /// Traffic counters in Prometheus text format
    pub fn stats_report(&self) -> String {
        self.context.stats().render()
    }

    /// Seal a payload with the session cipher
    pub fn encrypt_msg(&self, data: &[u8]) -> std::result::Result<Vec<u8>, PayloadError> {
        self.context.encrypt(data)
    }

    pub fn decrypt_msg(&self, data: &[u8]) -> std::result::Result<Vec<u8>, PayloadError> {
        self.context.decrypt(data)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Set up the cipher, start the traversal engine and the maintenance loop
    pub fn start(&self) -> Result<()> {
        {
            let mut slot = lock(&self.worker);
            if slot.as_ref().map_or(false, |w| w.is_running()) {
                return Ok(());
            }

            self.init_cipher();
            self.nat.start()?;

            let tick_session = self.me.clone();
            let exit_session = self.me.clone();
            let worker = Worker::spawn(
                "session-maintenance",
                MAINTENANCE_INTERVAL,
                move || {
                    if let Some(session) = tick_session.upgrade() {
                        session.maintenance_tick();
                    }
                },
                move || {
                    if let Some(session) = exit_session.upgrade() {
                        session.disconnect();
                    }
                },
            );
            match worker {
                Ok(worker) => *slot = Some(worker),
                Err(e) => {
                    self.context.set_state(PeerState::InitError);
                    self.nat.stop();
                    return Err(e.into());
                }
            }
        }
        log::info!("control session started");

        // First connection attempt without waiting a full interval
        self.maintenance_tick();
        Ok(())
    }

    fn init_cipher(&self) {
        let peer = self.config().peer;
        match build_cipher(peer.crypt_type, peer.cipher_key()) {
            Ok(Some(cipher)) => {
                self.context.set_cipher(Some(cipher));
                log::info!("payloads sealed with {:?}", peer.crypt_type);
            }
            Ok(None) => {
                self.context.set_cipher(None);
                log::info!("payloads travel unencrypted");
            }
            Err(e) => {
                self.context.set_cipher(None);
                log::warn!("cipher unavailable ({}), payloads travel unencrypted", e);
            }
        }
    }

    /// Deregister and tear everything down; safe to call repeatedly
    pub fn stop(&self) {
        if let Err(e) = self.send_unauth() {
            log::debug!("unauth not sent: {}", e);
        }
        self.clean_routes();

        let worker = lock(&self.worker).take();
        if let Some(mut worker) = worker {
            worker.stop();
            log::info!("control session stopped");
        }
        self.disconnect();
        self.nat.stop();
        self.context.set_state(PeerState::UnConn);
    }

    /// Stop, reload configuration, restart the interface and start again
    pub fn restart(&self) -> Result<()> {
        log::info!("restarting control session");
        self.stop();

        if let Err(e) = self.device.stop() {
            log::error!("virtual interface stop failed: {}", e);
            return Err(e.into());
        }

        let config = match self.store.load().and_then(|c| c.validate().map(|_| c)) {
            Ok(config) => config,
            Err(e) => {
                log::error!("configuration reload failed: {}", e);
                return Err(e);
            }
        };
        self.nat.set_settings(P2pSettings::from_config(&config));
        self.set_config(config.clone());

        if config.tap.ip_mode == IpMode::Static && !config.tap.hw_mac.is_unassigned() {
            if let Err(e) = self.start_device(&config) {
                log::error!("virtual interface start failed: {}", e);
            }
        }

        if let Err(e) = self.start() {
            log::error!("control session start failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    fn start_device(&self, config: &AppConfig) -> Result<()> {
        let net = config
            .tap
            .net()
            .ok_or_else(|| Error::Configuration("no virtual address assigned".into()))?;
        let device_config = DeviceConfig {
            name: config.tap.name.clone(),
            dev_type: config.tap.dev_type,
            mac: config.tap.hw_mac,
            net,
        };
        self.device.start(&device_config)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// One pass of the maintenance loop
    pub fn maintenance_tick(&self) {
        if !self.is_alive() {
            self.disconnect();
            if let Err(e) = self.connect() {
                log::warn!("server connection failed: {}", e);
            }
        } else if matches!(self.state(), PeerState::ConnOk | PeerState::UnAck) {
            if let Err(e) = self.send_auth_request() {
                log::debug!("registration not sent: {}", e);
            }
        }
    }

    /// Whether the control connection still looks usable
    pub fn is_alive(&self) -> bool {
        if self.state() < PeerState::ConnOk {
            return false;
        }
        let config = self.config();
        let silent = {
            let server = lock(&self.server);
            match &server.conn {
                Some(conn) if !conn.is_closed() => server.last_receive.elapsed(),
                _ => return false,
            }
        };
        if silent >= config.offline_after() {
            log::info!("server silent for {:?}", silent);
            return false;
        }
        if silent > config.heartbeat_interval() + SERVER_GRACE {
            return self.probe.is_reachable();
        }
        true
    }

    fn connect(&self) -> Result<()> {
        let config = self.config();
        self.context.set_state(PeerState::UnConn);
        if !self.probe.is_reachable() {
            return Err(Error::Connectivity("server unreachable".into()));
        }
        let addr = config.server_addr()?;

        let generation = {
            let mut server = lock(&self.server);
            server.generation += 1;
            server.conn = None;
            server.addr = Some(addr);
            server.generation
        };

        let options = ConnectOptions::new(addr)
            .scheme(config.server_scheme)
            .read_idle(config.heartbeat_interval())
            .max_frame_len(config.max_packet_size);
        let handler = Arc::new(ServerHandler::new(self.me.clone(), generation));
        let conn = self
            .transport
            .connect(options, handler)
            .map_err(|e| Error::Connectivity(format!("{}: {}", addr, e)))?;
        log::info!("connecting to {} from {}", addr, conn.local_addr());

        let mut server = lock(&self.server);
        if server.generation == generation {
            if server.conn.is_none() {
                server.conn = Some(conn.clone());
            }
            server.local = Some(conn.local_addr());
            server.last_receive = Instant::now();
        } else {
            drop(server);
            conn.close();
        }
        Ok(())
    }

    /// Sample the medium behind the control connection and refresh its LAN
    fn sample_link(&self) -> LinkSample {
        let local = lock(&self.server).local;
        let sample = match local.map(|addr| addr.ip()) {
            Some(IpAddr::V4(ip)) => self.sampler.sample(ip),
            _ => LinkSample::unknown(),
        };
        let lan = local.and_then(|addr| lan_of(addr, sample.prefix_len));
        let mut server = lock(&self.server);
        if server.local == local {
            server.local_net = lan;
        }
        sample
    }

    fn disconnect(&self) {
        let conn = {
            let mut server = lock(&self.server);
            server.generation += 1;
            server.conn.take()
        };
        if let Some(conn) = conn {
            conn.close();
        }
        if self.state() > PeerState::UnConn {
            self.context.set_state(PeerState::UnConn);
        }
    }

    fn server_conn(&self) -> Result<(Connection, u32)> {
        let server = lock(&self.server);
        match &server.conn {
            Some(conn) => Ok((conn.clone(), server.token)),
            None => Err(Error::Connectivity("no server connection".into())),
        }
    }

    fn send_control(&self, body: ControlMessage) -> Result<()> {
        let state = self.state();
        if state < PeerState::ConnOk {
            return Err(Error::NotReady(state));
        }
        let (conn, token) = self.server_conn()?;
        conn.write(ControlFrame::new(self.peer_id(), token, body))
    }

    // ------------------------------------------------------------------------
    // Server Connection Events
    // ------------------------------------------------------------------------

    pub(crate) fn server_active(&self, generation: u64, conn: &Connection) {
        {
            let mut server = lock(&self.server);
            if server.generation != generation {
                drop(server);
                conn.close();
                return;
            }
            if !server.conn.as_ref().map_or(false, |c| c.same(conn)) {
                server.conn = Some(conn.clone());
            }
            server.local = Some(conn.local_addr());
            server.last_receive = Instant::now();
        }
        self.context.set_state(PeerState::ConnOk);
        if let Err(e) = self.send_auth_request() {
            log::warn!("registration not sent: {}", e);
        }
    }

    pub(crate) fn server_read(&self, generation: u64, conn: &Connection, frame: Frame) {
        {
            let mut server = lock(&self.server);
            if server.generation != generation {
                log::debug!("frame on stale server connection {:?}", conn);
                return;
            }
            server.last_receive = Instant::now();
        }
        match frame {
            Frame::Control(control) => dispatch_control(self, control),
            Frame::Data(data) if data.kind == DataKind::Packet => {
                log::trace!("{} bytes relayed from {}", data.data.len(), data.src);
                if let Err(e) = self.device.write_frame(&data.data) {
                    log::debug!("relayed frame not written: {}", e);
                }
            }
            Frame::Data(data) => log::debug!("unexpected {:?} from server", data.kind),
        }
    }

    pub(crate) fn server_idle(&self, generation: u64) {
        if lock(&self.server).generation != generation {
            return;
        }
        if self.state() == PeerState::Ok {
            if let Err(e) = self.send_ping() {
                log::debug!("heartbeat not sent: {}", e);
            }
        }
    }

    pub(crate) fn server_down(&self, generation: u64, conn: &Connection) {
        let current = {
            let mut server = lock(&self.server);
            let current = server.generation == generation
                && server.conn.as_ref().map_or(false, |c| c.same(conn));
            if current {
                server.conn = None;
            }
            current
        };
        if current && self.state() > PeerState::UnConn {
            self.context.set_state(PeerState::UnConn);
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    pub fn send_auth_request(&self) -> Result<()> {
        let state = self.state();
        if state < PeerState::ConnOk {
            return Err(Error::NotReady(state));
        }
        let config = self.config();
        let (conn, _) = self.server_conn()?;
        let link = self.sample_link();

        let static_ip = config.tap.ip_mode == IpMode::Static;
        let request = AuthRequest {
            peer_name: config.peer.name.clone(),
            group: config.peer.group_name.clone(),
            credential: obfuscate_credential(&config.peer.group_pwd),
            os: std::env::consts::OS.to_string(),
            link_mode: link.mode,
            link_quality: link.quality,
            dev_type: config.tap.dev_type,
            auto_mac: config.tap.hw_mac.is_unassigned(),
            peer_mac: config.tap.hw_mac,
            auto_ip: !static_ip,
            peer_addr: if static_ip { config.tap.net() } else { None },
            inner_addr: self.local_net(),
        };
        conn.write(ControlFrame::new(
            config.tap.hw_mac,
            0,
            ControlMessage::Auth(request),
        ))?;
        self.context.set_state(PeerState::UnAck);
        Ok(())
    }

    pub fn process_auth_response(&self, ack: AuthAck) -> Result<()> {
        if let Some(sock) = ack.extern_sock {
            lock(&self.server).extern_sock = Some(sock);
        }
        if let Some(failure) = AuthFailure::from_code(ack.result) {
            return Err(self.auth_failed(failure));
        }

        let mut config = self.config();
        let mut assigned = false;
        if ack.assign_mac {
            if ack.peer_mac.is_unassigned() || !ack.peer_mac.is_unicast() {
                return Err(self.auth_failed(AuthFailure::InvalidAssignment));
            }
            config.tap.hw_mac = ack.peer_mac;
            assigned = true;
        }
        if ack.assign_ip {
            match ack.peer_addr.filter(|net| net.is_assignable()) {
                Some(net) => {
                    config.tap.ip_addr = net.addr;
                    config.tap.prefix_len = net.prefix_len;
                    assigned = true;
                }
                None => return Err(self.auth_failed(AuthFailure::InvalidAssignment)),
            }
        }
        if assigned {
            if let Err(e) = self.store.save(&config) {
                log::warn!("assigned identity not persisted: {}", e);
            }
            self.set_config(config.clone());
        }

        let (previous, server_addr) = {
            let mut server = lock(&self.server);
            let previous = server.token;
            server.token = ack.token;
            (previous, server.addr)
        };
        if previous != 0 && previous != ack.token {
            log::info!("session token changed, dropping directory");
            self.directory.clear();
        }

        self.context.set_state(PeerState::Ok);
        log::info!(
            "registered as {} in group {}",
            config.tap.hw_mac,
            config.peer.group_name
        );

        if let Some(addr) = server_addr {
            self.nat.set_local(config.tap.hw_mac, ack.token, addr);
        }
        self.nat.reset();

        if self.device.state() != DeviceState::Running {
            if let Err(e) = self.start_device(&config) {
                log::error!("virtual interface start failed: {}", e);
                self.context.set_state(PeerState::InitError);
                return Err(e);
            }
        }

        self.send_group_peers_request()
    }

    fn auth_failed(&self, failure: AuthFailure) -> Error {
        self.context.set_state(PeerState::AuthFail);
        log::error!("registration rejected: {}", failure);
        Error::Authentication(failure)
    }

    pub fn send_unauth(&self) -> Result<()> {
        let config = self.config();
        let token = self.token();
        self.send_control(ControlMessage::UnAuth(UnAuth {
            peer_mac: config.tap.hw_mac,
            group: config.peer.group_name,
            token,
        }))
    }

    // ------------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------------

    pub fn send_ping(&self) -> Result<()> {
        let config = self.config();
        let link = self.sample_link();
        self.send_control(ControlMessage::Ping(Ping {
            peer_name: config.peer.name.clone(),
            peer_addr: config.tap.net(),
            inner_addr: self.local_net(),
            link_mode: link.mode,
            link_quality: link.quality,
            stats: self.stats(),
        }))
    }

    pub fn process_pong(&self, pong: Pong) {
        if let Some(sock) = pong.extern_sock {
            let mut server = lock(&self.server);
            if server.extern_sock != Some(sock) {
                log::debug!("external socket now {}", sock);
                server.extern_sock = Some(sock);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Data Path
    // ------------------------------------------------------------------------

    /// Send a locally generated frame to `dst`, directly when a link exists
    pub fn post_tuntap_data(&self, dst: PeerId, data: Vec<u8>) -> Result<()> {
        let state = self.state();
        if state != PeerState::Ok {
            return Err(Error::NotReady(state));
        }
        let mut frame = DataFrame::packet(self.peer_id(), dst, data);
        if self.nat.try_forward(dst, &frame) {
            return Ok(());
        }
        let (conn, token) = self.server_conn()?;
        frame.token = token;
        conn.write(frame)
    }

    // ------------------------------------------------------------------------
    // Directory
    // ------------------------------------------------------------------------

    pub fn send_group_peers_request(&self) -> Result<()> {
        let config = self.config();
        self.send_control(ControlMessage::GroupPeersRequest(GroupPeersRequest {
            src: config.tap.hw_mac,
            group: config.peer.group_name,
        }))
    }

    pub fn process_group_peers_response(&self, response: GroupPeersResponse) {
        log::debug!(
            "directory page: {} peers (cookie {})",
            response.peers.len(),
            response.cookie
        );
        self.directory.merge_response(response.cookie, response.peers);
        self.directory_waits.complete(&(), response.cookie);
    }

    /// Request the directory and wait for the first response page
    pub fn refresh_directory(&self) -> Result<Vec<DirectoryEntry>> {
        let _refresh = lock(&self.refresh);
        let waiter = self.directory_waits.register(());
        self.send_group_peers_request()?;
        match waiter.wait(DIRECTORY_TIMEOUT) {
            Some(_) => Ok(self.directory.snapshot()),
            None => Err(Error::Timeout("group peers response")),
        }
    }

    pub fn group_peers(&self) -> Vec<DirectoryEntry> {
        self.directory.snapshot()
    }

    pub fn find_peer(&self, peer: PeerId) -> Option<PeerInfo> {
        self.directory.find(peer).map(|entry| entry.info)
    }

    pub fn process_peer_state_changed(&self, change: PeerStateChange) {
        log::info!(
            "{} is {}",
            change.peer_id,
            if change.online { "online" } else { "offline" }
        );
        self.directory
            .apply_state_change(change.peer_id, change.online, change.info);
        self.nat.peer_state_changed(change.peer_id, change.online);
        if !change.online {
            self.links.clear(change.peer_id);
        }
    }

    // ------------------------------------------------------------------------
    // Neighbor Discovery
    // ------------------------------------------------------------------------

    pub fn send_peer_links_request(&self, dst: PeerId) -> Result<()> {
        self.send_control(ControlMessage::PeerLinksRequest(PeerLinksRequest {
            src: self.peer_id(),
            dst,
        }))
    }

    /// Ask `dst` for its LAN neighbors and collect the pages that arrive
    pub fn get_link_infos(&self, dst: PeerId) -> Result<Vec<LinkInfo>> {
        self.links.clear(dst);
        self.send_peer_links_request(dst)?;

        let mut last_len = 0;
        for _ in 0..LINK_POLL_LIMIT {
            thread::sleep(LINK_POLL_INTERVAL);
            let len = self.links.len(dst);
            if len > 0 {
                if len == last_len {
                    return Ok(self.links.get(dst));
                }
                last_len = len;
            }
        }
        log::debug!("link pages from {} still incomplete", dst);
        Ok(Vec::new())
    }

    pub fn process_peer_links_request(&self, request: PeerLinksRequest) -> Result<()> {
        let subnet = self
            .local_net()
            .ok_or_else(|| Error::Connectivity("local address unknown".into()))?;
        let pages = collect_links(&*self.neighbors, Some(subnet));
        let cookie = generate_cookie();
        let me = self.peer_id();
        log::debug!("answering {} with {} link pages", request.src, pages.len());
        for links in pages {
            self.send_control(ControlMessage::PeerLinksResponse(PeerLinksResponse {
                src: me,
                dst: request.src,
                cookie,
                links,
            }))?;
        }
        Ok(())
    }

    pub fn process_peer_links_response(&self, response: PeerLinksResponse) {
        self.links
            .merge(response.src, response.cookie, response.links);
    }

    // ------------------------------------------------------------------------
    // Configuration Push
    // ------------------------------------------------------------------------

    /// Ask `dst` to change its name or LAN address and wait for the verdict
    pub fn update_config(
        &self,
        dst: PeerId,
        peer_name: Option<String>,
        inner_addr: Option<IpNet>,
    ) -> Outcome {
        let waiter = self.config_acks.register(dst);
        let update = ConfigUpdate {
            src: self.peer_id(),
            dst,
            peer_name,
            inner_addr,
        };
        if let Err(e) = self.send_control(ControlMessage::Config(update)) {
            return Outcome::failure(e.to_string());
        }
        match waiter.wait(CONFIG_TIMEOUT) {
            Some(ack) if ack.ok => Outcome::success(if ack.tip.is_empty() {
                "configuration applied".to_string()
            } else {
                ack.tip
            }),
            Some(ack) => Outcome::failure(ack.tip),
            None => Outcome::failure("no acknowledgment before timeout"),
        }
    }

    /// Remote changes are always refused, but acknowledged
    pub fn process_config(&self, update: ConfigUpdate) -> Result<()> {
        self.send_control(ControlMessage::ConfigAck(ConfigAck {
            src: self.peer_id(),
            dst: update.src,
            ok: false,
            tip: CONFIG_REJECTED_TIP.to_string(),
        }))?;
        Err(Error::Configuration(format!(
            "remote configuration from {} refused",
            update.src
        )))
    }

    pub fn process_config_ack(&self, ack: ConfigAck) {
        let from = ack.src;
        if !self.config_acks.complete(&from, ack) {
            log::debug!("late configuration ack from {}", from);
        }
    }

    // ------------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------------

    /// Route `peer`'s LAN through its virtual address, replacing any earlier
    /// route
    pub fn add_route(&self, peer: PeerId) -> Result<Route> {
        let info = self
            .find_peer(peer)
            .ok_or_else(|| Error::Configuration(format!("unknown peer {}", peer)))?;
        let lan = info
            .inner_addr
            .ok_or_else(|| Error::Configuration(format!("{} has no LAN address", peer)))?;

        self.clean_routes();
        let route = Route {
            dest: lan.network(),
            mask: lan.mask(),
            gateway: info.net_addr.addr,
        };
        self.device.add_route(&route)?;
        log::info!("route {}/{} via {}", route.dest, lan.prefix_len, route.gateway);
        *lock(&self.route) = Some(route);
        Ok(route)
    }

    pub fn clean_routes(&self) {
        let route = lock(&self.route).take();
        if let Some(route) = route {
            if let Err(e) = self.device.del_route(&route) {
                log::warn!("route {} not removed: {}", route.dest, e);
            }
        }
    }

    #[cfg(test)]
    fn backdate_server(&self, by: Duration) {
        lock(&self.server).last_receive -= by;
    }
}

// ============================================================================
// Tests
// ============================================================================
