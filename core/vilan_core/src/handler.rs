//! Connection handlers
//!
//! One handler is attached per connection and routes its lifecycle events to
//! the owning component:
//!
//! ```text
//! ServerHandler    control connection  ─► ControlSession (+ NatTraversal for
//!                                           trigger/ack brokering)
//! PunchHandler     punch socket        ─► NatTraversal
//! PeerLinkHandler  pending/active link ─► NatTraversal, VirtualDevice
//! ```
//!
//! Handlers hold weak references so a connection outliving its component
//! never keeps the component alive.

use std::io;
use std::sync::{Arc, Weak};

use crate::addr::PeerId;
use crate::device::VirtualDevice;
use crate::error::Error;
use crate::nat::NatTraversal;
use crate::protocol::{ControlFrame, ControlMessage, DataFrame, DataKind, Frame};
use crate::session::ControlSession;
use crate::transport::{Connection, Handler, IdleEvent};

// ============================================================================
// Control Dispatch
// ============================================================================

/// Route one control frame to the session or the traversal engine
pub fn dispatch_control(session: &ControlSession, frame: ControlFrame) {
    let kind = frame.body.kind();
    log::trace!("control {} from {}", kind, frame.peer_id);

    let result = match frame.body {
        ControlMessage::AuthAck(ack) => session.process_auth_response(ack),
        ControlMessage::P2PTrigger(trigger) => session
            .nat()
            .process_p2p_trigger(trigger.src)
            .map_err(Error::from),
        ControlMessage::P2PAck(ack) => session.nat().process_p2p_ack(&ack).map_err(Error::from),
        ControlMessage::StateChanged(change) => {
            session.process_peer_state_changed(change);
            Ok(())
        }
        ControlMessage::Pong(pong) => {
            session.process_pong(pong);
            Ok(())
        }
        ControlMessage::GroupPeersResponse(response) => {
            session.process_group_peers_response(response);
            Ok(())
        }
        ControlMessage::PeerLinksRequest(request) => session.process_peer_links_request(request),
        ControlMessage::PeerLinksResponse(response) => {
            session.process_peer_links_response(response);
            Ok(())
        }
        ControlMessage::Config(update) => session.process_config(update),
        ControlMessage::ConfigAck(ack) => {
            session.process_config_ack(ack);
            Ok(())
        }
        _ => {
            log::debug!("unexpected {} message from server", kind);
            Ok(())
        }
    };

    if let Err(e) = result {
        log::warn!("{} not processed: {}", kind, e);
    }
}

// ============================================================================
// Server Connection
// ============================================================================

pub struct ServerHandler {
    session: Weak<ControlSession>,
    generation: u64,
}

impl ServerHandler {
    pub fn new(session: Weak<ControlSession>, generation: u64) -> Self {
        ServerHandler {
            session,
            generation,
        }
    }
}

impl Handler for ServerHandler {
    fn on_active(&self, conn: &Connection) {
        match self.session.upgrade() {
            Some(session) => session.server_active(self.generation, conn),
            None => conn.close(),
        }
    }

    fn on_read(&self, conn: &Connection, frame: Frame) {
        if let Some(session) = self.session.upgrade() {
            session.server_read(self.generation, conn, frame);
        }
    }

    fn on_idle(&self, _conn: &Connection, _event: IdleEvent) {
        if let Some(session) = self.session.upgrade() {
            session.server_idle(self.generation);
        }
    }

    fn on_exception(&self, conn: &Connection, fault: &io::Error) {
        log::warn!("server connection {:?}: {}", conn, fault);
        if let Some(session) = self.session.upgrade() {
            session.server_down(self.generation, conn);
        }
    }

    fn on_inactive(&self, conn: &Connection) {
        log::debug!("server connection {:?} inactive", conn);
        if let Some(session) = self.session.upgrade() {
            session.server_down(self.generation, conn);
        }
    }
}

// ============================================================================
// Punch Socket
// ============================================================================

pub struct PunchHandler {
    peer: PeerId,
    generation: u64,
    engine: Weak<NatTraversal>,
}

impl PunchHandler {
    pub fn new(peer: PeerId, generation: u64, engine: Weak<NatTraversal>) -> Self {
        PunchHandler {
            peer,
            generation,
            engine,
        }
    }
}

impl Handler for PunchHandler {
    fn on_active(&self, conn: &Connection) {
        match self.engine.upgrade() {
            Some(engine) => engine.punch_active(self.peer, self.generation, conn),
            None => conn.close(),
        }
    }

    fn on_read(&self, _conn: &Connection, frame: Frame) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let result = match frame {
            Frame::Control(ControlFrame {
                body: ControlMessage::P2PAck(ack),
                ..
            }) => engine.process_p2p_ack(&ack),
            Frame::Control(ControlFrame {
                body: ControlMessage::P2PTrigger(trigger),
                ..
            }) => engine.process_p2p_trigger(trigger.src),
            other => {
                log::debug!("punch socket for {} ignored {:?}", self.peer, other);
                Ok(())
            }
        };
        if let Err(e) = result {
            log::debug!("traversal with {}: {}", self.peer, e);
        }
    }

    fn on_inactive(&self, conn: &Connection) {
        if let Some(engine) = self.engine.upgrade() {
            engine.punch_closed(self.peer, conn);
        }
    }
}

// ============================================================================
// Direct Peer Link
// ============================================================================

pub struct PeerLinkHandler {
    peer: PeerId,
    generation: u64,
    engine: Weak<NatTraversal>,
    device: Arc<dyn VirtualDevice>,
}

impl PeerLinkHandler {
    pub fn new(
        peer: PeerId,
        generation: u64,
        engine: Weak<NatTraversal>,
        device: Arc<dyn VirtualDevice>,
    ) -> Self {
        PeerLinkHandler {
            peer,
            generation,
            engine,
            device,
        }
    }
}

impl Handler for PeerLinkHandler {
    fn on_active(&self, conn: &Connection) {
        match self.engine.upgrade() {
            Some(engine) => engine.link_active(self.peer, self.generation, conn),
            None => conn.close(),
        }
    }

    fn on_read(&self, conn: &Connection, frame: Frame) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let data = match frame {
            Frame::Data(data) => data,
            Frame::Control(control) => {
                log::debug!(
                    "control {} on direct link to {} ignored",
                    control.body.kind(),
                    self.peer
                );
                return;
            }
        };
        if data.src != self.peer {
            log::debug!("frame from {} on link to {} dropped", data.src, self.peer);
            return;
        }

        engine.link_received(self.peer, conn);
        match data.kind {
            DataKind::Packet => {
                log::trace!("{} bytes direct from {}", data.data.len(), self.peer);
                if let Err(e) = self.device.write_frame(&data.data) {
                    log::debug!("frame from {} not written: {}", self.peer, e);
                }
            }
            DataKind::P2PTry => engine.p2p_success(self.peer, conn),
            DataKind::Ping => {
                let pong = DataFrame::signal(DataKind::Pong, engine.local_id(), self.peer);
                if let Err(e) = conn.write(pong) {
                    log::debug!("pong to {} failed: {}", self.peer, e);
                }
            }
            DataKind::Pong => {}
        }
    }

    fn on_idle(&self, conn: &Connection, _event: IdleEvent) {
        if let Some(engine) = self.engine.upgrade() {
            engine.link_idle(self.peer, conn);
        }
    }

    fn on_inactive(&self, conn: &Connection) {
        if let Some(engine) = self.engine.upgrade() {
            engine.link_closed(self.peer, conn);
        }
    }
}
