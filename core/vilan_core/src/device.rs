//! Virtual network interface collaborator
//!
//! The interface driver (tun/tap open, address configuration, packet reads)
//! lives outside this crate. Frames read from it enter through
//! `ControlSession::post_tuntap_data`; frames for it leave through
//! [`VirtualDevice::write_frame`].

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::addr::{IpNet, PeerId};
use crate::protocol::DevType;

/// Lifecycle of the virtual interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    UnInit,
    InitFailed,
    InitOk,
    Running,
    Stopped,
}

/// Settings the interface is (re)started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    pub dev_type: DevType,
    pub mac: PeerId,
    pub net: IpNet,
}

/// Route through the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub dest: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

pub trait VirtualDevice: Send + Sync {
    fn start(&self, config: &DeviceConfig) -> io::Result<()>;
    fn stop(&self) -> io::Result<()>;
    fn state(&self) -> DeviceState;
    /// Hand a received Ethernet frame to the OS
    fn write_frame(&self, frame: &[u8]) -> io::Result<usize>;
    fn add_route(&self, route: &Route) -> io::Result<()>;
    fn del_route(&self, route: &Route) -> io::Result<()>;
    fn name(&self) -> String;
}

// ============================================================================
// NullDevice
// ============================================================================

#[derive(Default)]
struct NullInner {
    state: Option<DeviceState>,
    config: Option<DeviceConfig>,
    routes: Vec<Route>,
    frames: Vec<Vec<u8>>,
}

/// Device without an OS interface: remembers its configuration, routes and
/// the frames written to it
#[derive(Default)]
pub struct NullDevice {
    inner: Mutex<NullInner>,
    written: AtomicU64,
    /// Keep at most this many frames (0 keeps none)
    retain: usize,
}

impl NullDevice {
    /// Device that counts frames without keeping them
    pub fn new() -> Self {
        Self::default()
    }

    /// Device that keeps up to `retain` written frames for inspection
    pub fn recording(retain: usize) -> Self {
        NullDevice {
            retain,
            ..Self::default()
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, NullInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn config(&self) -> Option<DeviceConfig> {
        self.inner().config.clone()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.inner().routes.clone()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.inner().frames.clone()
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl VirtualDevice for NullDevice {
    fn start(&self, config: &DeviceConfig) -> io::Result<()> {
        let mut inner = self.inner();
        log::info!(
            "virtual interface {} up: mac {} addr {}",
            config.name,
            config.mac,
            config.net
        );
        inner.config = Some(config.clone());
        inner.state = Some(DeviceState::Running);
        Ok(())
    }

    fn stop(&self) -> io::Result<()> {
        self.inner().state = Some(DeviceState::Stopped);
        Ok(())
    }

    fn state(&self) -> DeviceState {
        self.inner().state.unwrap_or(DeviceState::UnInit)
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        self.written.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner();
        if inner.frames.len() < self.retain {
            inner.frames.push(frame.to_vec());
        }
        Ok(frame.len())
    }

    fn add_route(&self, route: &Route) -> io::Result<()> {
        let mut inner = self.inner();
        if !inner.routes.contains(route) {
            inner.routes.push(*route);
        }
        Ok(())
    }

    fn del_route(&self, route: &Route) -> io::Result<()> {
        self.inner().routes.retain(|r| r != route);
        Ok(())
    }

    fn name(&self) -> String {
        self.inner()
            .config
            .as_ref()
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_device_lifecycle() {
        let dev = NullDevice::recording(2);
        assert_eq!(dev.state(), DeviceState::UnInit);

        let config = DeviceConfig {
            name: "vilan".into(),
            dev_type: DevType::Tap,
            mac: PeerId(0x0000_1122_3344_5566),
            net: IpNet::new(Ipv4Addr::new(10, 0, 0, 5), 24),
        };
        dev.start(&config).unwrap();
        assert_eq!(dev.state(), DeviceState::Running);
        assert_eq!(dev.name(), "vilan");
        assert_eq!(dev.config(), Some(config));

        for i in 0..3u8 {
            assert_eq!(dev.write_frame(&[i; 4]).unwrap(), 4);
        }
        assert_eq!(dev.written(), 3);
        assert_eq!(dev.frames(), vec![vec![0; 4], vec![1; 4]]);

        dev.stop().unwrap();
        assert_eq!(dev.state(), DeviceState::Stopped);
    }

    #[test]
    fn test_null_device_routes() {
        let dev = NullDevice::new();
        let route = Route {
            dest: Ipv4Addr::new(192, 168, 7, 0),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 0, 9),
        };
        dev.add_route(&route).unwrap();
        dev.add_route(&route).unwrap();
        assert_eq!(dev.routes(), vec![route]);
        dev.del_route(&route).unwrap();
        assert!(dev.routes().is_empty());
    }
}
