//! Reachability probe
//!
//! Consulted when the server has been silent past its heartbeat grace and
//! before (re)connecting, to tell a quiet server from a dead network.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Connect timeout for the TCP probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

pub trait Reachability: Send + Sync {
    fn is_reachable(&self) -> bool;
}

/// Probe that never fails; liveness then rests on the offline threshold
pub struct AlwaysReachable;

impl Reachability for AlwaysReachable {
    fn is_reachable(&self) -> bool {
        true
    }
}

/// Probe by opening a TCP connection to a well-known endpoint
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: impl Into<String>) -> Self {
        TcpProbe {
            target: target.into(),
            timeout: PROBE_TIMEOUT,
        }
    }

    fn resolve(&self) -> Option<SocketAddr> {
        match self.target.to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                log::debug!("probe target {} did not resolve: {}", self.target, e);
                None
            }
        }
    }
}

impl Reachability for TcpProbe {
    fn is_reachable(&self) -> bool {
        let Some(addr) = self.resolve() else {
            return false;
        };
        match TcpStream::connect_timeout(&addr, self.timeout) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("probe {} failed: {}", addr, e);
                false
            }
        }
    }
}

/// Probe configured by `probe_addr`, or one that always succeeds
pub fn from_config(probe_addr: Option<&str>) -> Box<dyn Reachability> {
    match probe_addr {
        Some(target) if !target.is_empty() => Box::new(TcpProbe::new(target)),
        _ => Box::new(AlwaysReachable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let probe = TcpProbe::new(listener.local_addr().unwrap().to_string());
        assert!(probe.is_reachable());
    }

    #[test]
    fn test_tcp_probe_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!TcpProbe::new(addr.to_string()).is_reachable());
    }

    #[test]
    fn test_tcp_probe_unresolvable() {
        assert!(!TcpProbe::new("not an address").is_reachable());
    }

    #[test]
    fn test_from_config() {
        assert!(from_config(None).is_reachable());
        assert!(from_config(Some("")).is_reachable());
    }
}
