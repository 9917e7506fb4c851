//! Traffic counters for the relay and direct paths.
//!
//! Uses atomic counters for lock-free updates from link reactors. A snapshot
//! travels in every heartbeat; `render` produces Prometheus text for
//! diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::protocol::Statistics;

/// Bytes accounted per data frame on top of its payload
pub const FRAME_OVERHEAD: u64 = 30;

pub struct TrafficStats {
    /// Bytes sent through the rendezvous server (counter)
    pub relay_send: AtomicU64,
    /// Bytes received through the rendezvous server (counter)
    pub relay_receive: AtomicU64,
    /// Bytes sent over direct links (counter)
    pub direct_send: AtomicU64,
    /// Bytes received over direct links (counter)
    pub direct_receive: AtomicU64,
    pub start_time: Instant,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self {
            relay_send: AtomicU64::new(0),
            relay_receive: AtomicU64::new(0),
            direct_send: AtomicU64::new(0),
            direct_receive: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Account `bytes` in the counter selected by direction and path
    pub fn record(&self, bytes: u64, receive: bool, direct: bool) {
        let counter = match (receive, direct) {
            (false, false) => &self.relay_send,
            (true, false) => &self.relay_receive,
            (false, true) => &self.direct_send,
            (true, true) => &self.direct_receive,
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Statistics {
        Statistics {
            relay_send: self.relay_send.load(Ordering::Relaxed),
            relay_receive: self.relay_receive.load(Ordering::Relaxed),
            direct_send: self.direct_send.load(Ordering::Relaxed),
            direct_receive: self.direct_receive.load(Ordering::Relaxed),
        }
    }

    /// Render counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        format!(
            "# HELP vilan_relay_send_bytes_total Bytes sent through the rendezvous server\n\
             # TYPE vilan_relay_send_bytes_total counter\n\
             vilan_relay_send_bytes_total {}\n\
             # HELP vilan_relay_receive_bytes_total Bytes received through the rendezvous server\n\
             # TYPE vilan_relay_receive_bytes_total counter\n\
             vilan_relay_receive_bytes_total {}\n\
             # HELP vilan_direct_send_bytes_total Bytes sent over direct links\n\
             # TYPE vilan_direct_send_bytes_total counter\n\
             vilan_direct_send_bytes_total {}\n\
             # HELP vilan_direct_receive_bytes_total Bytes received over direct links\n\
             # TYPE vilan_direct_receive_bytes_total counter\n\
             vilan_direct_receive_bytes_total {}\n\
             # HELP vilan_uptime_seconds Peer uptime in seconds\n\
             # TYPE vilan_uptime_seconds gauge\n\
             vilan_uptime_seconds {}\n",
            s.relay_send,
            s.relay_receive,
            s.direct_send,
            s.direct_receive,
            self.start_time.elapsed().as_secs(),
        )
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_selects_counter() {
        let stats = TrafficStats::new();
        stats.record(100, false, false);
        stats.record(200, true, false);
        stats.record(300, false, true);
        stats.record(400, true, true);
        stats.record(1, true, true);

        let s = stats.snapshot();
        assert_eq!(s.relay_send, 100);
        assert_eq!(s.relay_receive, 200);
        assert_eq!(s.direct_send, 300);
        assert_eq!(s.direct_receive, 401);
    }

    #[test]
    fn test_render_format() {
        let stats = TrafficStats::new();
        stats.record(42, false, false);
        stats.record(8192, true, true);
        let output = stats.render();
        assert!(output.contains("vilan_relay_send_bytes_total 42"));
        assert!(output.contains("vilan_direct_receive_bytes_total 8192"));
        assert!(output.contains("vilan_relay_receive_bytes_total 0"));
        assert!(output.contains("# TYPE vilan_uptime_seconds gauge"));
        assert!(output
            .lines()
            .any(|l| l.starts_with("vilan_uptime_seconds ")));
    }
}
