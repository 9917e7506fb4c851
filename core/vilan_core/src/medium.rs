//! Link medium sampling
//!
//! Registration and heartbeats report which medium the control connection
//! leaves through and how good it is. The interface is found from the
//! connection's local address by longest-prefix match over the kernel's
//! connected routes, which also yields the LAN prefix.
//!
//! ```text
//!   local addr ─► /proc/net/route ─► iface, prefix
//!                                      │
//!                 /sys/class/net/<iface> ─► medium
//!                 /proc/net/wireless     ─► signal level (Wi-Fi only)
//! ```

use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::protocol::LinkMode;

/// Quality reported when the medium has no meaningful signal figure
pub const QUALITY_UNKNOWN: u32 = 101;

/// Wi-Fi quality when the signal level cannot be read
pub const WIFI_QUALITY_FALLBACK: u32 = 88;

/// ARPHRD_ETHER
const ARPHRD_ETHER: u32 = 1;
/// ARPHRD_PPP and ARPHRD_RAWIP, used by modem drivers
const ARPHRD_MODEM: [u32; 2] = [512, 519];

const CELLULAR_PREFIXES: [&str; 3] = ["wwan", "rmnet", "ccmni"];

// ============================================================================
// Sample
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSample {
    pub mode: LinkMode,
    pub quality: u32,
    /// Prefix of the interface's subnet, when known
    pub prefix_len: Option<u8>,
}

impl LinkSample {
    pub fn unknown() -> Self {
        LinkSample {
            mode: LinkMode::Unknown,
            quality: QUALITY_UNKNOWN,
            prefix_len: None,
        }
    }
}

impl Default for LinkSample {
    fn default() -> Self {
        Self::unknown()
    }
}

pub trait LinkSampler: Send + Sync {
    /// Describe the interface owning `local`
    fn sample(&self, local: Ipv4Addr) -> LinkSample;
}

// ============================================================================
// Linux Sampler
// ============================================================================

/// Reads `/proc/net` and `/sys/class/net`
pub struct SysLinkSampler {
    proc_net: PathBuf,
    sys_net: PathBuf,
}

impl SysLinkSampler {
    pub fn new() -> Self {
        Self::with_roots("/proc/net", "/sys/class/net")
    }

    pub fn with_roots(proc_net: impl Into<PathBuf>, sys_net: impl Into<PathBuf>) -> Self {
        SysLinkSampler {
            proc_net: proc_net.into(),
            sys_net: sys_net.into(),
        }
    }

    fn read(&self, path: PathBuf) -> Option<String> {
        match fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(e) => {
                log::debug!("cannot read {}: {}", path.display(), e);
                None
            }
        }
    }

    fn medium(&self, iface: &str) -> LinkMode {
        let dir = self.sys_net.join(iface);
        if dir.join("wireless").exists() || dir.join("phy80211").exists() {
            return LinkMode::Wifi;
        }
        let kind = fs::read_to_string(dir.join("type"))
            .ok()
            .and_then(|t| t.trim().parse::<u32>().ok());
        if CELLULAR_PREFIXES.iter().any(|p| iface.starts_with(p))
            || kind.map_or(false, |k| ARPHRD_MODEM.contains(&k))
        {
            return LinkMode::Cellular;
        }
        match kind {
            Some(ARPHRD_ETHER) => LinkMode::Ethernet,
            _ => LinkMode::Unknown,
        }
    }
}

impl Default for SysLinkSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkSampler for SysLinkSampler {
    fn sample(&self, local: Ipv4Addr) -> LinkSample {
        let Some(routes) = self.read(self.proc_net.join("route")) else {
            return LinkSample::unknown();
        };
        let table = parse_route_table(&routes);
        let Some(route) = owning_route(&table, local) else {
            log::debug!("no connected route covers {}", local);
            return LinkSample::unknown();
        };

        let mode = self.medium(&route.iface);
        let quality = match mode {
            LinkMode::Wifi => self
                .read(self.proc_net.join("wireless"))
                .and_then(|text| parse_wireless_level(&text, &route.iface))
                .map(wifi_quality)
                .unwrap_or(WIFI_QUALITY_FALLBACK),
            _ => QUALITY_UNKNOWN,
        };
        log::debug!(
            "{} leaves via {} ({:?}, quality {}, /{})",
            local,
            route.iface,
            mode,
            quality,
            route.prefix_len
        );
        LinkSample {
            mode,
            quality,
            prefix_len: Some(route.prefix_len),
        }
    }
}

// ============================================================================
// Parsers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub iface: String,
    pub dest: Ipv4Addr,
    pub prefix_len: u8,
}

impl Route {
    fn covers(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::MAX
            .checked_shl(32 - u32::from(self.prefix_len))
            .unwrap_or(0);
        u32::from(ip) & mask == u32::from(self.dest) & mask
    }
}

/// Routes without a gateway from a `/proc/net/route` dump (header skipped)
///
/// Addresses and masks are hex in host (little-endian) byte order.
pub fn parse_route_table(text: &str) -> Vec<Route> {
    fn hex_addr(col: &str) -> Option<Ipv4Addr> {
        u32::from_str_radix(col, 16)
            .ok()
            .map(|v| Ipv4Addr::from(v.to_le_bytes()))
    }

    text.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let iface = *cols.first()?;
            let dest = hex_addr(cols.get(1)?)?;
            let gateway = hex_addr(cols.get(2)?)?;
            let mask = hex_addr(cols.get(7)?)?;
            gateway.is_unspecified().then(|| Route {
                iface: iface.to_string(),
                dest,
                prefix_len: u32::from(mask).count_ones() as u8,
            })
        })
        .collect()
}

/// Most specific non-default route containing `ip`
pub fn owning_route(routes: &[Route], ip: Ipv4Addr) -> Option<&Route> {
    routes
        .iter()
        .filter(|r| r.prefix_len > 0 && r.covers(ip))
        .max_by_key(|r| r.prefix_len)
}

/// Signal level of `iface` in dBm from a `/proc/net/wireless` dump
pub fn parse_wireless_level(text: &str, iface: &str) -> Option<i32> {
    text.lines().skip(2).find_map(|line| {
        let (name, rest) = line.trim_start().split_once(':')?;
        if name != iface {
            return None;
        }
        let level = rest.split_whitespace().nth(2)?;
        level
            .trim_end_matches('.')
            .parse::<f64>()
            .ok()
            .map(|dbm| dbm.round() as i32)
    })
}

/// Map a signal level onto 0..=100, -120 dBm being nothing
pub fn wifi_quality(dbm: i32) -> u32 {
    ((dbm + 120) * 100 / 90).clamp(0, 100) as u32
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    const ROUTE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
wlan0\t0000000A\t00000000\t0001\t0\t0\t600\t0000FFFF\t0\t0\t0
wwan0\t0500000A\t00000000\t0005\t0\t0\t0\tFFFFFFFF\t0\t0\t0
";

    const WIRELESS: &str = "\
Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
 face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
 wlan0: 0000   54.  -56.  -256        0      0      0      0     22        0
";

    static NEXT_ROOT: AtomicU32 = AtomicU32::new(0);

    /// Scratch `/proc/net` and `/sys/class/net` trees
    struct Roots {
        base: PathBuf,
    }

    impl Roots {
        fn new() -> Self {
            let base = std::env::temp_dir().join(format!(
                "vilan-medium-{}-{}",
                std::process::id(),
                NEXT_ROOT.fetch_add(1, Ordering::Relaxed)
            ));
            fs::create_dir_all(base.join("proc")).unwrap();
            fs::create_dir_all(base.join("sys")).unwrap();
            fs::write(base.join("proc/route"), ROUTE).unwrap();
            Roots { base }
        }

        fn iface(&self, name: &str, kind: u32, wireless: bool) -> &Self {
            let dir = self.base.join("sys").join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("type"), format!("{}\n", kind)).unwrap();
            if wireless {
                fs::create_dir_all(dir.join("wireless")).unwrap();
            }
            self
        }

        fn write(&self, rel: impl AsRef<Path>, text: &str) {
            fs::write(self.base.join(rel), text).unwrap();
        }

        fn sampler(&self) -> SysLinkSampler {
            SysLinkSampler::with_roots(self.base.join("proc"), self.base.join("sys"))
        }
    }

    impl Drop for Roots {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.base);
        }
    }

    #[test]
    fn test_parse_route_table() {
        let routes = parse_route_table(ROUTE);
        assert_eq!(
            routes,
            vec![
                Route {
                    iface: "eth0".into(),
                    dest: Ipv4Addr::new(192, 168, 1, 0),
                    prefix_len: 24
                },
                Route {
                    iface: "wlan0".into(),
                    dest: Ipv4Addr::new(10, 0, 0, 0),
                    prefix_len: 16
                },
                Route {
                    iface: "wwan0".into(),
                    dest: Ipv4Addr::new(10, 0, 0, 5),
                    prefix_len: 32
                },
            ]
        );
    }

    #[test]
    fn test_owning_route_longest_prefix() {
        let routes = parse_route_table(ROUTE);
        let find = |ip| owning_route(&routes, ip).map(|r| r.iface.as_str());
        assert_eq!(find(Ipv4Addr::new(192, 168, 1, 20)), Some("eth0"));
        assert_eq!(find(Ipv4Addr::new(10, 0, 3, 4)), Some("wlan0"));
        assert_eq!(find(Ipv4Addr::new(10, 0, 0, 5)), Some("wwan0"));
        assert_eq!(find(Ipv4Addr::new(172, 16, 0, 1)), None);
    }

    #[test]
    fn test_parse_wireless_level() {
        assert_eq!(parse_wireless_level(WIRELESS, "wlan0"), Some(-56));
        assert_eq!(parse_wireless_level(WIRELESS, "wlan1"), None);
        assert_eq!(parse_wireless_level("", "wlan0"), None);
    }

    #[test]
    fn test_wifi_quality_scale() {
        assert_eq!(wifi_quality(-120), 0);
        assert_eq!(wifi_quality(-56), 71);
        assert_eq!(wifi_quality(-30), 100);
        assert_eq!(wifi_quality(-10), 100);
        assert_eq!(wifi_quality(-150), 0);
    }

    #[test]
    fn test_sample_ethernet() {
        let roots = Roots::new();
        roots.iface("eth0", 1, false);
        let sample = roots.sampler().sample(Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(
            sample,
            LinkSample {
                mode: LinkMode::Ethernet,
                quality: QUALITY_UNKNOWN,
                prefix_len: Some(24),
            }
        );
    }

    #[test]
    fn test_sample_wifi_signal() {
        let roots = Roots::new();
        roots.iface("wlan0", 1, true);
        let sampler = roots.sampler();
        let local = Ipv4Addr::new(10, 0, 3, 4);

        // Level unreadable
        let sample = sampler.sample(local);
        assert_eq!(sample.mode, LinkMode::Wifi);
        assert_eq!(sample.quality, WIFI_QUALITY_FALLBACK);
        assert_eq!(sample.prefix_len, Some(16));

        roots.write("proc/wireless", WIRELESS);
        assert_eq!(sampler.sample(local).quality, 71);
    }

    #[test]
    fn test_sample_cellular() {
        let roots = Roots::new();
        roots.iface("wwan0", 519, false);
        let sample = roots.sampler().sample(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(sample.mode, LinkMode::Cellular);
        assert_eq!(sample.quality, QUALITY_UNKNOWN);
        assert_eq!(sample.prefix_len, Some(32));
    }

    #[test]
    fn test_sample_unknown_without_route() {
        let roots = Roots::new();
        assert_eq!(
            roots.sampler().sample(Ipv4Addr::new(172, 16, 0, 1)),
            LinkSample::unknown()
        );
        let missing = SysLinkSampler::with_roots(roots.base.join("none"), roots.base.join("none"));
        assert_eq!(missing.sample(Ipv4Addr::new(192, 168, 1, 20)), LinkSample::unknown());
    }
}
