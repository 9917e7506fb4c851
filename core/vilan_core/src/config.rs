//! Application configuration
//!
//! Loaded from a JSON file (`config_app.json` by default). Every field has a
//! default so a partial file, or none at all, yields a usable configuration.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::addr::{IpNet, PeerId};
use crate::crypto::CipherKind;
use crate::error::{Error, Result};
use crate::protocol::DevType;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config_app.json";

// ============================================================================
// Sections
// ============================================================================

/// Transport used for the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Udp,
    Tcp,
}

/// How the virtual IP is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpMode {
    /// Server assigns the address
    #[default]
    Auto,
    /// Address configured locally
    Static,
}

/// Identity of this peer inside its group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub name: String,
    pub group_name: String,
    pub group_pwd: String,
    pub crypt_type: CipherKind,
    /// Key material for the payload cipher; the group password when empty
    pub crypt_key: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            name: default_peer_name(),
            group_name: "default_group".to_string(),
            group_pwd: String::new(),
            crypt_type: CipherKind::Aes,
            crypt_key: String::new(),
        }
    }
}

impl PeerConfig {
    pub fn cipher_key(&self) -> &str {
        if self.crypt_key.is_empty() {
            &self.group_pwd
        } else {
            &self.crypt_key
        }
    }
}

/// Virtual interface settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    pub name: String,
    /// Hardware address; unassigned asks the server for one
    pub hw_mac: PeerId,
    pub ip_mode: IpMode,
    pub ip_addr: Ipv4Addr,
    pub prefix_len: u8,
    pub dev_type: DevType,
}

impl Default for TapConfig {
    fn default() -> Self {
        TapConfig {
            name: "vilan".to_string(),
            hw_mac: PeerId::UNASSIGNED,
            ip_mode: IpMode::Auto,
            ip_addr: Ipv4Addr::UNSPECIFIED,
            prefix_len: 24,
            dev_type: DevType::Tap,
        }
    }
}

impl TapConfig {
    /// Configured virtual address, if one is set
    pub fn net(&self) -> Option<IpNet> {
        let net = IpNet::new(self.ip_addr, self.prefix_len);
        net.is_assignable().then_some(net)
    }
}

// ============================================================================
// AppConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub server_scheme: Scheme,
    /// Heartbeat interval, seconds
    pub heartbeat: u64,
    /// Silence after which the server connection is considered dead, seconds
    pub offline: u64,
    /// Frame ceiling on the control connection
    pub max_packet_size: usize,
    /// Receive batch hint for link reactors
    pub packet_num: usize,
    /// Direct probes sent before a pending link is abandoned
    pub p2p_try_count: u32,
    /// Backoff after a traversal failure, seconds
    pub p2p_retry_interval: u64,
    /// Failures after which traversal to a peer is suppressed
    pub p2p_max_failures: u32,
    /// `host:port` reached by the reachability probe
    pub probe_addr: Option<String>,
    pub peer: PeerConfig,
    pub tap: TapConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            server_ip: "192.168.1.100".to_string(),
            server_port: 3000,
            server_scheme: Scheme::Udp,
            heartbeat: 30,
            offline: 90,
            max_packet_size: 65535,
            packet_num: 128,
            p2p_try_count: 3,
            p2p_retry_interval: 3,
            p2p_max_failures: 10,
            probe_addr: None,
            peer: PeerConfig::default(),
            tap: TapConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Resolve the rendezvous server address
    pub fn server_addr(&self) -> Result<SocketAddr> {
        (self.server_ip.as_str(), self.server_port)
            .to_socket_addrs()
            .map_err(|e| Error::Configuration(format!("server {}: {}", self.server_ip, e)))?
            .next()
            .ok_or_else(|| Error::Configuration(format!("server {} did not resolve", self.server_ip)))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat)
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.offline)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.p2p_retry_interval)
    }

    /// Reject values the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server_ip.is_empty() {
            return Err(Error::Configuration("server_ip is empty".into()));
        }
        if self.heartbeat == 0 {
            return Err(Error::Configuration("heartbeat must be positive".into()));
        }
        if self.offline <= self.heartbeat {
            return Err(Error::Configuration(
                "offline must exceed heartbeat".into(),
            ));
        }
        if self.max_packet_size < 64 {
            return Err(Error::Configuration("max_packet_size too small".into()));
        }
        if self.tap.ip_mode == IpMode::Static && self.tap.net().is_none() {
            return Err(Error::Configuration(
                "static ip_mode needs ip_addr and prefix_len".into(),
            ));
        }
        Ok(())
    }
}

fn default_peer_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "vilan-peer".to_string())
}

// ============================================================================
// Persistence
// ============================================================================

/// Where configuration is loaded from and saved to
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<AppConfig>;
    fn save(&self, config: &AppConfig) -> Result<()>;
}

/// JSON file store
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        JsonFileStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    /// A missing file yields the defaults
    fn load(&self) -> Result<AppConfig> {
        match fs::read_to_string(&self.path) {
            Ok(text) => AppConfig::from_json(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("{} not found, using defaults", self.path.display());
                Ok(AppConfig::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn save(&self, config: &AppConfig) -> Result<()> {
        let text = config.to_json()?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    config: Mutex<AppConfig>,
}

impl MemoryStore {
    pub fn new(config: AppConfig) -> Self {
        MemoryStore {
            config: Mutex::new(config),
        }
    }

    pub fn current(&self) -> AppConfig {
        match self.config.lock() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<AppConfig> {
        Ok(self.current())
    }

    fn save(&self, config: &AppConfig) -> Result<()> {
        match self.config.lock() {
            Ok(mut c) => *c = config.clone(),
            Err(poisoned) => *poisoned.into_inner() = config.clone(),
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = AppConfig::default();
        assert_eq!(c.server_ip, "192.168.1.100");
        assert_eq!(c.server_port, 3000);
        assert_eq!(c.heartbeat, 30);
        assert_eq!(c.offline, 90);
        assert_eq!(c.max_packet_size, 65535);
        assert_eq!(c.p2p_try_count, 3);
        assert_eq!(c.p2p_retry_interval, 3);
        assert_eq!(c.p2p_max_failures, 10);
        assert_eq!(c.peer.group_name, "default_group");
        assert_eq!(c.peer.crypt_type, CipherKind::Aes);
        assert_eq!(c.tap.name, "vilan");
        assert_eq!(c.tap.ip_mode, IpMode::Auto);
        assert!(c.tap.hw_mac.is_unassigned());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let c = AppConfig::from_json(
            r#"{"server_ip": "10.1.1.1", "peer": {"group_name": "lab"}, "tap": {"ip_mode": "static", "ip_addr": "10.0.0.9"}}"#,
        )
        .unwrap();
        assert_eq!(c.server_ip, "10.1.1.1");
        assert_eq!(c.server_port, 3000);
        assert_eq!(c.peer.group_name, "lab");
        assert_eq!(c.peer.crypt_type, CipherKind::Aes);
        assert_eq!(c.tap.ip_mode, IpMode::Static);
        assert_eq!(c.tap.net(), Some(IpNet::new(Ipv4Addr::new(10, 0, 0, 9), 24)));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            AppConfig::from_json("{not json"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects() {
        let mut c = AppConfig::default();
        c.offline = c.heartbeat;
        assert!(c.validate().is_err());

        let mut c = AppConfig::default();
        c.tap.ip_mode = IpMode::Static;
        assert!(c.validate().is_err());

        let mut c = AppConfig::default();
        c.heartbeat = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_server_addr_resolves_ip() {
        let mut c = AppConfig::default();
        c.server_ip = "127.0.0.1".into();
        c.server_port = 4000;
        assert_eq!(c.server_addr().unwrap(), "127.0.0.1:4000".parse().unwrap());
    }

    #[test]
    fn test_cipher_key_falls_back_to_group_pwd() {
        let mut p = PeerConfig::default();
        p.group_pwd = "pwd".into();
        assert_eq!(p.cipher_key(), "pwd");
        p.crypt_key = "key".into();
        assert_eq!(p.cipher_key(), "key");
    }

    #[test]
    fn test_json_file_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("vilan-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let store = JsonFileStore::new(dir.join("config_app.json"));

        // Missing file yields defaults
        assert_eq!(store.load().unwrap(), AppConfig::default());

        let mut c = AppConfig::default();
        c.tap.hw_mac = PeerId(0x0000_1122_3344_5566);
        c.peer.name = "lab-1".into();
        store.save(&c).unwrap();
        assert_eq!(store.load().unwrap(), c);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::default();
        let mut c = store.load().unwrap();
        c.server_port = 1;
        store.save(&c).unwrap();
        assert_eq!(store.current().server_port, 1);
    }
}
