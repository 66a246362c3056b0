//! Configuration management for the tetherd daemon.
//!
//! Two files live in the data directory:
//! - **tether.toml** — host configuration, auto-generated with defaults
//!   (including a fresh device id) on first run.
//! - **peers.toml** — persisted per-peer state (paired flag, pinned
//!   certificate fingerprint, remembered addresses), written through
//!   [`KnownPeers`] whenever it changes.

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppError;
use crate::message::{DeviceType, Identity, PROTOCOL_VERSION};

/// Platform-specific data directory for tetherd.
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tetherd")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tetherd")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable host device id, generated once and persisted.
    pub id: String,
    pub name: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Control-channel listener binds to the first free port in this range.
    #[serde(default = "default_control_ports")]
    pub control_ports: (u16, u16),
    /// Payload channels bind within this range; disjoint from control_ports.
    #[serde(default = "default_payload_ports")]
    pub payload_ports: (u16, u16),
    #[serde(default = "default_announcement_interval")]
    pub min_announcement_interval_secs: u64,
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u64,
    #[serde(default = "default_payload_timeout")]
    pub payload_listen_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_device_type() -> String {
    "desktop".to_string()
}
fn default_discovery_port() -> u16 {
    1716
}
fn default_control_ports() -> (u16, u16) {
    (1716, 1738)
}
fn default_payload_ports() -> (u16, u16) {
    (1739, 1764)
}
fn default_announcement_interval() -> u64 {
    30
}
fn default_pairing_timeout() -> u64 {
    30
}
fn default_payload_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Generate a stable device id: 32 alphanumeric characters, safe for use
/// in file names and certificate common names.
pub fn generate_device_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.split('.').next().unwrap_or(&h).to_string())
        .unwrap_or_else(|| "tetherd".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                id: generate_device_id(),
                name: local_host_name(),
                device_type: default_device_type(),
            },
            network: NetworkConfig {
                discovery_port: default_discovery_port(),
                control_ports: default_control_ports(),
                payload_ports: default_payload_ports(),
                min_announcement_interval_secs: default_announcement_interval(),
                pairing_timeout_secs: default_pairing_timeout(),
                payload_listen_timeout_secs: default_payload_timeout(),
            },
            logging: LoggingConfig { level: default_log_level() },
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| AppError::Config(e.to_string()))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Load the config, generating and persisting defaults on first run.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from_file(path)
        } else {
            let config = Self::default();
            config.save_to_file(path)?;
            Ok(config)
        }
    }

    /// Host identity as announced over discovery and TCP handshakes.
    /// `tcp_port` is included only for UDP announcements.
    pub fn host_identity(
        &self,
        tcp_port: Option<u16>,
        incoming: impl IntoIterator<Item = String>,
        outgoing: impl IntoIterator<Item = String>,
    ) -> Identity {
        Identity {
            device_id: self.device.id.clone(),
            device_name: self.device.name.clone(),
            device_type: DeviceType::parse(&self.device.device_type),
            protocol_version: PROTOCOL_VERSION,
            tcp_port,
            incoming_capabilities: incoming.into_iter().collect(),
            outgoing_capabilities: outgoing.into_iter().collect(),
        }
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.network.pairing_timeout_secs)
    }

    pub fn payload_listen_timeout(&self) -> Duration {
        Duration::from_secs(self.network.payload_listen_timeout_secs)
    }
}

/// Persisted state for one known peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerRecord {
    pub name: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub paired: bool,
    /// SHA-256 fingerprint of the pinned certificate, for display and
    /// cross-checking against the trust store.
    #[serde(default)]
    pub cert_fingerprint: Option<String>,
    /// Last seen socket addresses, targeted by unicast announcements.
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PeerFile {
    #[serde(default)]
    peers: HashMap<String, PeerRecord>,
}

/// Mutex-guarded, write-through store of every peer this host has seen.
pub struct KnownPeers {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, PeerRecord>>,
}

impl KnownPeers {
    /// In-memory store, used by tests and by hosts without a data dir.
    pub fn ephemeral() -> Self {
        Self { path: None, entries: Mutex::new(HashMap::new()) }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = fs::read_to_string(&path)
            .ok()
            .and_then(|text| toml::from_str::<PeerFile>(&text).ok())
            .map(|f| f.peers)
            .unwrap_or_default();
        Self { path: Some(path), entries: Mutex::new(entries) }
    }

    fn save_locked(&self, entries: &HashMap<String, PeerRecord>) {
        let Some(path) = &self.path else { return };
        let file = PeerFile { peers: entries.clone() };
        match toml::to_string_pretty(&file) {
            Ok(text) => {
                if let Some(parent) = path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(e) = fs::write(path, text) {
                    tracing::warn!("Failed to persist peer store: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize peer store: {}", e),
        }
    }

    pub fn record(&self, device_id: &str) -> PeerRecord {
        self.entries.lock().get(device_id).cloned().unwrap_or_default()
    }

    pub fn is_paired(&self, device_id: &str) -> bool {
        self.entries.lock().get(device_id).map(|r| r.paired).unwrap_or(false)
    }

    pub fn update_identity(&self, device_id: &str, name: &str, device_type: DeviceType) {
        let mut entries = self.entries.lock();
        let record = entries.entry(device_id.to_string()).or_default();
        if record.name != name || record.device_type != device_type.as_str() {
            record.name = name.to_string();
            record.device_type = device_type.as_str().to_string();
            self.save_locked(&entries);
        }
    }

    pub fn set_paired(&self, device_id: &str, paired: bool, cert_fingerprint: Option<String>) {
        let mut entries = self.entries.lock();
        let record = entries.entry(device_id.to_string()).or_default();
        if record.paired != paired || record.cert_fingerprint != cert_fingerprint {
            record.paired = paired;
            record.cert_fingerprint = cert_fingerprint;
            self.save_locked(&entries);
        }
    }

    /// Remember an address a paired peer was reached at, newest first.
    pub fn remember_address(&self, device_id: &str, addr: SocketAddr) {
        let mut entries = self.entries.lock();
        let record = entries.entry(device_id.to_string()).or_default();
        let addr = addr.to_string();
        if record.addresses.first() == Some(&addr) {
            return;
        }
        record.addresses.retain(|a| a != &addr);
        record.addresses.insert(0, addr);
        record.addresses.truncate(4);
        self.save_locked(&entries);
    }

    /// All persisted peers that completed pairing at some point.
    pub fn paired_peers(&self) -> Vec<(String, PeerRecord)> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, r)| r.paired)
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    /// Remembered addresses of paired peers, for unicast announcements.
    pub fn remembered_addresses(&self) -> Vec<SocketAddr> {
        self.entries
            .lock()
            .values()
            .filter(|r| r.paired)
            .flat_map(|r| r.addresses.iter().filter_map(|a| a.parse().ok()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.device.id, config.device.id);
        assert_eq!(parsed.network.discovery_port, 1716);
        assert_eq!(parsed.network.payload_ports, (1739, 1764));
    }

    #[test]
    fn device_ids_are_filename_safe() {
        let id = generate_device_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn port_ranges_are_disjoint() {
        let config = Config::default();
        assert!(config.network.control_ports.1 < config.network.payload_ports.0);
    }

    #[test]
    fn peer_store_persists_pairing_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.toml");

        let store = KnownPeers::load(&path);
        store.update_identity("dev1", "Phone", DeviceType::Phone);
        store.set_paired("dev1", true, Some("ab".repeat(32)));
        store.remember_address("dev1", "192.168.1.20:1716".parse().unwrap());

        let reloaded = KnownPeers::load(&path);
        assert!(reloaded.is_paired("dev1"));
        assert_eq!(reloaded.record("dev1").name, "Phone");
        assert_eq!(reloaded.remembered_addresses().len(), 1);
        assert_eq!(reloaded.paired_peers().len(), 1);
    }

    #[test]
    fn remember_address_deduplicates_and_bounds() {
        let store = KnownPeers::ephemeral();
        store.set_paired("dev1", true, None);
        for port in [1, 2, 3, 4, 5, 1] {
            store.remember_address("dev1", format!("10.0.0.1:{port}").parse().unwrap());
        }
        let record = store.record("dev1");
        assert_eq!(record.addresses.len(), 4);
        assert_eq!(record.addresses[0], "10.0.0.1:1");
    }
}
