//! Configuration handling for the link node.
//!
//! Settings come from a YAML file (defaults when it is missing or broken)
//! and are then overridden by environment variables, before the command
//! line gets the final word in `main`.

use anyhow::Result;
use link_session::LinkConfig;
use link_wire::CryptoCaps;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Link node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Device id announced to peers
    pub device_id: String,
    /// Instance id placed in every header
    pub iid: u64,
    /// Listen address for inbound links
    pub listen: Option<SocketAddr>,
    /// Peers to dial, by device id
    pub peers: BTreeMap<String, SocketAddr>,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Link layer settings
    pub link: LinkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let link = LinkConfig::default();
        Self {
            device_id: link.device_id.clone(),
            iid: link.iid,
            listen: None,
            peers: BTreeMap::new(),
            log_level: "info".to_string(),
            link,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    link: Option<LinkSection>,
}

#[derive(Debug, Default, Deserialize)]
struct LinkSection {
    device_id: Option<String>,
    iid: Option<u64>,
    listen: Option<SocketAddr>,
    peers: Option<BTreeMap<String, SocketAddr>>,
    log_level: Option<String>,
    protocol_version: Option<u8>,
    legacy_support: Option<bool>,
    case_sensitive: Option<bool>,
    features: Option<u64>,
    crypto_caps: Option<u32>,
    master_key: Option<String>,
    transport: Option<TransportSection>,
    device_class: Option<u8>,
    timeouts: Option<TimeoutSection>,
    reconnect: Option<ReconnectSection>,
    arm_spin_limit: Option<u32>,
    max_message_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TransportSection {
    udp_port: Option<u16>,
    version: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct TimeoutSection {
    common: Option<String>,
    handshake: Option<String>,
    async_callback_delay: Option<String>,
    release_wait: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReconnectSection {
    attempts: Option<u32>,
    backoff: Option<String>,
    backoff_max: Option<String>,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        // Try to read the config file
        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(section) = root.link {
                        config.apply_section(section)?;
                    }
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            }
        } else {
            warn!("Config file {:?} not found, using defaults", config_path.as_ref());
        }

        // Override with environment variables
        config.apply_environment_overrides();
        config.sync_identity();

        info!(
            "Final link configuration: device_id={}, iid={}, listen={:?}, peers={}",
            config.device_id,
            config.iid,
            config.listen,
            config.peers.len()
        );
        Ok(config)
    }

    /// Link layer configuration with the node identity applied
    pub fn to_link_config(&self) -> LinkConfig {
        let mut link = self.link.clone();
        link.device_id = self.device_id.clone();
        link.iid = self.iid;
        link
    }

    fn sync_identity(&mut self) {
        self.link.device_id = self.device_id.clone();
        self.link.iid = self.iid;
    }

    fn apply_section(&mut self, section: LinkSection) -> Result<()> {
        let link = &mut self.link;
        if let Some(device_id) = section.device_id {
            self.device_id = device_id;
        }
        if let Some(iid) = section.iid {
            self.iid = iid;
        }
        if section.listen.is_some() {
            self.listen = section.listen;
        }
        if let Some(peers) = section.peers {
            self.peers = peers;
        }
        if let Some(level) = section.log_level {
            self.log_level = level;
        }

        if let Some(version) = section.protocol_version {
            link.protocol_version = version;
        }
        if let Some(legacy) = section.legacy_support {
            link.legacy_support = legacy;
        }
        if let Some(case_sensitive) = section.case_sensitive {
            link.case_sensitive = case_sensitive;
        }
        if let Some(features) = section.features {
            link.features = features;
        }
        if let Some(caps) = section.crypto_caps {
            link.crypto_caps = CryptoCaps::from_bits_truncate(caps);
        }
        if let Some(key) = section.master_key {
            link.master_key = Some(key.into_bytes());
        }
        if let Some(transport) = section.transport {
            if let Some(port) = transport.udp_port {
                link.transport_udp_port = port;
            }
            if let Some(version) = transport.version {
                link.transport_version = version;
            }
        }
        if let Some(class) = section.device_class {
            link.device_class = class;
        }

        if let Some(timeouts) = section.timeouts {
            apply_duration(&mut link.common_timeout, timeouts.common)?;
            apply_duration(&mut link.handshake_timeout, timeouts.handshake)?;
            apply_duration(&mut link.async_cb_delay, timeouts.async_callback_delay)?;
            apply_duration(&mut link.release_wait, timeouts.release_wait)?;
        }
        if let Some(reconnect) = section.reconnect {
            if let Some(attempts) = reconnect.attempts {
                link.max_reconnect_attempts = attempts;
            }
            apply_duration(&mut link.reconnect_backoff, reconnect.backoff)?;
            apply_duration(&mut link.reconnect_backoff_max, reconnect.backoff_max)?;
        }
        if let Some(limit) = section.arm_spin_limit {
            link.arm_spin_limit = limit;
        }
        if let Some(size) = section.max_message_size {
            link.max_message_size = size;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(device_id) = std::env::var("LINK_DEVICE_ID") {
            info!("Device id overridden by environment: {}", device_id);
            self.device_id = device_id;
        }

        if let Ok(listen) = std::env::var("LINK_LISTEN") {
            match listen.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.listen = Some(addr);
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(e) => warn!("Ignoring LINK_LISTEN={}: {}", listen, e),
            }
        }

        if let Ok(case_sensitive) = std::env::var("LINK_CASE_SENSITIVE") {
            self.link.case_sensitive = case_sensitive.to_lowercase() == "true";
            info!(
                "Case sensitivity overridden by environment: {}",
                self.link.case_sensitive
            );
        }

        if let Ok(level) = std::env::var("LINK_LOG_LEVEL") {
            self.log_level = level;
        }
    }
}

fn apply_duration(slot: &mut Duration, value: Option<String>) -> Result<()> {
    if let Some(text) = value {
        *slot = humantime::parse_duration(&text)
            .map_err(|e| anyhow::anyhow!("invalid duration {:?}: {}", text, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.device_id, "local");
        assert_eq!(config.log_level, "info");
        assert!(config.listen.is_none());
        assert_eq!(config.link.common_timeout, Duration::from_secs(4));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
link:
  device_id: "device-a"
  iid: 7
  listen: "127.0.0.1:9100"
  peers:
    device-b: "127.0.0.1:9101"
  case_sensitive: false
  features: 12
  crypto_caps: 2
  transport:
    udp_port: 9200
    version: 1
  timeouts:
    common: 6s
    async_callback_delay: 500ms
  reconnect:
    attempts: 5
    backoff: 2s
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();
        let link = config.to_link_config();

        assert_eq!(link.device_id, "device-a");
        assert_eq!(link.iid, 7);
        assert_eq!(config.listen, Some("127.0.0.1:9100".parse().unwrap()));
        assert_eq!(
            config.peers.get("device-b"),
            Some(&"127.0.0.1:9101".parse().unwrap())
        );
        assert!(!link.case_sensitive);
        assert_eq!(link.features, 12);
        assert_eq!(link.crypto_caps, CryptoCaps::KTLS_AES256);
        assert_eq!(link.transport_udp_port, 9200);
        assert_eq!(link.common_timeout, Duration::from_secs(6));
        assert_eq!(link.async_cb_delay, Duration::from_millis(500));
        assert_eq!(link.max_reconnect_attempts, 5);
        assert_eq!(link.reconnect_backoff, Duration::from_secs(2));
        assert_eq!(link.reconnect_backoff_max, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert!(config.peers.is_empty());
        assert_eq!(config.link.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_bad_duration_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"link:\n  timeouts:\n    common: soon\n")
            .unwrap();
        assert!(NodeConfig::load_from_file(temp_file.path()).is_err());
    }
}
