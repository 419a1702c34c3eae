//! Runtime knobs of a link node.

use link_wire::{CryptoCaps, DEFAULT_MAX_MESSAGE_SIZE, VERSION_EXTENDED};
use std::time::Duration;

/// Configuration for a [`LinkNode`](crate::LinkNode)
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Stable device id announced in every handshake (at most 64 bytes)
    pub device_id: String,
    /// Instance id placed in `source_id` of every header
    pub iid: u64,
    /// Highest protocol version this node speaks
    pub protocol_version: u8,
    /// Accept peers that only speak the legacy version
    pub legacy_support: bool,
    /// Whether the local namespace is case sensitive
    pub case_sensitive: bool,
    /// Local feature bitmap
    pub features: u64,
    /// Crypto suites offered during negotiation
    pub crypto_caps: CryptoCaps,
    /// Master key for per-direction key derivation; no keys without it
    pub master_key: Option<Vec<u8>>,
    /// UDP port of the alternate transport, 0 when disabled
    pub transport_udp_port: u16,
    /// Alternate transport protocol version
    pub transport_version: u8,
    /// Device class announced to peers
    pub device_class: u8,
    /// Deadline of commands in the common timeout class
    pub common_timeout: Duration,
    /// How long the first message of an accepted stream may take
    pub handshake_timeout: Duration,
    /// Delay between the sync and async halves of a peer event
    pub async_cb_delay: Duration,
    /// Reconnect attempts before a peer is declared offline
    pub max_reconnect_attempts: u32,
    /// First reconnect backoff, doubled per attempt
    pub reconnect_backoff: Duration,
    /// Reconnect backoff cap
    pub reconnect_backoff_max: Duration,
    /// Upper bound on waiting for in-flight senders and readers on disconnect
    pub release_wait: Duration,
    /// Yields spent waiting for the armed flag before an early response is delivered anyway
    pub arm_spin_limit: u32,
    /// Largest envelope accepted or sent
    pub max_message_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_id: "local".to_string(),
            iid: 1,
            protocol_version: VERSION_EXTENDED,
            legacy_support: true,
            case_sensitive: true,
            features: 0,
            crypto_caps: CryptoCaps::KTLS_AES128 | CryptoCaps::KTLS_AES256,
            master_key: None,
            transport_udp_port: 0,
            transport_version: 0,
            device_class: 0,
            common_timeout: Duration::from_secs(4),
            handshake_timeout: Duration::from_secs(10),
            async_cb_delay: Duration::from_secs(2),
            max_reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(30),
            release_wait: Duration::from_secs(3),
            arm_spin_limit: 1000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl LinkConfig {
    /// Lowest peer version this node will complete a handshake with
    pub fn min_peer_version(&self) -> u8 {
        if self.legacy_support {
            link_wire::VERSION_LEGACY
        } else {
            VERSION_EXTENDED
        }
    }
}
