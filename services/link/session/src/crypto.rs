//! Per-direction link keys derived from the master key.
//!
//! Both ends derive the same two keys with HMAC-SHA256 over a fixed label.
//! The side that finishes the handshake on ACK sends with the initiator key;
//! the side that finishes on RESPONSE sends with the accepter key, so one
//! end's send key is always the other end's receive key.

use hmac::{Hmac, Mac};
use link_wire::{CryptoCaps, HandshakeStep};
use sha2::Sha256;

use crate::LinkError;

type HmacSha256 = Hmac<Sha256>;

/// Length of a derived key
pub const KEY_LEN: usize = 32;

const INITIATOR_LABEL: &[u8] = b"initiator";
const ACCEPTER_LABEL: &[u8] = b"accepter";

/// Keys installed on a connection once negotiation finishes
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Suite both ends agreed on
    pub suite: CryptoCaps,
    /// Key protecting outbound bytes
    pub send: [u8; KEY_LEN],
    /// Key protecting inbound bytes
    pub recv: [u8; KEY_LEN],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

/// HMAC-SHA256 of `label` under `master`
pub fn derive_key(master: &[u8], label: &[u8]) -> Result<[u8; KEY_LEN], LinkError> {
    let mut mac = HmacSha256::new_from_slice(master)
        .map_err(|_| LinkError::Negotiation("unusable master key".to_string()))?;
    mac.update(label);
    Ok(mac.finalize().into_bytes().into())
}

/// Strongest suite offered by both sides
pub fn negotiate_suite(local: CryptoCaps, remote: CryptoCaps) -> Option<CryptoCaps> {
    let common = local & remote;
    if common.contains(CryptoCaps::KTLS_AES256) {
        Some(CryptoCaps::KTLS_AES256)
    } else if common.contains(CryptoCaps::KTLS_AES128) {
        Some(CryptoCaps::KTLS_AES128)
    } else {
        None
    }
}

/// Derive the key pair for the side that finishes on `step`
pub fn session_keys(
    master: &[u8],
    suite: CryptoCaps,
    finished_on: HandshakeStep,
) -> Result<SessionKeys, LinkError> {
    let initiator = derive_key(master, INITIATOR_LABEL)?;
    let accepter = derive_key(master, ACCEPTER_LABEL)?;
    let (send, recv) = match finished_on {
        HandshakeStep::Ack => (initiator, accepter),
        HandshakeStep::Response => (accepter, initiator),
        HandshakeStep::Request => {
            return Err(LinkError::Negotiation(
                "keys cannot be installed on REQUEST".to_string(),
            ))
        }
    };
    Ok(SessionKeys { suite, send, recv })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directions_mirror() {
        let master = b"shared master secret";
        let on_ack = session_keys(master, CryptoCaps::KTLS_AES128, HandshakeStep::Ack).unwrap();
        let on_resp =
            session_keys(master, CryptoCaps::KTLS_AES128, HandshakeStep::Response).unwrap();
        assert_eq!(on_ack.send, on_resp.recv);
        assert_eq!(on_ack.recv, on_resp.send);
        assert_ne!(on_ack.send, on_ack.recv);
    }

    #[test]
    fn test_request_step_rejected() {
        assert!(session_keys(b"k", CryptoCaps::KTLS_AES128, HandshakeStep::Request).is_err());
    }

    #[test]
    fn test_suite_selection() {
        let both = CryptoCaps::KTLS_AES128 | CryptoCaps::KTLS_AES256;
        assert_eq!(negotiate_suite(both, both), Some(CryptoCaps::KTLS_AES256));
        assert_eq!(
            negotiate_suite(both, CryptoCaps::KTLS_AES128),
            Some(CryptoCaps::KTLS_AES128)
        );
        assert_eq!(negotiate_suite(CryptoCaps::KTLS_AES256, CryptoCaps::KTLS_AES128), None);
        assert_eq!(negotiate_suite(both, CryptoCaps::empty()), None);
    }

    #[test]
    fn test_debug_hides_key_material() {
        let keys = session_keys(b"m", CryptoCaps::KTLS_AES256, HandshakeStep::Ack).unwrap();
        let printed = format!("{:?}", keys);
        assert!(printed.contains("KTLS_AES256"));
        assert!(!printed.contains("send"));
    }
}
