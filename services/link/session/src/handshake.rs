//! Three-step handshake and extension negotiation.
//!
//! ```text
//! initiator                          accepter
//!   WaitResponse --- REQUEST --->      WaitRequest
//!                <-- RESPONSE+ext ---  WaitAck
//!   Working      --- ACK+ext ----->    Working
//! ```
//!
//! Legacy peers skip ACK and never carry extensions. Extensions are handled
//! through a registry of fill/parse pairs keyed by extension code; parse
//! results land in a [`HandshakeSession`] and are applied to the peer and
//! connection only once the step succeeds.

use bytes::BytesMut;
use link_wire::{
    CryptoCaps, Extension, ExtensionBlock, ExtensionCode, HandshakePayload, HandshakeStep,
    WireHeader, WireMessage, MAX_VERSION, VERSION_EXTENDED,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::{ConnStatus, Connection, TransportParams};
use crate::crypto;
use crate::peer::{Peer, PeerStatus};
use crate::{LinkConfig, LinkError};

/// Values parsed from the peer's extensions during one handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeSession {
    /// Crypto suites the peer offered
    pub crypto: Option<CryptoCaps>,
    /// Peer namespace case sensitivity
    pub case_sensitive: Option<bool>,
    /// Peer feature bitmap
    pub features: Option<u64>,
    /// Peer alternate transport
    pub transport: Option<TransportParams>,
    /// Peer device class
    pub device_class: Option<u8>,
}

/// Produces the local value of an extension
pub type FillFn = fn(&LinkConfig) -> Extension;
/// Checks a received extension and records it in the session
pub type ParseFn = fn(&LinkConfig, &Extension, &mut HandshakeSession) -> Result<(), LinkError>;

/// Fill/parse pair for one extension code
#[derive(Clone, Copy)]
pub struct ExtensionHandler {
    /// Code handled
    pub code: ExtensionCode,
    /// Local value
    pub fill: FillFn,
    /// Remote value check
    pub parse: ParseFn,
}

impl std::fmt::Debug for ExtensionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHandler")
            .field("code", &self.code)
            .finish_non_exhaustive()
    }
}

fn fill_crypto(config: &LinkConfig) -> Extension {
    Extension::Crypto(config.crypto_caps)
}

fn parse_crypto(
    _config: &LinkConfig,
    ext: &Extension,
    session: &mut HandshakeSession,
) -> Result<(), LinkError> {
    if let Extension::Crypto(caps) = ext {
        session.crypto = Some(*caps);
    }
    Ok(())
}

fn fill_case_sense(config: &LinkConfig) -> Extension {
    Extension::CaseSense(config.case_sensitive)
}

fn parse_case_sense(
    config: &LinkConfig,
    ext: &Extension,
    session: &mut HandshakeSession,
) -> Result<(), LinkError> {
    if let Extension::CaseSense(remote) = ext {
        if *remote != config.case_sensitive {
            return Err(LinkError::Negotiation(format!(
                "case sensitivity mismatch: local {}, remote {}",
                config.case_sensitive, remote
            )));
        }
        session.case_sensitive = Some(*remote);
    }
    Ok(())
}

fn fill_features(config: &LinkConfig) -> Extension {
    Extension::FeatureSupport(config.features)
}

fn parse_features(
    _config: &LinkConfig,
    ext: &Extension,
    session: &mut HandshakeSession,
) -> Result<(), LinkError> {
    if let Extension::FeatureSupport(features) = ext {
        session.features = Some(*features);
    }
    Ok(())
}

fn fill_transport(config: &LinkConfig) -> Extension {
    Extension::TransportParams {
        udp_port: config.transport_udp_port,
        version: config.transport_version,
    }
}

fn parse_transport(
    _config: &LinkConfig,
    ext: &Extension,
    session: &mut HandshakeSession,
) -> Result<(), LinkError> {
    if let Extension::TransportParams { udp_port, version } = ext {
        session.transport = Some(TransportParams {
            udp_port: *udp_port,
            version: *version,
        });
    }
    Ok(())
}

fn fill_device_class(config: &LinkConfig) -> Extension {
    Extension::DeviceClass(config.device_class)
}

fn parse_device_class(
    _config: &LinkConfig,
    ext: &Extension,
    session: &mut HandshakeSession,
) -> Result<(), LinkError> {
    if let Extension::DeviceClass(class) = ext {
        session.device_class = Some(*class);
    }
    Ok(())
}

/// Handlers for every extension this build understands
pub const DEFAULT_EXTENSIONS: [ExtensionHandler; 5] = [
    ExtensionHandler {
        code: ExtensionCode::Crypto,
        fill: fill_crypto,
        parse: parse_crypto,
    },
    ExtensionHandler {
        code: ExtensionCode::CaseSense,
        fill: fill_case_sense,
        parse: parse_case_sense,
    },
    ExtensionHandler {
        code: ExtensionCode::FeatureSupport,
        fill: fill_features,
        parse: parse_features,
    },
    ExtensionHandler {
        code: ExtensionCode::TransportParams,
        fill: fill_transport,
        parse: parse_transport,
    },
    ExtensionHandler {
        code: ExtensionCode::DeviceClass,
        fill: fill_device_class,
        parse: parse_device_class,
    },
];

/// The peer and connection a handshake message belongs to
#[derive(Debug, Clone, Copy)]
pub struct HandshakeContext<'a> {
    /// Local configuration
    pub config: &'a LinkConfig,
    /// Remote node
    pub peer: &'a Peer,
    /// Connection the message arrived on
    pub conn: &'a Arc<Connection>,
}

/// What a received handshake message led to
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Answered; negotiation continues
    Replied,
    /// Connection is working; `replaced` lists stopped connections of the same role
    Completed {
        /// Connections displaced by this one
        replaced: Vec<Arc<Connection>>,
    },
    /// Not applicable in the connection's current state
    Ignored,
    /// Negotiation aborted; the connection is marked failed
    Failed(LinkError),
}

/// Drives the handshake of one node
#[derive(Debug, Clone)]
pub struct HandshakeNegotiator {
    handlers: Vec<ExtensionHandler>,
}

impl Default for HandshakeNegotiator {
    fn default() -> Self {
        Self::with_handlers(DEFAULT_EXTENSIONS.to_vec())
    }
}

impl HandshakeNegotiator {
    /// Negotiator using exactly `handlers`
    pub fn with_handlers(handlers: Vec<ExtensionHandler>) -> Self {
        Self { handlers }
    }

    /// Extension block describing the local node
    pub fn build_extensions(&self, config: &LinkConfig) -> ExtensionBlock {
        let mut block = ExtensionBlock::new();
        for handler in &self.handlers {
            block.push((handler.fill)(config));
        }
        block
    }

    /// Parse the peer's block; unknown codes are skipped
    pub fn parse_extensions(
        &self,
        config: &LinkConfig,
        block: Option<&ExtensionBlock>,
    ) -> Result<HandshakeSession, LinkError> {
        let block =
            block.ok_or_else(|| LinkError::Negotiation("missing extension block".to_string()))?;
        let mut session = HandshakeSession::default();
        for ext in block.typed()? {
            match self.handlers.iter().find(|h| h.code == ext.code()) {
                Some(handler) => (handler.parse)(config, &ext, &mut session)?,
                None => debug!("No handler for extension {:?}, skipping", ext.code()),
            }
        }
        Ok(session)
    }

    /// Send one handshake step on the context's connection
    pub async fn send(
        &self,
        ctx: &HandshakeContext<'_>,
        step: HandshakeStep,
        correlation: u16,
    ) -> Result<(), LinkError> {
        let mut payload = HandshakePayload::new(ctx.config.device_id.clone());
        let extended =
            ctx.config.protocol_version >= VERSION_EXTENDED && ctx.peer.version() >= VERSION_EXTENDED;
        if step != HandshakeStep::Request && extended {
            payload = payload.with_extensions(self.build_extensions(ctx.config));
        }

        let mut body = BytesMut::with_capacity(payload.encoded_len());
        payload.encode(&mut body)?;
        let header = WireHeader::handshake(
            step,
            ctx.config.protocol_version,
            ctx.config.iid,
            correlation,
        );
        ctx.conn
            .send(&WireMessage::new(header, body.freeze()))
            .await?;
        debug!(
            "Sent handshake {} to peer {} on connection {}",
            step,
            ctx.peer.cid(),
            ctx.conn.id()
        );
        Ok(())
    }

    /// Process a received handshake message
    pub async fn receive(&self, ctx: &HandshakeContext<'_>, msg: &WireMessage) -> HandshakeOutcome {
        match self.process(ctx, msg).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "Handshake with peer {} failed on connection {}: {}",
                    ctx.peer.cid(),
                    ctx.conn.id(),
                    e
                );
                ctx.conn.set_status(ConnStatus::NegotiationFailed);
                HandshakeOutcome::Failed(e)
            }
        }
    }

    async fn process(
        &self,
        ctx: &HandshakeContext<'_>,
        msg: &WireMessage,
    ) -> Result<HandshakeOutcome, LinkError> {
        let header = &msg.header;
        let step = HandshakeStep::try_from(header.operation)?;
        if header.version < ctx.config.min_peer_version() || header.version > MAX_VERSION {
            return Err(LinkError::Negotiation(format!(
                "peer version {} unsupported",
                header.version
            )));
        }

        let payload = HandshakePayload::decode(msg.payload.clone())?;
        if payload.device_id != ctx.peer.cid() {
            return Err(LinkError::Negotiation(format!(
                "device id {} does not match peer {}",
                payload.device_id,
                ctx.peer.cid()
            )));
        }

        let version = header.version.min(ctx.config.protocol_version);
        ctx.peer.set_iid(header.source_id);
        ctx.peer.set_version(version);
        info!(
            "Received handshake {} from peer {} (version {}, connection {})",
            step,
            ctx.peer.cid(),
            header.version,
            ctx.conn.id()
        );

        let correlation = header.request_id;
        let status = ctx.conn.status();
        match step {
            HandshakeStep::Request => {
                if status != ConnStatus::WaitRequest {
                    debug!("Ignoring REQUEST on connection {} in {:?}", ctx.conn.id(), status);
                    return Ok(HandshakeOutcome::Ignored);
                }
                self.send(ctx, HandshakeStep::Response, correlation).await?;
                if version >= VERSION_EXTENDED {
                    ctx.conn.set_status(ConnStatus::WaitAck);
                    ctx.peer.transition(PeerStatus::Offline, PeerStatus::Shaking);
                    Ok(HandshakeOutcome::Replied)
                } else {
                    let replaced = ctx.peer.promote(ctx.conn);
                    Ok(HandshakeOutcome::Completed { replaced })
                }
            }
            HandshakeStep::Response => {
                if status == ConnStatus::WaitRequest {
                    // a legacy peer answering our own REQUEST on a crossed stream
                    let promoted = ctx.peer.promote_negotiating();
                    debug!("Legacy RESPONSE promoted {} connections", promoted);
                    return Ok(HandshakeOutcome::Completed {
                        replaced: Vec::new(),
                    });
                }
                if status != ConnStatus::WaitResponse {
                    debug!("Ignoring RESPONSE on connection {} in {:?}", ctx.conn.id(), status);
                    return Ok(HandshakeOutcome::Ignored);
                }
                if version >= VERSION_EXTENDED {
                    let session = self.parse_extensions(ctx.config, payload.extensions.as_ref())?;
                    self.send(ctx, HandshakeStep::Ack, correlation).await?;
                    self.finalize(ctx, &session, HandshakeStep::Response)?;
                }
                let replaced = ctx.peer.promote(ctx.conn);
                Ok(HandshakeOutcome::Completed { replaced })
            }
            HandshakeStep::Ack => {
                if version < VERSION_EXTENDED || status != ConnStatus::WaitAck {
                    debug!("Ignoring ACK on connection {} in {:?}", ctx.conn.id(), status);
                    return Ok(HandshakeOutcome::Ignored);
                }
                let session = self.parse_extensions(ctx.config, payload.extensions.as_ref())?;
                self.finalize(ctx, &session, HandshakeStep::Ack)?;
                let replaced = ctx.peer.promote(ctx.conn);
                Ok(HandshakeOutcome::Completed { replaced })
            }
        }
    }

    fn finalize(
        &self,
        ctx: &HandshakeContext<'_>,
        session: &HandshakeSession,
        step: HandshakeStep,
    ) -> Result<(), LinkError> {
        if let Some(remote) = session.crypto {
            ctx.conn.set_remote_crypto(remote);
            let suite = crypto::negotiate_suite(ctx.config.crypto_caps, remote);
            match (suite, ctx.config.master_key.as_deref()) {
                (Some(suite), Some(master)) => {
                    let keys = crypto::session_keys(master, suite, step)?;
                    ctx.conn.install_keys(keys)?;
                    debug!("Installed {:?} keys on connection {}", suite, ctx.conn.id());
                }
                (None, _) => debug!("No common crypto suite with peer {}", ctx.peer.cid()),
                (Some(_), None) => debug!("No master key, connection {} stays plain", ctx.conn.id()),
            }
        }
        if let Some(features) = session.features {
            ctx.peer.set_features(features);
        }
        if let Some(params) = session.transport {
            ctx.conn.set_transport_params(params);
        }
        if let Some(class) = session.device_class {
            ctx.conn.set_remote_device_class(class);
        }
        Ok(())
    }
}
