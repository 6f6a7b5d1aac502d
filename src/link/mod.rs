//! Persistent connection to the cloud service

pub mod backoff;
pub mod websocket;

use crate::{protocol::OutboundMessage, services::credential_store::DeviceIdentity};
use serde_json::Value;
use std::fmt;
use trait_variant::make;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The connection could not be established
    Connect(String),
    /// Connecting took longer than the configured timeout
    Timeout,
    /// The connection is already closed
    Closed,
    /// The peer did not answer a keepalive ping in time
    KeepaliveTimeout,
    Transport(String),
    Encode(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "failed to connect: {e}"),
            Self::Timeout => write!(f, "connect timed out"),
            Self::Closed => write!(f, "connection closed"),
            Self::KeepaliveTimeout => write!(f, "keepalive timed out"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Encode(e) => write!(f, "failed to encode message: {e}"),
        }
    }
}

impl std::error::Error for LinkError {}

/// One open connection
///
/// Messages are read strictly one at a time; the caller finishes handling a
/// message before asking for the next one.
#[make(Send)]
pub trait LinkConnection {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), LinkError>;
    /// Next decoded message, `None` once the peer closed the connection
    ///
    /// Undecodable messages are skipped. Keepalive failures end the
    /// connection with [`LinkError::KeepaliveTimeout`].
    async fn receive(&mut self) -> Result<Option<Value>, LinkError>;
    async fn close(&mut self);
}

#[make(Send)]
pub trait UpstreamLink {
    type Connection: LinkConnection + Send;

    async fn connect(&self, identity: &DeviceIdentity) -> Result<Self::Connection, LinkError>;
}
