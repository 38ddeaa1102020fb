pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

pub use udp::{ForwardTarget, UdpRelay};

/// UDP relay errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid UDP plugin address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("could not resolve '{0}'")]
    Resolve(String),

    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no open UDP connection")]
    NotOpen,

    #[error("failed to send UDP message: {0}")]
    Send(#[source] std::io::Error),
}

/// One datagram of the server's plugin protocol. The payload is relayed
/// without being decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    payload: Vec<u8>,
}

impl UdpMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.payload
    }
}

impl From<Vec<u8>> for UdpMessage {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

/// Handler for inbound plugin messages. Runs on the relay's receive task,
/// so a slow handler delays the messages behind it.
pub type UdpCallback = Arc<dyn Fn(UdpMessage) + Send + Sync>;

/// Split `host:port`. Bracketed IPv6 hosts are accepted; an empty host means localhost.
pub fn parse_plugin_address(address: &str) -> Result<(String, u16), RelayError> {
    let invalid = |reason: &str| RelayError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port in address"))?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| invalid("missing ']' in address"))?,
        None if host.contains(':') => return Err(invalid("too many colons in address")),
        None => host,
    };

    let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;

    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok((host.to_string(), port))
}

/// Ask the OS for a currently unused UDP port on localhost.
pub fn free_udp_port() -> std::io::Result<u16> {
    let socket = std::net::UdpSocket::bind("localhost:0")?;
    Ok(socket.local_addr()?.port())
}
