//! A minimal STUN (RFC 5389) binding client: one request, one response, no
//! retransmission state machine. The reconciliation engine re-probes on its
//! own schedule (§4.B/§4.H), so a lost request is simply tried again on the
//! next tick rather than retried internally here.

use bytecodec::{DecodeExt, EncodeExt};
use rand::Rng;
use std::{net::SocketAddr, time::Duration};
use stun_codec::{
    rfc5389::{attributes::XorMappedAddress, methods::BINDING, Attribute},
    Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId,
};
use thiserror::Error;
use tokio::{net::UdpSocket, time::timeout};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StunError {
    #[error("stun request timed out")]
    Timeout,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode stun request: {0}")]
    Encode(#[source] bytecodec::Error),
    #[error("failed to decode stun response: {0}")]
    Decode(#[source] bytecodec::Error),
    #[error("response carried no XOR-MAPPED-ADDRESS attribute")]
    MissingMappedAddress,
}

/// Round-robins over a fixed list of STUN servers.
#[derive(Clone, Debug)]
pub struct ServerRegistry {
    servers: Vec<String>,
    next: usize,
}

impl ServerRegistry {
    pub fn new(servers: Vec<String>) -> Self {
        Self { servers, next: 0 }
    }

    pub fn next_server(&mut self) -> Option<&str> {
        if self.servers.is_empty() {
            return None;
        }
        let server = &self.servers[self.next % self.servers.len()];
        self.next = self.next.wrapping_add(1);
        Some(server)
    }

    pub fn nth(&self, index: usize) -> Option<&str> {
        self.servers.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Sends a single binding request from a socket bound to `local_port` and
/// returns the reflexive address the server observed.
pub async fn request(server: &str, local_port: u16) -> Result<SocketAddr, StunError> {
    let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;
    socket.connect(server).await?;

    let request = new_binding_request();
    let encoded = MessageEncoder::<Attribute>::default()
        .encode_into_bytes(request.clone())
        .map_err(StunError::Encode)?;

    socket.send(&encoded).await?;

    let mut buf = [0u8; 512];
    let len = timeout(REQUEST_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| StunError::Timeout)??;

    let decoded: Message<Attribute> = MessageDecoder::<Attribute>::default()
        .decode_from_bytes(&buf[..len])
        .map_err(StunError::Decode)?
        .map_err(StunError::Decode)?;

    decoded
        .get_attribute::<XorMappedAddress>()
        .map(|attr| attr.address())
        .ok_or(StunError::MissingMappedAddress)
}

fn new_binding_request() -> Message<Attribute> {
    let transaction_id = TransactionId::new(rand::thread_rng().gen());
    Message::new(MessageClass::Request, BINDING, transaction_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_wraps() {
        let mut registry = ServerRegistry::new(vec!["a:3478".into(), "b:3478".into()]);
        assert_eq!(registry.next_server(), Some("a:3478"));
        assert_eq!(registry.next_server(), Some("b:3478"));
        assert_eq!(registry.next_server(), Some("a:3478"));
    }

    #[test]
    fn empty_registry_yields_none() {
        let mut registry = ServerRegistry::new(vec![]);
        assert_eq!(registry.next_server(), None);
    }
}
