//! NAT classification (§4.B): two STUN probes against distinct servers. If
//! the reflexive endpoints disagree, the local NAT rewrites the mapping per
//! destination and reflexive candidates are useless — the node must rely on
//! a relay.

use crate::stun::{self, ServerRegistry, StunError};
use std::net::SocketAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatKind {
    Symmetric,
    NonSymmetric,
}

#[derive(Debug)]
pub struct Classification {
    pub kind: NatKind,
    /// The reflexive address observed on the first probe; republished to the
    /// controller and used as this node's `stun:<server>` endpoint.
    pub reflexive: SocketAddr,
}

/// Issues two sequential binding requests against two distinct servers from
/// the registry and classifies the local NAT based on whether the reported
/// reflexive endpoints agree.
pub async fn classify(
    registry: &ServerRegistry,
    local_port: u16,
) -> Result<Classification, StunError> {
    if registry.len() < 2 {
        return Err(StunError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "at least two STUN servers are required for NAT classification",
        )));
    }
    let first_server = registry.nth(0).expect("checked len >= 2");
    let second_server = registry.nth(1).expect("checked len >= 2");

    let first = stun::request(first_server, local_port).await?;
    let second = stun::request(second_server, local_port).await?;

    let kind = if first == second {
        NatKind::NonSymmetric
    } else {
        NatKind::Symmetric
    };

    Ok(Classification {
        kind,
        reflexive: first,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requires_two_servers() {
        let registry = ServerRegistry::new(vec!["only-one:3478".into()]);
        let result = classify(&registry, 0).await;
        assert!(result.is_err());
    }
}
