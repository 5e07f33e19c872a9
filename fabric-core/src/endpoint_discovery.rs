//! Local endpoint discovery (§4.C): the source address this node advertises
//! to peers before any tunnel exists, picked from the first strategy that
//! succeeds.

use crate::nat::NatKind;
use fabric_shared::AgentError;
use std::net::IpAddr;

pub struct DiscoveryInputs<'a> {
    /// Explicit operator override, highest priority.
    pub user_supplied: Option<IpAddr>,
    pub stun_enabled: bool,
    pub nat_kind: Option<NatKind>,
    pub stun_reflexive: Option<IpAddr>,
    /// Used for the platform "source address towards" probe.
    pub controller_host: &'a str,
}

/// Resolves the local endpoint address per the §4.C selection order:
/// user override, then STUN reflexive (if not behind a symmetric NAT), then
/// a platform probe.
pub fn discover(inputs: DiscoveryInputs<'_>) -> Result<IpAddr, AgentError> {
    if let Some(addr) = inputs.user_supplied {
        return Ok(addr);
    }

    if inputs.stun_enabled && inputs.nat_kind != Some(NatKind::Symmetric) {
        if let Some(addr) = inputs.stun_reflexive {
            return Ok(addr);
        }
    }

    if let Ok(addr) = inputs
        .controller_host
        .parse::<IpAddr>()
        .or_else(|_| resolve_host(inputs.controller_host))
        .and_then(|dest| fabric_shared::wg::source_address_towards(dest).map_err(|e| e.into()))
    {
        return Ok(addr);
    }

    if let Ok(mut addrs) = fabric_shared::get_local_addrs() {
        if let Some(addr) = addrs.next() {
            return Ok(addr);
        }
    }

    Err(AgentError::NoLocalEndpoint)
}

fn resolve_host(host: &str) -> Result<IpAddr, std::io::Error> {
    use std::net::ToSocketAddrs;
    (host, 0u16)
        .to_socket_addrs()?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address for host"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_override_wins() {
        let addr = discover(DiscoveryInputs {
            user_supplied: Some("10.0.0.5".parse().unwrap()),
            stun_enabled: true,
            nat_kind: Some(NatKind::NonSymmetric),
            stun_reflexive: Some("198.51.100.1".parse().unwrap()),
            controller_host: "example.com",
        })
        .unwrap();
        assert_eq!(addr, "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn symmetric_nat_skips_reflexive() {
        // With no user override, symmetric NAT, and an unreachable controller
        // host, discovery must fall through to the local-address probe
        // (or fail with NoLocalEndpoint) rather than trusting the reflexive
        // address, since it would be unusable for direct peering anyway.
        let result = discover(DiscoveryInputs {
            user_supplied: None,
            stun_enabled: true,
            nat_kind: Some(NatKind::Symmetric),
            stun_reflexive: Some("198.51.100.1".parse().unwrap()),
            controller_host: "",
        });
        if let Ok(addr) = result {
            assert_ne!(addr, "198.51.100.1".parse::<IpAddr>().unwrap());
        }
    }
}
