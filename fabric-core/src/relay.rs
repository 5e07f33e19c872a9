//! Relay startup check (§4.H): at most one relay per organization. Consulted
//! once against the informer's first snapshot before the agent registers
//! itself as a relay.

use fabric_shared::{AgentError, Device};
use std::collections::HashMap;

pub fn check_no_other_relay(
    snapshot: &HashMap<String, Device>,
    local_public_key: &str,
) -> Result<(), AgentError> {
    let other_relay = snapshot
        .values()
        .any(|device| device.relay && device.public_key != local_public_key);

    if other_relay {
        Err(AgentError::RelayAlreadyPresent)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(public_key: &str, relay: bool) -> Device {
        Device {
            id: public_key.into(),
            public_key: public_key.into(),
            hostname: "h".into(),
            tunnel_ip_v4: None,
            tunnel_ip_v6: None,
            allowed_ips: vec![],
            child_prefix: vec![],
            endpoints: vec![],
            endpoint_local_address_ip4: None,
            relay,
            symmetric_nat: false,
            security_group_id: None,
            organization_id: "org".into(),
            revision: 0,
        }
    }

    #[test]
    fn fails_when_another_relay_exists() {
        let mut snapshot = HashMap::new();
        snapshot.insert("other".into(), device("other", true));
        assert!(check_no_other_relay(&snapshot, "self").is_err());
    }

    #[test]
    fn allows_self_as_relay() {
        let mut snapshot = HashMap::new();
        snapshot.insert("self".into(), device("self", true));
        assert!(check_no_other_relay(&snapshot, "self").is_ok());
    }

    #[test]
    fn allows_empty_snapshot() {
        assert!(check_no_other_relay(&HashMap::new(), "self").is_ok());
    }
}
