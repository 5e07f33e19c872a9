//! The reconciliation engine (§4.F): turns an informer snapshot into a
//! minimal set of `WgPeerConfig` adds/updates and deletes, applying the
//! peer-endpoint selection policy and keeping the per-device cache that
//! drives its hysteresis.

use crate::nat::NatKind;
use fabric_shared::{Device, DeviceCacheEntry, WgPeerConfig, LOCAL_PEERING_TIMEOUT, PERSISTENT_KEEPALIVE_INTERVAL_SECS};
use ipnet::IpNet;
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

/// What the reconciler decided to do with the data plane this tick.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub peer_updates: Vec<WgPeerConfig>,
    pub peer_deletes: Vec<String>,
}

/// Liveness facts the WireGuard adaptor's `dump_peers` observed, keyed by
/// `public_key`. Used to decide whether an existing session counts as
/// "working" for the hysteresis rule.
pub type LivenessMap = HashMap<String, Duration>;

pub struct Reconciler {
    local_public_key: String,
    is_relay: bool,
    local_nat: NatKind,
    local_reflexive: Option<IpAddr>,
    /// The organization's supernet CIDRs, used as a relay peer's
    /// `allowed_ips` (§3: "a relay peer's `allowed_ips` equals the
    /// organization supernet CIDRs"). Set once via `set_org_cidrs`, not
    /// derived from the relay device's own advertised `allowed_ips`.
    org_allowed_ips: Vec<IpNet>,
    cache: HashMap<String, DeviceCacheEntry>,
    applied: HashMap<String, WgPeerConfig>,
}

impl Reconciler {
    pub fn new(local_public_key: String, is_relay: bool, local_nat: NatKind) -> Self {
        Self {
            local_public_key,
            is_relay,
            local_nat,
            local_reflexive: None,
            org_allowed_ips: vec![],
            cache: HashMap::new(),
            applied: HashMap::new(),
        }
    }

    pub fn set_local_reflexive(&mut self, addr: IpAddr) {
        self.local_reflexive = Some(addr);
    }

    pub fn set_local_nat(&mut self, kind: NatKind) {
        self.local_nat = kind;
    }

    /// Sets the organization's supernet CIDRs (§4.F: `org.cidr_v4`,
    /// `org.cidr_v6`), fetched once at startup from `list_organizations`.
    pub fn set_org_cidrs(&mut self, cidrs: Vec<IpNet>) {
        self.org_allowed_ips = cidrs;
    }

    /// Discards the applied-peer cache, forcing every peer to be recomputed
    /// and reapplied on the next tick (§7: `DataPlaneError` recovery).
    pub fn force_rebuild(&mut self) {
        self.applied.clear();
    }

    /// One reconciliation tick (§4.F steps 2-5).
    pub fn tick(&mut self, snapshot: &HashMap<String, Device>, liveness: &LivenessMap) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        for device in snapshot.values() {
            if device.public_key == self.local_public_key {
                continue;
            }

            let changed = match self.cache.get(&device.public_key) {
                Some(entry) => !entry.device.eq_ignoring_security_group(device),
                None => true,
            };
            if changed {
                self.cache
                    .insert(device.public_key.clone(), DeviceCacheEntry::new(device.clone()));
            }
        }

        // Age the fallback flag: once a local-peering attempt has had
        // LOCAL_PEERING_TIMEOUT to succeed and hasn't, never retry it.
        for entry in self.cache.values_mut() {
            if !entry.reflexive_peering_fallback
                && entry.last_updated.elapsed() > LOCAL_PEERING_TIMEOUT
            {
                entry.reflexive_peering_fallback = true;
            }
        }

        let stale: Vec<String> = self
            .cache
            .keys()
            .filter(|key| !snapshot.contains_key(*key))
            .cloned()
            .collect();
        for key in &stale {
            self.cache.remove(key);
            if self.applied.remove(key).is_some() {
                outcome.peer_deletes.push(key.clone());
            }
        }

        let keys: Vec<String> = self.cache.keys().cloned().collect();
        for key in keys {
            let entry = self.cache.get(&key).expect("just collected from cache");
            let last_handshake = liveness.get(&key).copied();
            let existing = self.applied.get(&key);
            let selected = self.select_peer(entry, last_handshake, existing);

            match selected {
                Some(config) if existing != Some(&config) => {
                    self.applied.insert(key.clone(), config.clone());
                    outcome.peer_updates.push(config);
                },
                None if existing.is_some() => {
                    self.applied.remove(&key);
                    outcome.peer_deletes.push(key);
                },
                _ => {},
            }
        }

        outcome
    }

    fn select_peer(
        &self,
        entry: &DeviceCacheEntry,
        last_handshake: Option<Duration>,
        existing: Option<&WgPeerConfig>,
    ) -> Option<WgPeerConfig> {
        let device = &entry.device;
        let reflexive = device.reflexive_endpoint().and_then(|e| e.resolve().ok());
        let local = device.local_endpoint().and_then(|e| e.resolve().ok());

        let colocated = matches!((self.local_reflexive, reflexive), (Some(r), Some(addr)) if r == addr.ip());

        if self.is_relay {
            let endpoint = if colocated { local } else { reflexive };
            return Some(WgPeerConfig {
                public_key: device.public_key.clone(),
                endpoint,
                allowed_ips: device.routed_prefixes(),
                persistent_keepalive: Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS),
            });
        }

        if device.relay {
            let endpoint = if colocated { local } else { reflexive };
            return Some(WgPeerConfig {
                public_key: device.public_key.clone(),
                endpoint,
                allowed_ips: self.org_allowed_ips.clone(),
                persistent_keepalive: Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS),
            });
        }

        let is_working = last_handshake.map(|d| d <= LOCAL_PEERING_TIMEOUT).unwrap_or(false);
        if is_working {
            if let Some(existing) = existing {
                let unchanged = existing.allowed_ips == device.routed_prefixes()
                    && (existing.endpoint == local || existing.endpoint == reflexive);
                if unchanged {
                    return Some(existing.clone());
                }
            }
        }

        let is_local_candidate = colocated && !entry.reflexive_peering_fallback;
        if is_local_candidate {
            if let (Some(ip4), Some(local_ep)) = (device.endpoint_local_address_ip4, local) {
                return Some(WgPeerConfig {
                    public_key: device.public_key.clone(),
                    endpoint: Some(SocketAddr::new(IpAddr::V4(ip4), local_ep.port())),
                    allowed_ips: device.routed_prefixes(),
                    persistent_keepalive: Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS),
                });
            }
        }

        if self.local_nat == NatKind::Symmetric {
            return None;
        }

        if !device.symmetric_nat {
            return Some(WgPeerConfig {
                public_key: device.public_key.clone(),
                endpoint: reflexive,
                allowed_ips: device.routed_prefixes(),
                persistent_keepalive: Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS),
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_shared::{DeviceEndpoint, EndpointSource};

    fn device(public_key: &str, relay: bool, symmetric_nat: bool) -> Device {
        Device {
            id: format!("id-{public_key}"),
            public_key: public_key.to_string(),
            hostname: "peer".into(),
            tunnel_ip_v4: Some("100.100.0.5".parse().unwrap()),
            tunnel_ip_v6: None,
            allowed_ips: vec!["100.100.0.5/32".parse().unwrap()],
            child_prefix: vec![],
            endpoints: vec![DeviceEndpoint {
                source: EndpointSource::Stun("stun1".into()),
                address: "203.0.113.9:51820".parse().unwrap(),
                distance: 0,
            }],
            endpoint_local_address_ip4: Some("192.168.1.9".parse().unwrap()),
            relay,
            symmetric_nat,
            security_group_id: None,
            organization_id: "org".into(),
            revision: 1,
        }
    }

    #[test]
    fn non_symmetric_peer_gets_reflexive_endpoint() {
        let mut r = Reconciler::new("self".into(), false, NatKind::NonSymmetric);
        let mut snapshot = HashMap::new();
        snapshot.insert("peerA".into(), device("peerA", false, false));

        let outcome = r.tick(&snapshot, &LivenessMap::new());
        assert_eq!(outcome.peer_updates.len(), 1);
        assert_eq!(
            outcome.peer_updates[0].endpoint,
            Some("203.0.113.9:51820".parse().unwrap())
        );
    }

    #[test]
    fn symmetric_nat_peer_is_skipped_by_non_relay() {
        let mut r = Reconciler::new("self".into(), false, NatKind::NonSymmetric);
        let mut snapshot = HashMap::new();
        snapshot.insert("peerA".into(), device("peerA", false, true));

        let outcome = r.tick(&snapshot, &LivenessMap::new());
        assert!(outcome.peer_updates.is_empty());
    }

    #[test]
    fn local_symmetric_nat_skips_all_direct_peers() {
        let mut r = Reconciler::new("self".into(), false, NatKind::Symmetric);
        let mut snapshot = HashMap::new();
        snapshot.insert("peerA".into(), device("peerA", false, false));

        let outcome = r.tick(&snapshot, &LivenessMap::new());
        assert!(outcome.peer_updates.is_empty());
    }

    #[test]
    fn relay_peer_gets_org_supernet_allowed_ips() {
        let mut r = Reconciler::new("self".into(), false, NatKind::NonSymmetric);
        r.set_org_cidrs(vec!["100.100.0.0/16".parse().unwrap()]);
        let mut snapshot = HashMap::new();
        snapshot.insert("relay1".into(), device("relay1", true, false));

        let outcome = r.tick(&snapshot, &LivenessMap::new());
        assert_eq!(outcome.peer_updates.len(), 1);
        assert_eq!(
            outcome.peer_updates[0].allowed_ips,
            vec!["100.100.0.0/16".parse::<IpNet>().unwrap()]
        );
    }

    #[test]
    fn vanished_device_produces_a_delete() {
        let mut r = Reconciler::new("self".into(), false, NatKind::NonSymmetric);
        let mut snapshot = HashMap::new();
        snapshot.insert("peerA".into(), device("peerA", false, false));
        let first = r.tick(&snapshot, &LivenessMap::new());
        assert_eq!(first.peer_updates.len(), 1);

        snapshot.clear();
        let second = r.tick(&snapshot, &LivenessMap::new());
        assert_eq!(second.peer_deletes, vec!["peerA".to_string()]);
    }

    #[test]
    fn own_device_is_never_materialized_as_a_peer() {
        let mut r = Reconciler::new("self".into(), false, NatKind::NonSymmetric);
        let mut snapshot = HashMap::new();
        snapshot.insert("self".into(), device("self", false, false));
        let outcome = r.tick(&snapshot, &LivenessMap::new());
        assert!(outcome.peer_updates.is_empty());
    }
}
