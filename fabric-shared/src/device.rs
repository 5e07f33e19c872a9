use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    io,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::Instant,
};
use url::Host;

/// A `host:port` pair that, unlike `SocketAddr`, also accepts domain names —
/// controllers and relays are sometimes reached by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: Host,
    port: u16,
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4addr) => Self {
                host: Host::Ipv4(*v4addr.ip()),
                port: v4addr.port(),
            },
            SocketAddr::V6(v6addr) => Self {
                host: Host::Ipv6(*v6addr.ip()),
                port: v6addr.port(),
            },
        }
    }
}

impl FromStr for Endpoint {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplitn(2, ':').collect::<Vec<&str>>().as_slice() {
            [port, host] => {
                let port = port.parse().map_err(|_| "couldn't parse port")?;
                let host = Host::parse(host).map_err(|_| "couldn't parse host")?;
                Ok(Endpoint { host, port })
            },
            _ => Err("couldn't parse in form of 'host:port'"),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.host.fmt(f)?;
        f.write_str(":")?;
        self.port.fmt(f)
    }
}

impl Endpoint {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn resolve(&self) -> Result<SocketAddr, io::Error> {
        let mut addrs = self.to_string().to_socket_addrs()?;
        addrs.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "failed to resolve address".to_string(),
            )
        })
    }
}

/// Where a candidate endpoint was observed from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "server")]
pub enum EndpointSource {
    /// The device's own view of its locally-bound address.
    Local,
    /// A reflexive address observed through a named STUN server.
    Stun(String),
}

impl Display for EndpointSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EndpointSource::Local => f.write_str("local"),
            EndpointSource::Stun(server) => write!(f, "stun:{server}"),
        }
    }
}

/// A candidate endpoint a device has reported, ranked by distance (lower is
/// preferred; reserved for future multi-candidate ranking).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub source: EndpointSource,
    pub address: Endpoint,
    #[serde(default)]
    pub distance: u32,
}

/// The controller's description of a node in the mesh.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub public_key: String,
    pub hostname: String,

    pub tunnel_ip_v4: Option<std::net::Ipv4Addr>,
    pub tunnel_ip_v6: Option<std::net::Ipv6Addr>,

    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    #[serde(default)]
    pub child_prefix: Vec<IpNet>,

    #[serde(default)]
    pub endpoints: Vec<DeviceEndpoint>,
    pub endpoint_local_address_ip4: Option<std::net::Ipv4Addr>,

    #[serde(default)]
    pub relay: bool,
    #[serde(default)]
    pub symmetric_nat: bool,

    pub security_group_id: Option<String>,
    pub organization_id: String,
    #[serde(default)]
    pub revision: u64,
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.public_key)
    }
}

impl Device {
    /// Compares two devices ignoring fields that must never trigger a tunnel
    /// rebuild on their own (§4.F step 2: `security_group_id` and `revision`).
    pub fn eq_ignoring_security_group(&self, other: &Device) -> bool {
        self.id == other.id
            && self.public_key == other.public_key
            && self.hostname == other.hostname
            && self.tunnel_ip_v4 == other.tunnel_ip_v4
            && self.tunnel_ip_v6 == other.tunnel_ip_v6
            && self.allowed_ips == other.allowed_ips
            && self.child_prefix == other.child_prefix
            && self.endpoints == other.endpoints
            && self.endpoint_local_address_ip4 == other.endpoint_local_address_ip4
            && self.relay == other.relay
            && self.symmetric_nat == other.symmetric_nat
            && self.organization_id == other.organization_id
    }

    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| matches!(e.source, EndpointSource::Local))
            .map(|e| &e.address)
    }

    pub fn reflexive_endpoint(&self) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| matches!(e.source, EndpointSource::Stun(_)))
            .map(|e| &e.address)
    }

    /// The set of routable prefixes this device should carry as `AllowedIPs`
    /// when it isn't acting as the organization relay.
    pub fn routed_prefixes(&self) -> Vec<IpNet> {
        let mut prefixes = self.allowed_ips.clone();
        prefixes.extend(self.child_prefix.iter().copied());
        prefixes
    }
}

/// The materialized data-plane intent for one remote peer.
#[derive(Clone, Debug, PartialEq)]
pub struct WgPeerConfig {
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
}

/// The materialized data-plane intent for the local interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WgLocalConfig {
    pub private_key: String,
    pub listen_port: Option<u16>,
}

/// Per-device bookkeeping the reconciler keeps between ticks, keyed by
/// `public_key`.
#[derive(Clone, Debug)]
pub struct DeviceCacheEntry {
    pub device: Device,
    pub last_updated: Instant,
    /// Set once the local-peering strategy has been tried and aged out
    /// (§4.F), after which it is never retried for this device.
    pub reflexive_peering_fallback: bool,
}

impl DeviceCacheEntry {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            last_updated: Instant::now(),
            reflexive_peering_fallback: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_roundtrip() {
        let ep: Endpoint = "198.51.100.5:51820".parse().unwrap();
        assert_eq!(ep.to_string(), "198.51.100.5:51820");
        assert_eq!(ep.port(), 51820);
    }

    #[test]
    fn endpoint_rejects_missing_port() {
        assert!("198.51.100.5".parse::<Endpoint>().is_err());
    }

    #[test]
    fn eq_ignoring_security_group_ignores_revision_and_group() {
        let mut a = sample_device();
        let mut b = a.clone();
        b.revision = a.revision + 1;
        b.security_group_id = Some("sg-2".to_string());
        assert!(a.eq_ignoring_security_group(&b));

        b.hostname = "changed".to_string();
        assert!(!a.eq_ignoring_security_group(&b));
        a.hostname = "changed".to_string();
        assert!(a.eq_ignoring_security_group(&b));
    }

    fn sample_device() -> Device {
        Device {
            id: "dev-1".into(),
            public_key: "4CNZorWVtohO64n6AAaH/JyFjIIgBFrfJK2SGtKjzEE=".into(),
            hostname: "node-a".into(),
            tunnel_ip_v4: Some("100.100.0.2".parse().unwrap()),
            tunnel_ip_v6: None,
            allowed_ips: vec!["100.100.0.2/32".parse().unwrap()],
            child_prefix: vec![],
            endpoints: vec![],
            endpoint_local_address_ip4: None,
            relay: false,
            symmetric_nat: false,
            security_group_id: Some("sg-1".into()),
            organization_id: "org-1".into(),
            revision: 1,
        }
    }
}
