//! The WireGuard adaptor (§4.G): applies reconciled peer intents to either
//! backend wireguard-control exposes (kernel or userspace), installs/removes
//! routes for each peer's allowed IPs, and reports session liveness back to
//! the reconciler.

use fabric_shared::{wg, AgentError, WgLocalConfig, WgPeerConfig};
use ipnet::IpNet;
use std::{collections::HashMap, time::Duration};
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

pub struct Adaptor {
    interface: InterfaceName,
    backend: Backend,
    tunnel_addr: Option<IpNet>,
    no_routing: bool,
    /// The allowed-ip routes currently installed per peer, so a later delete
    /// knows which routes to tear down (§4.G: "remove stale routes on
    /// delete").
    routes: HashMap<String, Vec<IpNet>>,
}

impl Adaptor {
    pub fn new(interface: InterfaceName, backend: Backend, no_routing: bool) -> Self {
        Self {
            interface,
            backend,
            tunnel_addr: None,
            no_routing,
            routes: HashMap::new(),
        }
    }

    /// Resolves the preferred backend: kernel if interface creation
    /// succeeds, userspace otherwise.
    pub fn resolve_backend(interface: &InterfaceName, userspace_mode: bool) -> Backend {
        if userspace_mode {
            return Backend::Userspace;
        }
        match Device::get(interface, Backend::Kernel) {
            Ok(_) => Backend::Kernel,
            Err(_) => {
                if DeviceUpdate::new()
                    .apply(interface, Backend::Kernel)
                    .is_ok()
                {
                    Backend::Kernel
                } else {
                    Backend::Userspace
                }
            },
        }
    }

    /// Idempotently applies a local config, peer updates, and peer deletes to
    /// the tunnel interface. Recreates the interface only if its address has
    /// changed.
    pub fn apply(
        &mut self,
        local: &WgLocalConfig,
        tunnel_addr: IpNet,
        updates: &[WgPeerConfig],
        deletes: &[String],
    ) -> Result<(), AgentError> {
        if self.tunnel_addr != Some(tunnel_addr) {
            self.recreate_interface(tunnel_addr)?;
        }

        let mut device = DeviceUpdate::new();
        let private_key = Key::from_base64(&local.private_key)
            .map_err(|e| AgentError::Config(format!("invalid private key: {e}")))?;
        device = device.set_private_key(private_key);
        if let Some(port) = local.listen_port {
            device = device.set_listen_port(port);
        }

        let mut builders = Vec::with_capacity(updates.len() + deletes.len());
        for peer in updates {
            let key = Key::from_base64(&peer.public_key)
                .map_err(|e| AgentError::DataPlane(format!("invalid peer public key: {e}")))?;
            let mut builder = PeerConfigBuilder::new(&key)
                .replace_allowed_ips()
                .add_allowed_ips(
                    &peer
                        .allowed_ips
                        .iter()
                        .map(|net| wireguard_control::AllowedIp {
                            address: net.addr(),
                            cidr: net.prefix_len(),
                        })
                        .collect::<Vec<_>>(),
                );
            if let Some(endpoint) = peer.endpoint {
                builder = builder.set_endpoint(endpoint);
            }
            builder = match peer.persistent_keepalive {
                Some(interval) => builder.set_persistent_keepalive_interval(interval),
                None => builder.unset_persistent_keepalive(),
            };
            builders.push(builder);

            if !self.no_routing {
                for allowed in &peer.allowed_ips {
                    wg::add_route(&self.interface, *allowed).map_err(|e| {
                        AgentError::DataPlane(format!("failed to add route for peer: {e}"))
                    })?;
                }
            }
            self.routes.insert(peer.public_key.clone(), peer.allowed_ips.clone());
        }
        for public_key in deletes {
            if let Ok(key) = Key::from_base64(public_key) {
                builders.push(PeerConfigBuilder::new(&key).remove());
            }

            if let Some(stale_routes) = self.routes.remove(public_key) {
                if !self.no_routing {
                    for allowed in stale_routes {
                        if let Err(e) = wg::del_route(&self.interface, allowed) {
                            log::warn!("failed to remove route for deleted peer: {e}");
                        }
                    }
                }
            }
        }

        device
            .add_peers(&builders)
            .apply(&self.interface, self.backend)
            .map_err(|e| AgentError::DataPlane(e.to_string()))?;

        Ok(())
    }

    fn recreate_interface(&mut self, tunnel_addr: IpNet) -> Result<(), AgentError> {
        let _ = wg::down(&self.interface, self.backend);
        DeviceUpdate::new()
            .apply(&self.interface, self.backend)
            .map_err(|e| AgentError::DataPlane(format!("failed to create interface: {e}")))?;
        wg::set_addr(&self.interface, tunnel_addr)
            .map_err(|e| AgentError::DataPlane(format!("failed to set interface address: {e}")))?;
        wg::set_up(
            &self.interface,
            if matches!(tunnel_addr, IpNet::V4(_)) {
                1420
            } else {
                1400
            },
        )
        .map_err(|e| AgentError::DataPlane(format!("failed to bring up interface: {e}")))?;
        self.tunnel_addr = Some(tunnel_addr);
        Ok(())
    }

    /// Tears the tunnel interface down entirely (used on shutdown).
    pub fn teardown(&self) -> Result<(), AgentError> {
        wg::down(&self.interface, self.backend)
            .map_err(|e| AgentError::DataPlane(e.to_string()))
    }

    /// Reads back the current sessions, keyed by `public_key`, mapping to
    /// time since the last handshake (used by the reconciler's liveness
    /// check, §4.F).
    pub fn dump_peers(&self) -> Result<HashMap<String, Duration>, AgentError> {
        let device = match Device::get(&self.interface, self.backend) {
            Ok(device) => device,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(AgentError::DataPlane(e.to_string())),
        };

        Ok(device
            .peers
            .iter()
            .filter_map(|peer| {
                let elapsed = peer.stats.last_handshake_time.and_then(|t| t.elapsed().ok())?;
                Some((peer.config.public_key.to_base64(), elapsed))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_backend_falls_back_to_userspace_when_requested() {
        let interface: InterfaceName = "fabtest0".parse().unwrap();
        let backend = Adaptor::resolve_backend(&interface, true);
        assert_eq!(backend, Backend::Userspace);
    }
}
