use ipnet::IpNet;
use std::{io, net::IpAddr, time::Duration};
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, PeerInfo};

#[cfg(target_os = "macos")]
fn cmd(bin: &str, args: &[&str]) -> Result<std::process::Output, io::Error> {
    let output = std::process::Command::new(bin).args(args).output()?;
    log::debug!("cmd: {} {}", bin, args.join(" "));
    log::debug!("status: {:?}", output.status.code());
    log::trace!("stdout: {}", String::from_utf8_lossy(&output.stdout));
    log::trace!("stderr: {}", String::from_utf8_lossy(&output.stderr));
    if output.status.success() {
        Ok(output)
    } else {
        Err(io::Error::other(format!(
            "failed to run {} {} command: {}",
            bin,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

#[cfg(target_os = "macos")]
pub fn set_addr(interface: &InterfaceName, addr: IpNet) -> Result<(), io::Error> {
    let real_interface = wireguard_control::backends::userspace::resolve_tun(interface)?;

    if matches!(addr, IpNet::V4(_)) {
        cmd(
            "ifconfig",
            &[
                &real_interface,
                "inet",
                &addr.to_string(),
                &addr.addr().to_string(),
                "alias",
            ],
        )
        .map(|_output| ())
    } else {
        cmd(
            "ifconfig",
            &[&real_interface, "inet6", &addr.to_string(), "alias"],
        )
        .map(|_output| ())
    }
}

#[cfg(target_os = "macos")]
pub fn set_up(interface: &InterfaceName, mtu: u32) -> Result<(), io::Error> {
    let real_interface = wireguard_control::backends::userspace::resolve_tun(interface)?;
    cmd("ifconfig", &[&real_interface, "mtu", &mtu.to_string()])?;
    Ok(())
}

#[cfg(target_os = "linux")]
pub use super::netlink::set_addr;

#[cfg(target_os = "linux")]
pub use super::netlink::set_up;

#[cfg(target_os = "macos")]
pub fn add_route(interface: &InterfaceName, cidr: IpNet) -> Result<bool, io::Error> {
    let real_interface = wireguard_control::backends::userspace::resolve_tun(interface)?;
    let output = cmd(
        "route",
        &[
            "-n",
            "add",
            if matches!(cidr, IpNet::V4(_)) {
                "-inet"
            } else {
                "-inet6"
            },
            &cidr.to_string(),
            "-interface",
            &real_interface,
        ],
    )?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        Err(io::Error::other(format!(
            "failed to add route for device {} ({}): {}",
            &interface, real_interface, stderr
        )))
    } else {
        Ok(!stderr.contains("File exists"))
    }
}

#[cfg(target_os = "linux")]
pub use super::netlink::add_route;

#[cfg(target_os = "macos")]
pub fn del_route(interface: &InterfaceName, cidr: IpNet) -> Result<(), io::Error> {
    let real_interface = wireguard_control::backends::userspace::resolve_tun(interface)?;
    let output = cmd(
        "route",
        &[
            "-n",
            "delete",
            if matches!(cidr, IpNet::V4(_)) {
                "-inet"
            } else {
                "-inet6"
            },
            &cidr.to_string(),
            "-interface",
            &real_interface,
        ],
    )?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() && !stderr.contains("not in table") {
        Err(io::Error::other(format!(
            "failed to remove route for device {} ({}): {}",
            &interface, real_interface, stderr
        )))
    } else {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use super::netlink::del_route;

/// Bring the tunnel interface down and remove it entirely. Idempotent:
/// succeeds (as a no-op) if the interface doesn't exist.
pub fn down(interface: &InterfaceName, backend: Backend) -> Result<(), io::Error> {
    match Device::get(interface, backend) {
        Ok(device) => device.delete(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn set_listen_port(
    interface: &InterfaceName,
    listen_port: Option<u16>,
    backend: Backend,
) -> Result<(), io::Error> {
    let mut device = DeviceUpdate::new();
    device = match listen_port {
        Some(port) => device.set_listen_port(port),
        None => device.randomize_listen_port(),
    };
    device.apply(interface, backend)
}

pub trait PeerInfoExt {
    /// WireGuard rejects any communication after REJECT_AFTER_TIME, so this
    /// is used as a heuristic for "currentness" without relying on heavier
    /// things like ICMP probing.
    fn is_recently_connected(&self) -> bool;
}

impl PeerInfoExt for PeerInfo {
    fn is_recently_connected(&self) -> bool {
        const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

        let last_handshake = self
            .stats
            .last_handshake_time
            .and_then(|t| t.elapsed().ok())
            .unwrap_or(Duration::MAX);

        last_handshake <= REJECT_AFTER_TIME
    }
}

/// The kernel-selected source address a socket toward `dest` would use,
/// without sending any traffic. One of the two endpoint-discovery platform
/// probes (§4.C); the other enumerates interfaces directly.
pub fn source_address_towards(dest: IpAddr) -> Result<IpAddr, io::Error> {
    let bind_addr: SocketAddrKind = dest.into();
    let socket = std::net::UdpSocket::bind(bind_addr.any())?;
    socket.connect((dest, 53))?;
    Ok(socket.local_addr()?.ip())
}

enum SocketAddrKind {
    V4,
    V6,
}

impl From<IpAddr> for SocketAddrKind {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => SocketAddrKind::V4,
            IpAddr::V6(_) => SocketAddrKind::V6,
        }
    }
}

impl SocketAddrKind {
    fn any(&self) -> (IpAddr, u16) {
        match self {
            SocketAddrKind::V4 => (IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
            SocketAddrKind::V6 => (IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
        }
    }
}
