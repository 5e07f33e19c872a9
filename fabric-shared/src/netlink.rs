use ipnet::IpNet;
use netlink_packet_core::{NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST};
use netlink_packet_route::{
    address::Nla as AddressNla, constants::*, AddressHeader, AddressMessage, RouteHeader,
    RouteMessage, RtnlMessage, RTN_UNICAST, RT_SCOPE_LINK, RT_SCOPE_UNIVERSE, RT_TABLE_MAIN,
};
use netlink_request::netlink_request_rtnl;
use std::{io, net::IpAddr, process::Command};
use wireguard_control::InterfaceName;

fn if_index(interface: &InterfaceName) -> Result<u32, io::Error> {
    let index = unsafe { libc::if_nametoindex(interface.as_ptr()) };
    if index == 0 {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such interface: {interface}"),
        ))
    } else {
        Ok(index)
    }
}

/// Add a unicast route for `cidr` via `interface`'s link scope. Returns
/// `Ok(false)` (no-op) if the kernel reports the route already exists.
pub fn add_route(interface: &InterfaceName, cidr: IpNet) -> Result<bool, io::Error> {
    let oif = if_index(interface)? as i32;

    let mut message = RouteMessage {
        header: RouteHeader {
            table: RT_TABLE_MAIN,
            protocol: RTPROT_BOOT,
            scope: RT_SCOPE_LINK,
            kind: RTN_UNICAST,
            address_family: if cidr.addr().is_ipv4() { AF_INET as u8 } else { AF_INET6 as u8 },
            destination_prefix_length: cidr.prefix_len(),
            ..Default::default()
        },
        nlas: vec![],
    };
    match cidr {
        IpNet::V4(network) => message
            .nlas
            .push(netlink_packet_route::route::Nla::Destination(
                network.network().octets().to_vec(),
            )),
        IpNet::V6(network) => message
            .nlas
            .push(netlink_packet_route::route::Nla::Destination(
                network.network().octets().to_vec(),
            )),
    }
    message
        .nlas
        .push(netlink_packet_route::route::Nla::Oif(oif));

    match netlink_request_rtnl(
        RtnlMessage::NewRoute(message),
        Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_EXCL | NLM_F_CREATE),
    ) {
        Ok(_) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove the unicast route for `cidr` via `interface`'s link scope.
/// `Ok(())` if the kernel reports the route doesn't exist (already gone).
pub fn del_route(interface: &InterfaceName, cidr: IpNet) -> Result<(), io::Error> {
    let oif = if_index(interface)? as i32;

    let mut message = RouteMessage {
        header: RouteHeader {
            table: RT_TABLE_MAIN,
            protocol: RTPROT_BOOT,
            scope: RT_SCOPE_LINK,
            kind: RTN_UNICAST,
            address_family: if cidr.addr().is_ipv4() { AF_INET as u8 } else { AF_INET6 as u8 },
            destination_prefix_length: cidr.prefix_len(),
            ..Default::default()
        },
        nlas: vec![],
    };
    match cidr {
        IpNet::V4(network) => message
            .nlas
            .push(netlink_packet_route::route::Nla::Destination(
                network.network().octets().to_vec(),
            )),
        IpNet::V6(network) => message
            .nlas
            .push(netlink_packet_route::route::Nla::Destination(
                network.network().octets().to_vec(),
            )),
    }
    message
        .nlas
        .push(netlink_packet_route::route::Nla::Oif(oif));

    match netlink_request_rtnl(RtnlMessage::DelRoute(message), Some(NLM_F_REQUEST | NLM_F_ACK)) {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Assign `addr` to `interface` via `RTM_NEWADDR`.
pub fn set_addr(interface: &InterfaceName, addr: IpNet) -> Result<(), io::Error> {
    let index = if_index(interface)?;
    let mut message = AddressMessage {
        header: AddressHeader {
            family: if addr.addr().is_ipv4() { AF_INET as u8 } else { AF_INET6 as u8 },
            prefix_len: addr.prefix_len(),
            scope: RT_SCOPE_UNIVERSE,
            index,
            ..Default::default()
        },
        nlas: vec![],
    };
    let octets: Vec<u8> = match addr.addr() {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    message.nlas.push(AddressNla::Address(octets.clone()));
    message.nlas.push(AddressNla::Local(octets));

    match netlink_request_rtnl(
        RtnlMessage::NewAddress(message),
        Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_EXCL | NLM_F_CREATE),
    ) {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Bring `interface` up and set its MTU via the `ip` utility. Manipulating
/// `IFF_UP`/MTU over raw rtnetlink needs a link-flags dance that isn't worth
/// duplicating when every target already ships iproute2.
pub fn set_up(interface: &InterfaceName, mtu: u32) -> Result<(), io::Error> {
    run_ip(&["link", "set", "mtu", &mtu.to_string(), "up", "dev", interface.as_str_lossy().as_ref()])
}

fn run_ip(args: &[&str]) -> Result<(), io::Error> {
    let output = Command::new("ip").args(args).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

/// Enumerate local, non-loopback IPv4/IPv6 addresses. Used as the fallback
/// endpoint-discovery platform probe (§4.C option 3) on Linux.
pub fn get_local_addrs() -> Result<impl Iterator<Item = IpAddr>, io::Error> {
    let output = Command::new("ip").args(["-o", "addr", "show"]).output()?;
    if !output.status.success() {
        return Err(io::Error::other("failed to enumerate local addresses"));
    }
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    let addrs = text
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let idx = fields.iter().position(|f| *f == "inet" || *f == "inet6")?;
            let cidr = fields.get(idx + 1)?;
            let ip_str = cidr.split('/').next()?;
            ip_str.parse::<IpAddr>().ok()
        })
        .filter(|ip| !ip.is_loopback())
        .collect::<Vec<_>>()
        .into_iter();
    Ok(addrs)
}
