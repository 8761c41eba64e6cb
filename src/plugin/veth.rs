//! The point-to-point veth link between the host and a pod.
//!
//! A veth cannot be `IFF_POINTTOPOINT`, so the pod side gets its address
//! with the full subnet mask, the kernel's subnet route is removed, and
//! everything is routed via the gateway, which only the host end answers.

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::{debug, info};

use super::sha512_hex;
use crate::ipam::gateway_for;
use crate::netlink::{
    default_network, host_network, masked, version_of, NetError, NetOps, Route, Scope, Tolerate,
};
use crate::sysctl::Sysctl;
use crate::types::{IPConfig, Interface, Route as CniRoute};

/// Interface names are limited to 15 bytes.
const IFNAME_MAX: usize = 15;

fn digest_hex(parts: &[&str]) -> String {
    let joined: String = parts.iter().map(|p| format!("{}\0", p)).collect();
    sha512_hex(joined.as_bytes())
}

/// Host end name for `(network, container, ifname)`. Stable across retries
/// so a half-built pair from an interrupted ADD can be found again.
pub fn host_veth_name(network: &str, container_id: &str, ifname: &str) -> String {
    let hex = digest_hex(&[network, container_id, ifname]);
    format!("veth{}", &hex[..IFNAME_MAX - 4])
}

/// Name the pod end carries before it is moved and renamed.
fn temp_peer_name(network: &str, container_id: &str, ifname: &str) -> String {
    let hex = digest_hex(&[ifname, container_id, network]);
    format!("tmp{}", &hex[..IFNAME_MAX - 3])
}

fn gateway_of(ip: &IPConfig) -> IpAddr {
    ip.gateway
        .unwrap_or_else(|| gateway_for(version_of(&ip.address.ip())))
}

/// Routes to install in the pod besides the per-address gateway routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodRoutes<'a> {
    /// Exactly the given routes.
    Configured(&'a [CniRoute]),
    /// The given routes, or a default route per family when there are none.
    OrDefault(&'a [CniRoute]),
}

/// Both ends of a freshly built pair, as reported in results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    pub host: Interface,
    pub container: Interface,
}

/// Everything needed to build one pair.
#[derive(Debug, Clone)]
pub struct VethParams<'a> {
    pub network: &'a str,
    pub container_id: &'a str,
    pub netns: &'a str,
    pub ifname: &'a str,
    pub mtu: Option<u32>,
}

impl VethParams<'_> {
    pub fn host_name(&self) -> String {
        host_veth_name(self.network, self.container_id, self.ifname)
    }
}

/// Create the pair, move one end into the pod and configure its addresses
/// and routes. `pod` must operate on the namespace at `params.netns`.
pub fn setup_container_veth(
    host: &dyn NetOps,
    pod: &dyn NetOps,
    params: &VethParams<'_>,
    ips: &[IPConfig],
    routes: PodRoutes<'_>,
) -> Result<VethPair, NetError> {
    let host_name = params.host_name();
    let peer = temp_peer_name(params.network, params.container_id, params.ifname);

    // Leftovers of an interrupted ADD; the pod end goes with it.
    host.delete_link(&host_name).ignore_missing()?;
    host.delete_link(&peer).ignore_missing()?;

    host.add_veth(&host_name, &peer, params.mtu)?;
    host.move_link(&peer, params.netns)?;
    pod.rename_link(&peer, params.ifname)?;
    if let Some(mtu) = params.mtu {
        pod.set_link_mtu(params.ifname, mtu)?;
    }
    pod.set_link_up(params.ifname)?;
    host.set_link_up(&host_name)?;
    info!("created veth {} <-> {} in {}", host_name, params.ifname, params.netns);

    configure_pod_addresses(pod, params.ifname, ips)?;
    configure_pod_routes(pod, params.ifname, ips, routes)?;

    for ip in ips.iter().filter(|ip| ip.is_v4()) {
        if let Err(e) = pod.announce(params.ifname, ip.address.ip()) {
            debug!("gratuitous ARP for {} failed: {}", ip.address.ip(), e);
        }
    }

    let host_link = host
        .link_by_name(&host_name)?
        .ok_or_else(|| NetError::NotFound(format!("link {}", host_name)))?;
    let pod_link = pod
        .link_by_name(params.ifname)?
        .ok_or_else(|| NetError::NotFound(format!("link {}", params.ifname)))?;

    Ok(VethPair {
        host: Interface {
            name: host_link.name,
            mac: host_link.mac,
            sandbox: None,
        },
        container: Interface {
            name: pod_link.name,
            mac: pod_link.mac,
            sandbox: Some(params.netns.to_string()),
        },
    })
}

fn configure_pod_addresses(pod: &dyn NetOps, dev: &str, ips: &[IPConfig]) -> Result<(), NetError> {
    for ip in ips {
        pod.add_address(dev, ip.address, Scope::Universe)
            .ignore_exists()?;

        let subnet = masked(ip.address);
        pod.delete_route(&Route::new(subnet, dev)).ignore_missing()?;

        let gateway = gateway_of(ip);
        let src = ip.address.ip();
        pod.add_route(
            &Route::new(host_network(gateway), dev)
                .scope(Scope::Link)
                .src(src),
        )
        .ignore_exists()?;
        pod.add_route(&Route::new(subnet, dev).via(gateway).src(src))
            .ignore_exists()?;
    }
    Ok(())
}

fn configure_pod_routes(
    pod: &dyn NetOps,
    dev: &str,
    ips: &[IPConfig],
    routes: PodRoutes<'_>,
) -> Result<(), NetError> {
    let (configured, default) = match routes {
        PodRoutes::Configured(r) => (r, false),
        PodRoutes::OrDefault(r) => (r, r.is_empty()),
    };

    let gateway_for_dst = |dst: &IpNetwork| {
        ips.iter()
            .find(|ip| ip.address.is_ipv4() == dst.is_ipv4())
            .map(gateway_of)
    };

    for route in configured {
        let Some(gw) = route.gw.or_else(|| gateway_for_dst(&route.dst)) else {
            debug!("no gateway of the right family for route {}", route.dst);
            continue;
        };
        pod.add_route(&Route::new(route.dst, dev).via(gw))
            .ignore_exists()?;
    }

    if default {
        for ip in ips {
            let version = version_of(&ip.address.ip());
            pod.add_route(&Route::new(default_network(version), dev).via(gateway_of(ip)))
                .ignore_exists()?;
        }
    }
    Ok(())
}

/// Host side of the pair: the gateway address and a route to each pod IP.
pub fn setup_host_veth(host: &dyn NetOps, host_name: &str, ips: &[IPConfig]) -> Result<(), NetError> {
    for ip in ips {
        host.add_address(host_name, host_network(gateway_of(ip)), Scope::Link)
            .ignore_exists()?;
        host.add_route(&Route::new(host_network(ip.address.ip()), host_name).scope(Scope::Link))
            .ignore_exists()?;
    }
    Ok(())
}

/// Turn on forwarding for every family present in `ips`.
pub fn enable_forwarding(sysctl: &dyn Sysctl, ips: &[IPConfig]) -> std::io::Result<()> {
    if ips.iter().any(|ip| ip.is_v4()) {
        sysctl.set("net/ipv4/ip_forward", "1")?;
    }
    if ips.iter().any(|ip| !ip.is_v4()) {
        sysctl.set("net/ipv6/conf/all/forwarding", "1")?;
    }
    Ok(())
}

/// Delete the pod end, returning the addresses it carried. A missing link
/// yields no addresses.
pub fn delete_container_veth(pod: &dyn NetOps, ifname: &str) -> Result<Vec<IpNetwork>, NetError> {
    let addresses = match pod.addresses(ifname) {
        Ok(addrs) => addrs.into_iter().map(|a| a.network).collect(),
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    pod.delete_link(ifname).ignore_missing()?;
    Ok(addresses)
}
