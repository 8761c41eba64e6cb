//! Per-ENI policy routing on the host.
//!
//! Each ENI gets its own table (`10 + device number`) holding a link route
//! for its subnet and a default route via its gateway. Source rules pin the
//! ENI's primary address and every pod address to that table, so traffic
//! leaves through the interface that owns the address. Node-port traffic
//! arriving on the primary interface is connmarked and routed back via the
//! main table regardless of which pod answers.
//!
//! Every step is idempotent; running the whole setup twice leaves the same
//! kernel state as running it once.

use ipnetwork::IpNetwork;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IpVersion;
use crate::firewall::{rule, Firewall, FirewallError};
use crate::metadata::{Metadata, MetadataError, MetadataSource};
use crate::netlink::{
    host_network, masked, version_of, Link, NetError, NetOps, Route, Rule, Scope, Tolerate,
    TABLE_MAIN,
};
use crate::sysctl::Sysctl;
use crate::types::IPConfig;

// Rule priorities; lower is evaluated first.
pub const RULE_PRIORITY_LOCAL_PODS: u32 = 30000;
pub const RULE_PRIORITY_MASQ: u32 = 30010;
pub const RULE_PRIORITY_OUTGOING_ENI: u32 = 30020;

pub const MASQ_MARK: u32 = 0x80;

pub const ROUTE_TABLE_POD: u32 = 9;
pub const ROUTE_TABLE_ENI_START: u32 = 10;

/// Routing table of the ENI with `device_number`.
pub fn eni_table(device_number: u32) -> u32 {
    ROUTE_TABLE_ENI_START + device_number
}

/// RAs repeat roughly every 10s; poll well inside that.
const GATEWAY_POLL_INTERVAL: Duration = Duration::from_secs(1);

const MANGLE: &str = "mangle";
const PREROUTING: &str = "PREROUTING";

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("failed to find ENI for {0}")]
    EniNotFound(IpAddr),
    #[error("failed to find existing interface with MAC {0}")]
    InterfaceNotFound(String),
    #[error("ENI {0} has no addresses")]
    NoAddresses(String),
    #[error("timed out after {waited:?} waiting for IPv6 router advertisement on {dev}")]
    GatewayTimeout { dev: String, waited: Duration },
    #[error("cancelled while waiting for IPv6 router advertisement on {0}")]
    Cancelled(String),
    #[error("failed to set {key}: {source}")]
    Sysctl { key: String, source: io::Error },
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Firewall(#[from] FirewallError),
}

/// Marks node-port traffic arriving on the primary interface.
fn masq_mark_rule(primary: &str) -> Vec<String> {
    let mark = format!("{:#x}/{:#x}", MASQ_MARK, MASQ_MARK);
    rule(&[
        "-m", "comment", "--comment", "eni-cni, primary ENI",
        "-i", primary,
        "-m", "addrtype", "--dst-type", "LOCAL", "--limit-iface-in",
        "-j", "CONNMARK", "--set-mark", &mark,
    ])
}

/// Restores the mark on replies coming back from a pod.
fn restore_mark_rule(veth: &str) -> Vec<String> {
    let mask = format!("{:#x}", MASQ_MARK);
    rule(&[
        "-m", "comment", "--comment", "eni-cni, container return",
        "-i", veth,
        "-j", "CONNMARK", "--restore-mark", "--mask", &mask,
    ])
}

/// IPv4 ENI gateway: the subnet's network address with the low bit set.
pub fn ipv4_gateway(subnet: IpNetwork) -> Option<IpAddr> {
    match masked(subnet).ip() {
        IpAddr::V4(net) => Some(IpAddr::V4(Ipv4Addr::from(u32::from(net) | 1))),
        IpAddr::V6(_) => None,
    }
}

/// Builds host routing for pod addresses living on ENIs.
pub struct PolicyRouter<'a, S> {
    net: &'a dyn NetOps,
    firewall: &'a dyn Firewall,
    sysctl: &'a dyn Sysctl,
    metadata: &'a Metadata<S>,
    mtu: Option<u32>,
    gateway_timeout: Option<Duration>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl<'a, S: MetadataSource> PolicyRouter<'a, S> {
    pub fn new(
        net: &'a dyn NetOps,
        firewall: &'a dyn Firewall,
        sysctl: &'a dyn Sysctl,
        metadata: &'a Metadata<S>,
    ) -> Self {
        Self {
            net,
            firewall,
            sysctl,
            metadata,
            mtu: None,
            gateway_timeout: None,
            poll_interval: GATEWAY_POLL_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }

    /// MTU applied to every ENI touched; left alone when unset.
    pub fn mtu(mut self, mtu: Option<u32>) -> Self {
        self.mtu = mtu;
        self
    }

    /// Give up waiting for an IPv6 gateway after `timeout`. Unset waits
    /// until cancelled.
    pub fn gateway_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Route every address in `ips` out of its owning ENI. `veth` is the
    /// host end of the pod's link. The primary ENI is always configured too
    /// so the host itself stays reachable.
    pub async fn setup_host_eni(&self, veth: &str, ips: &[IPConfig]) -> Result<(), RoutingError> {
        let primary_mac = self.metadata.primary_mac().await?;

        for ip in ips {
            let addr = ip.address.ip();
            let version = version_of(&addr);
            let mac = self.find_eni(addr).await?;
            info!("{} belongs to ENI {}", addr, mac);

            self.setup_eni_iface(veth, &mac, version).await?;
            self.setup_pod_route(veth, &mac, addr).await?;

            if !mac.eq_ignore_ascii_case(&primary_mac) {
                self.setup_eni_iface(veth, &primary_mac, version).await?;
            }
        }
        Ok(())
    }

    /// MAC of the ENI carrying `ip`. Metadata has no index by address, so
    /// every interface is scanned.
    pub async fn find_eni(&self, ip: IpAddr) -> Result<String, RoutingError> {
        let version = version_of(&ip);
        for mac in self.metadata.macs().await? {
            if self.metadata.addresses(&mac, version).await?.contains(&ip) {
                return Ok(mac);
            }
        }
        Err(RoutingError::EniNotFound(ip))
    }

    fn link_for(&self, mac: &str) -> Result<Link, RoutingError> {
        self.net
            .link_by_mac(mac)?
            .ok_or_else(|| RoutingError::InterfaceNotFound(mac.to_string()))
    }

    fn set_sysctl(&self, key: String, value: &str) -> Result<(), RoutingError> {
        self.sysctl
            .set(&key, value)
            .map_err(|source| RoutingError::Sysctl { key, source })
    }

    /// Bring up one ENI and (re)build its table, plus the host-wide rules.
    pub async fn setup_eni_iface(
        &self,
        veth: &str,
        mac: &str,
        version: IpVersion,
    ) -> Result<(), RoutingError> {
        let primary = self.link_for(&self.metadata.primary_mac().await?)?;

        self.net
            .ensure_rule(&Rule::new(version, RULE_PRIORITY_LOCAL_PODS, ROUTE_TABLE_POD))?;

        // kube-proxy rewrites node-port traffic to the primary address after
        // policy routing picked an interface; the mark sends replies back
        // through the main table instead.
        self.firewall
            .append_unique(version, MANGLE, PREROUTING, &masq_mark_rule(&primary.name))?;
        self.firewall
            .append_unique(version, MANGLE, PREROUTING, &restore_mark_rule(veth))?;
        self.net.ensure_rule(
            &Rule::new(version, RULE_PRIORITY_MASQ, TABLE_MAIN).fwmark(MASQ_MARK, MASQ_MARK),
        )?;

        let eni = self.link_for(mac)?;
        let subnet = self.metadata.subnet(mac, version).await?;
        let table = eni_table(self.metadata.device_number(mac).await?);

        if let Some(mtu) = self.mtu {
            self.net.set_link_mtu(&eni.name, mtu)?;
        }
        self.net.set_link_up(&eni.name)?;

        let ips = self.metadata.addresses(mac, version).await?;
        let eni_primary = *ips
            .first()
            .ok_or_else(|| RoutingError::NoAddresses(mac.to_string()))?;
        let addr = IpNetwork::new(eni_primary, subnet.prefix())
            .map_err(|e| MetadataError::Parse {
                path: format!("network/interfaces/macs/{}", mac),
                message: e.to_string(),
            })?;
        self.net
            .add_address(&eni.name, addr, Scope::Universe)
            .ignore_exists()?;

        if version == IpVersion::V4 {
            self.set_sysctl(format!("net/ipv4/conf/{}/rp_filter", primary.name), "2")?;
        }

        let gateway = match version {
            IpVersion::V4 => ipv4_gateway(subnet).ok_or_else(|| {
                RoutingError::Metadata(MetadataError::Parse {
                    path: format!("network/interfaces/macs/{}/subnet-ipv4-cidr-block", mac),
                    message: format!("{} is not an IPv4 subnet", subnet),
                })
            })?,
            IpVersion::V6 => {
                // Accept RAs even with forwarding on.
                self.set_sysctl(format!("net/ipv6/conf/{}/accept_ra", eni.name), "2")?;
                self.wait_for_ipv6_gateway(&eni.name).await?
            }
        };

        let routes = [
            Route::new(masked(subnet), &eni.name)
                .table(table)
                .scope(Scope::Link),
            Route::default_via(version, gateway, &eni.name).table(table),
        ];
        for route in &routes {
            self.net.replace_route(route)?;
        }
        debug!("table {} for {} via {}", table, eni.name, gateway);

        // Table exists now; safe to pin to it.
        self.net.ensure_rule(
            &Rule::new(version, RULE_PRIORITY_OUTGOING_ENI, table).from_src(host_network(eni_primary)),
        )?;
        Ok(())
    }

    /// Pod-local delivery route and the pin rule for one pod address.
    pub async fn setup_pod_route(
        &self,
        veth: &str,
        mac: &str,
        ip: IpAddr,
    ) -> Result<(), RoutingError> {
        let version = version_of(&ip);
        self.net
            .replace_route(&Route::new(host_network(ip), veth).table(ROUTE_TABLE_POD))?;

        let table = eni_table(self.metadata.device_number(mac).await?);
        self.net.ensure_rule(
            &Rule::new(version, RULE_PRIORITY_OUTGOING_ENI, table).from_src(host_network(ip)),
        )?;
        Ok(())
    }

    /// Wait for a router-advertised default route on `dev` in the main
    /// table and return its gateway. The only source of the IPv6 gateway.
    pub async fn wait_for_ipv6_gateway(&self, dev: &str) -> Result<IpAddr, RoutingError> {
        let started = Instant::now();
        loop {
            let routes = self.net.routes(IpVersion::V6, Some(TABLE_MAIN), Some(dev))?;
            let found = routes
                .iter()
                .filter(|r| r.is_default())
                .find_map(|r| r.gateway.filter(|gw| !gw.is_unspecified()));
            if let Some(gateway) = found {
                return Ok(gateway);
            }

            let waited = started.elapsed();
            if let Some(limit) = self.gateway_timeout {
                if waited >= limit {
                    return Err(RoutingError::GatewayTimeout {
                        dev: dev.to_string(),
                        waited,
                    });
                }
            }
            info!("waiting for IPv6 router advertisement on {}", dev);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(RoutingError::Cancelled(dev.to_string()));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Undo the per-pod parts of [`PolicyRouter::setup_host_eni`]. ENI tables
/// and host-wide rules stay; other pods use them. Everything tolerates
/// being gone already.
pub fn teardown_pod(
    net: &dyn NetOps,
    firewall: &dyn Firewall,
    veth: &str,
    ips: &[IpAddr],
) -> Result<(), RoutingError> {
    for ip in ips {
        let version = version_of(ip);
        let src = host_network(*ip);
        let pins: Vec<Rule> = net
            .rules(version)?
            .into_iter()
            .filter(|r| r.priority == RULE_PRIORITY_OUTGOING_ENI && r.src == Some(src))
            .collect();
        for pin in &pins {
            net.delete_rule(pin).ignore_missing()?;
        }
        net.delete_route(&Route::new(src, veth).table(ROUTE_TABLE_POD))
            .ignore_missing()?;
    }

    let restore = restore_mark_rule(veth);
    for version in [IpVersion::V4, IpVersion::V6] {
        match firewall.delete(version, MANGLE, PREROUTING, &restore) {
            Ok(()) => debug!("removed connmark restore rule for {}", veth),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("failed to remove connmark restore rule for {}: {}", veth, e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::MemoryFirewall;
    use crate::metadata::StaticMetadata;
    use crate::netlink::MemoryNet;
    use crate::sysctl::MemorySysctl;

    const PRIMARY_MAC: &str = "0a:00:00:00:00:01";
    const ENI_MAC: &str = "0a:00:00:00:00:03";
    const VETH: &str = "veth0123456789a";

    struct Host {
        net: MemoryNet,
        fw: MemoryFirewall,
        sysctl: MemorySysctl,
        md: Metadata<StaticMetadata>,
    }

    fn host() -> Host {
        let mut md = StaticMetadata::new();
        md.add_interface(PRIMARY_MAC, 0, "10.0.0.0/24", &["10.0.0.5", "10.0.0.6"])
            .add_interface(ENI_MAC, 2, "10.0.1.0/24", &["10.0.1.4", "10.0.1.9"]);
        let net = MemoryNet::new();
        net.add_device("eth0", PRIMARY_MAC, 9001);
        net.add_device("eth2", ENI_MAC, 1500);
        net.add_veth(VETH, "peer", None).unwrap();
        Host {
            net,
            fw: MemoryFirewall::new(),
            sysctl: MemorySysctl::new(),
            md: Metadata::new(md),
        }
    }

    impl Host {
        fn router(&self) -> PolicyRouter<'_, StaticMetadata> {
            PolicyRouter::new(&self.net, &self.fw, &self.sysctl, &self.md).mtu(Some(9001))
        }
    }

    fn pod_ip(addr: &str) -> IPConfig {
        IPConfig {
            interface: Some(1),
            address: addr.parse().unwrap(),
            gateway: Some("169.254.0.1".parse().unwrap()),
        }
    }

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn gateway_is_subnet_base_plus_one() {
        assert_eq!(
            ipv4_gateway(net("10.0.1.0/24")),
            Some("10.0.1.1".parse().unwrap())
        );
        assert_eq!(
            ipv4_gateway(net("172.31.32.0/20")),
            Some("172.31.32.1".parse().unwrap())
        );
        assert_eq!(ipv4_gateway(net("2001:db8::/64")), None);
    }

    #[tokio::test]
    async fn pod_on_secondary_eni_gets_its_table() {
        let h = host();
        h.router()
            .setup_host_eni(VETH, &[pod_ip("10.0.1.9/24")])
            .await
            .unwrap();

        let table = h.net.routes(IpVersion::V4, Some(12), None).unwrap();
        assert!(table.iter().any(|r| r.dst == net("10.0.1.0/24")
            && r.scope == Scope::Link
            && r.dev == "eth2"));
        assert!(table
            .iter()
            .any(|r| r.is_default() && r.gateway == Some("10.0.1.1".parse().unwrap())));

        let rules = h.net.rules(IpVersion::V4).unwrap();
        let pin = Rule::new(IpVersion::V4, RULE_PRIORITY_OUTGOING_ENI, 12).from_src(net("10.0.1.9/32"));
        assert!(rules.contains(&pin));
        let eni_primary =
            Rule::new(IpVersion::V4, RULE_PRIORITY_OUTGOING_ENI, 12).from_src(net("10.0.1.4/32"));
        assert!(rules.contains(&eni_primary));

        let pod_route = h.net.routes(IpVersion::V4, Some(ROUTE_TABLE_POD), None).unwrap();
        assert_eq!(pod_route.len(), 1);
        assert_eq!(pod_route[0].dst, net("10.0.1.9/32"));
        assert_eq!(pod_route[0].dev, VETH);

        let eth2 = h.net.link_by_name("eth2").unwrap().unwrap();
        assert!(eth2.up);
        assert_eq!(eth2.mtu, 9001);
        assert!(h
            .net
            .addresses("eth2")
            .unwrap()
            .iter()
            .any(|a| a.network == net("10.0.1.4/24")));
    }

    #[tokio::test]
    async fn primary_eni_is_always_configured() {
        let h = host();
        h.router()
            .setup_host_eni(VETH, &[pod_ip("10.0.1.9/24")])
            .await
            .unwrap();

        let main_eni = h.net.routes(IpVersion::V4, Some(10), None).unwrap();
        assert!(main_eni
            .iter()
            .any(|r| r.is_default() && r.gateway == Some("10.0.0.1".parse().unwrap())));
        let rules = h.net.rules(IpVersion::V4).unwrap();
        assert!(rules.contains(
            &Rule::new(IpVersion::V4, RULE_PRIORITY_OUTGOING_ENI, 10).from_src(net("10.0.0.5/32"))
        ));
        assert_eq!(
            h.sysctl.get("net/ipv4/conf/eth0/rp_filter").as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn setup_is_idempotent() {
        let h = host();
        let ips = [pod_ip("10.0.1.9/24")];
        h.router().setup_host_eni(VETH, &ips).await.unwrap();
        let routes = h.net.all_routes();
        let rules = h.net.all_rules();
        let mangle = h.fw.rules(IpVersion::V4, MANGLE, PREROUTING);

        h.router().setup_host_eni(VETH, &ips).await.unwrap();
        assert_eq!(h.net.all_routes(), routes);
        assert_eq!(h.net.all_rules(), rules);
        assert_eq!(h.fw.rules(IpVersion::V4, MANGLE, PREROUTING), mangle);
    }

    #[tokio::test]
    async fn rule_classes_keep_their_order() {
        let h = host();
        h.router()
            .setup_host_eni(VETH, &[pod_ip("10.0.1.9/24")])
            .await
            .unwrap();

        let rules = h.net.all_rules();
        let local = rules.iter().find(|r| r.table == ROUTE_TABLE_POD).unwrap();
        let masq = rules.iter().find(|r| r.mark.is_some()).unwrap();
        assert_eq!(masq.mark, Some((MASQ_MARK, MASQ_MARK)));
        assert_eq!(masq.table, TABLE_MAIN);
        assert!(local.priority < masq.priority);
        for pin in rules.iter().filter(|r| r.src.is_some()) {
            assert!(masq.priority < pin.priority);
        }

        let mangle = h.fw.rules(IpVersion::V4, MANGLE, PREROUTING);
        assert_eq!(mangle.len(), 2);
        assert!(mangle[0].contains(&"eth0".to_string()));
        assert!(mangle[1].contains(&VETH.to_string()));
    }

    #[tokio::test]
    async fn unknown_address_is_an_error() {
        let h = host();
        let err = h
            .router()
            .setup_host_eni(VETH, &[pod_ip("10.9.9.9/24")])
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::EniNotFound(_)));
    }

    #[tokio::test]
    async fn missing_interface_for_mac_is_an_error() {
        let h = host();
        h.net.delete_link("eth2").unwrap();
        let err = h
            .router()
            .setup_host_eni(VETH, &[pod_ip("10.0.1.9/24")])
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::InterfaceNotFound(mac) if mac == ENI_MAC));
    }

    fn v6_host() -> Host {
        let mut md = StaticMetadata::new();
        md.add_interface(PRIMARY_MAC, 0, "2001:db8:1::/64", &["2001:db8:1::5", "2001:db8:1::6"]);
        let net = MemoryNet::new();
        net.add_device("eth0", PRIMARY_MAC, 9001);
        net.add_veth(VETH, "peer", None).unwrap();
        Host {
            net,
            fw: MemoryFirewall::new(),
            sysctl: MemorySysctl::new(),
            md: Metadata::new(md),
        }
    }

    #[tokio::test]
    async fn ipv6_gateway_is_learned_from_router_advertisement() {
        let h = v6_host();
        let ra = h.net.clone();
        let advertise = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            ra.add_route(&Route::default_via(
                IpVersion::V6,
                "fe80::1234".parse().unwrap(),
                "eth0",
            ))
            .unwrap();
        });

        h.router()
            .poll_interval(Duration::from_millis(5))
            .setup_host_eni(VETH, &[pod_ip("2001:db8:1::6/64")])
            .await
            .unwrap();
        advertise.await.unwrap();

        assert_eq!(h.sysctl.get("net/ipv6/conf/eth0/accept_ra").as_deref(), Some("2"));
        assert_eq!(h.sysctl.get("net/ipv4/conf/eth0/rp_filter"), None);
        let table = h.net.routes(IpVersion::V6, Some(10), None).unwrap();
        assert!(table
            .iter()
            .any(|r| r.is_default() && r.gateway == Some("fe80::1234".parse().unwrap())));
    }

    #[tokio::test]
    async fn ipv6_wait_honours_timeout_and_cancellation() {
        let h = v6_host();
        let err = h
            .router()
            .poll_interval(Duration::from_millis(5))
            .gateway_timeout(Some(Duration::from_millis(20)))
            .wait_for_ipv6_gateway("eth0")
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::GatewayTimeout { .. }));

        let token = CancellationToken::new();
        token.cancel();
        let err = h
            .router()
            .cancel_on(token)
            .wait_for_ipv6_gateway("eth0")
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Cancelled(dev) if dev == "eth0"));
    }

    #[tokio::test]
    async fn teardown_removes_only_pod_state() {
        let h = host();
        h.router()
            .setup_host_eni(VETH, &[pod_ip("10.0.1.9/24")])
            .await
            .unwrap();

        let ip: IpAddr = "10.0.1.9".parse().unwrap();
        teardown_pod(&h.net, &h.fw, VETH, &[ip]).unwrap();
        teardown_pod(&h.net, &h.fw, VETH, &[ip]).unwrap();

        let rules = h.net.all_rules();
        assert!(!rules.iter().any(|r| r.src == Some(host_network(ip))));
        assert!(rules.iter().any(|r| r.src == Some(net("10.0.1.4/32"))));
        assert!(h
            .net
            .routes(IpVersion::V4, Some(ROUTE_TABLE_POD), None)
            .unwrap()
            .is_empty());
        let mangle = h.fw.rules(IpVersion::V4, MANGLE, PREROUTING);
        assert_eq!(mangle.len(), 1);
        assert!(!mangle[0].contains(&VETH.to_string()));
    }
}
