//! `egress-v4`: IPv4 egress for pods that only have IPv6.
//!
//! The NAT address lives on a second veth (`nat0` by default) so that
//! tooling reading the pod's primary interface never mistakes it for the
//! pod IP. Traffic leaving through it is SNATed on the host.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::snat::{snat4, snat4_check, snat4_del};
use super::veth::{
    delete_container_veth, enable_forwarding, host_veth_name, setup_container_veth,
    setup_host_veth, PodRoutes, VethParams,
};
use super::{CheckError, ExecIpam, Host, IpamDelegate};
use crate::commands::{CniPlugin, Invocation};
use crate::config::EgressNetConf;
use crate::netlink::{NetError, Tolerate};
use crate::types::Result as CniResult;

pub struct EgressV4 {
    host: Host,
    ipam: Box<dyn IpamDelegate>,
}

impl EgressV4 {
    pub fn new(host: Host, ipam: Box<dyn IpamDelegate>) -> Self {
        Self { host, ipam }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(Host::system(), Box::new(ExecIpam::new())))
    }

    async fn add_with(
        &self,
        inv: &Invocation,
        conf: &EgressNetConf,
        mut result: CniResult,
        allocated: CniResult,
    ) -> Result<CniResult> {
        let args = &inv.args;
        if allocated.ips.is_empty() {
            bail!("IPAM plugin returned zero IPs");
        }

        enable_forwarding(self.host.sysctl.as_ref(), &allocated.ips)
            .context("could not enable IP forwarding")?;

        let net = self.host.net.as_ref();
        let pod = net
            .enter(&args.netns)
            .with_context(|| format!("failed to open netns {:?}", args.netns))?;
        // The configured ifName, not the runtime's.
        let params = VethParams {
            network: &conf.net.name,
            container_id: &args.container_id,
            netns: &args.netns,
            ifname: &conf.if_name,
            mtu: conf.mtu,
        };

        let pair = setup_container_veth(
            net,
            pod.as_ref(),
            &params,
            &allocated.ips,
            PodRoutes::OrDefault(&allocated.routes),
        )?;
        setup_host_veth(net, &pair.host.name, &allocated.ips)?;

        if let Some(snat_ip) = conf.snat_ip {
            for ip in allocated.v4_ips() {
                snat4(
                    self.host.firewall.as_ref(),
                    &conf.net.name,
                    &args.container_id,
                    ip.address.ip(),
                    snat_ip,
                )?;
            }
        }

        // Interfaces only; the NAT address stays out of the result.
        result.add_interface(pair.host);
        result.add_interface(pair.container);
        result.cni_version = conf.net.result_version().to_string();
        Ok(result)
    }
}

#[async_trait(?Send)]
impl CniPlugin for EgressV4 {
    fn name(&self) -> &'static str {
        "egress-v4"
    }

    async fn add(&self, inv: &Invocation) -> Result<CniResult> {
        let args = &inv.args;
        let conf = EgressNetConf::parse(&args.stdin_data)?;
        let mut prev = conf.net.prev_result()?.clone();

        if prev.v4_ips().next().is_some() {
            info!("pod already has IPv4, nothing to do");
            prev.cni_version = conf.net.result_version().to_string();
            return Ok(prev);
        }

        let ipam_type = &conf.net.ipam()?.ipam_type;
        let allocated = self
            .ipam
            .add(ipam_type, args)
            .await
            .context("running IPAM plugin failed")?;

        match self.add_with(inv, &conf, prev, allocated).await {
            Ok(result) => {
                info!("ADD done: egress via {}", conf.if_name);
                Ok(result)
            }
            Err(e) => {
                if let Err(del) = self.ipam.del(ipam_type, args).await {
                    warn!("failed to release address after failed ADD: {}", del);
                }
                Err(e)
            }
        }
    }

    async fn check(&self, inv: &Invocation) -> Result<()> {
        let args = &inv.args;
        let conf = EgressNetConf::parse(&args.stdin_data)?;
        let prev = conf.net.prev_result()?;

        if conf.snat_ip.is_none() {
            return Ok(());
        }
        // The result never carries the NAT address; read it off the link.
        let hidden = prev
            .interfaces
            .iter()
            .any(|i| i.name == conf.if_name && i.sandbox.as_deref() == Some(args.netns.as_str()));
        if !hidden {
            debug!("{} not in prevResult, ADD passed through", conf.if_name);
            return Ok(());
        }

        let pod = self
            .host
            .net
            .enter(&args.netns)
            .with_context(|| format!("failed to open netns {:?}", args.netns))?;
        let addresses = match pod.addresses(&conf.if_name) {
            Ok(a) => a,
            Err(e) if e.is_not_found() => {
                return Err(CheckError::MissingInterface(conf.if_name.clone()).into());
            }
            Err(e) => return Err(e.into()),
        };
        for addr in addresses.iter().filter(|a| a.network.is_ipv4()) {
            snat4_check(
                self.host.firewall.as_ref(),
                &conf.net.name,
                &args.container_id,
                addr.network.ip(),
            )?;
        }
        Ok(())
    }

    async fn del(&self, inv: &Invocation) -> Result<()> {
        let args = &inv.args;
        let conf = EgressNetConf::parse(&args.stdin_data)?;

        if let Some(ipam) = &conf.net.ipam {
            self.ipam
                .del(&ipam.ipam_type, args)
                .await
                .context("running IPAM plugin failed")?;
        }

        let net = self.host.net.as_ref();
        if !args.netns.is_empty() {
            match net.enter(&args.netns) {
                Ok(pod) => {
                    delete_container_veth(pod.as_ref(), &conf.if_name)?;
                }
                Err(NetError::Namespace { path, message }) => {
                    debug!("netns {} already gone: {}", path, message);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let host_name = host_veth_name(&conf.net.name, &args.container_id, &conf.if_name);
        net.delete_link(&host_name).ignore_missing()?;

        snat4_del(
            self.host.firewall.as_ref(),
            &conf.net.name,
            &args.container_id,
        )?;
        info!("DEL done for {}", conf.if_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::error_code;
    use crate::config::IpVersion;
    use crate::firewall::MemoryFirewall;
    use crate::netlink::{MemoryNet, NetOps};
    use crate::plugin::delegate::fake::FakeIpam;
    use crate::plugin::snat::chain_name;
    use crate::sysctl::MemorySysctl;
    use crate::types::{CmdArgs, IPConfig, Interface};
    use std::collections::HashMap;
    use std::rc::Rc;

    const NETNS: &str = "/run/netns/pod1";

    fn v6_pod_result() -> CniResult {
        let mut prev = CniResult::new("1.0.0");
        prev.add_interface(Interface {
            name: "eth0".into(),
            mac: None,
            sandbox: Some(NETNS.into()),
        });
        prev.add_ip(IPConfig {
            interface: Some(0),
            address: "2001:db8::10/64".parse().unwrap(),
            gateway: Some("fe80::1".parse().unwrap()),
        });
        prev
    }

    fn nat_address() -> CniResult {
        let mut r = CniResult::new("1.0.0");
        r.add_ip(IPConfig {
            interface: None,
            address: "192.0.2.10/24".parse().unwrap(),
            gateway: Some("192.0.2.1".parse().unwrap()),
        });
        r
    }

    struct Rig {
        net: MemoryNet,
        fw: MemoryFirewall,
        ipam: Rc<FakeIpam>,
        plugin: EgressV4,
    }

    fn rig() -> Rig {
        let net = MemoryNet::new();
        net.namespace(NETNS);
        let fw = MemoryFirewall::new();
        let ipam = Rc::new(FakeIpam::new(nat_address()));
        let plugin = EgressV4::new(
            Host {
                net: Box::new(net.clone()),
                firewall: Box::new(fw.clone()),
                sysctl: Box::new(MemorySysctl::new()),
            },
            Box::new(Rc::clone(&ipam)),
        );
        Rig {
            net,
            fw,
            ipam,
            plugin,
        }
    }

    fn inv(prev: Option<&CniResult>) -> Invocation {
        let mut conf = serde_json::json!({
            "cniVersion": "1.0.0",
            "name": "mynet",
            "type": "egress-v4",
            "snatIP": "198.51.100.10",
            "ipam": {"type": "host-local"},
        });
        if let Some(prev) = prev {
            conf["prevResult"] = serde_json::to_value(prev).unwrap();
        }
        Invocation::new(CmdArgs {
            container_id: "c1".into(),
            netns: NETNS.into(),
            ifname: "eth0".into(),
            args: HashMap::new(),
            path: "/opt/cni/bin".into(),
            stdin_data: serde_json::to_vec(&conf).unwrap(),
        })
    }

    #[tokio::test]
    async fn hidden_link_and_snat_then_del() {
        let r = rig();
        let prev = v6_pod_result();
        let result = r.plugin.add(&inv(Some(&prev))).await.unwrap();

        assert_eq!(result.ips, prev.ips);
        assert_eq!(result.interfaces.len(), 3);
        assert_eq!(result.interfaces[2].name, "nat0");

        let pod = r.net.namespace(NETNS);
        let addrs = pod.addresses("nat0").unwrap();
        assert_eq!(addrs[0].network, "192.0.2.10/24".parse().unwrap());
        let routes = pod.routes(IpVersion::V4, None, Some("nat0")).unwrap();
        assert!(!routes
            .iter()
            .any(|r| r.dst == "192.0.2.0/24".parse().unwrap() && r.gateway.is_none()));
        assert!(routes
            .iter()
            .any(|r| r.is_default() && r.gateway == Some("192.0.2.1".parse().unwrap())));
        assert_eq!(pod.announced(), vec![("nat0".to_string(), "192.0.2.10".parse().unwrap())]);

        let chain = chain_name("mynet", "c1");
        let snat = r.fw.rules(IpVersion::V4, "nat", &chain);
        assert!(snat.iter().any(|rule| rule.contains(&"198.51.100.10".to_string())));
        let post = r.fw.rules(IpVersion::V4, "nat", "POSTROUTING");
        assert_eq!(post.len(), 1);
        assert!(post[0].contains(&"192.0.2.10".to_string()));

        r.plugin.check(&inv(Some(&result))).await.unwrap();

        r.plugin.del(&inv(Some(&result))).await.unwrap();
        r.plugin.del(&inv(Some(&result))).await.unwrap();
        assert!(pod.link_by_name("nat0").unwrap().is_none());
        assert!(r.fw.rules(IpVersion::V4, "nat", "POSTROUTING").is_empty());
        assert!(r.fw.chains(IpVersion::V4, "nat").is_empty());
    }

    #[tokio::test]
    async fn existing_ipv4_passes_through() {
        let r = rig();
        let mut prev = v6_pod_result();
        prev.add_ip(IPConfig {
            interface: Some(0),
            address: "10.0.0.6/24".parse().unwrap(),
            gateway: None,
        });
        let result = r.plugin.add(&inv(Some(&prev))).await.unwrap();
        assert_eq!(result, prev);
        assert!(r.ipam.calls().is_empty());
        assert!(r.fw.chains(IpVersion::V4, "nat").is_empty());
    }

    #[tokio::test]
    async fn requires_chaining() {
        let r = rig();
        let err = r.plugin.add(&inv(None)).await.unwrap_err();
        assert_eq!(error_code(&err), 7);
        assert!(err.to_string().contains("chained"));
    }

    #[tokio::test]
    async fn check_fails_once_snat_is_gone() {
        let r = rig();
        let result = r.plugin.add(&inv(Some(&v6_pod_result()))).await.unwrap();
        crate::plugin::snat::snat4_del(&r.fw, "mynet", "c1").unwrap();

        let err = r.plugin.check(&inv(Some(&result))).await.unwrap_err();
        assert_eq!(error_code(&err), 102);
    }
}
