//! `imds-ptp`: a veth point-to-point link into the pod, routed over the
//! ENI that owns the pod's address.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::routing::{teardown_pod, PolicyRouter};
use super::veth::{
    delete_container_veth, enable_forwarding, host_veth_name, setup_container_veth,
    setup_host_veth, PodRoutes, VethParams,
};
use super::{check_container_link, ExecIpam, Host, IpamDelegate};
use crate::commands::{CniPlugin, Invocation};
use crate::config::PtpNetConf;
use crate::metadata::{DynMetadata, ImdsClient, ImdsConfig, Metadata, MetadataSnapshot};
use crate::netlink::{NetError, Tolerate};
use crate::types::Result as CniResult;

pub struct ImdsPtp {
    host: Host,
    ipam: Box<dyn IpamDelegate>,
    metadata: DynMetadata,
    poll_interval: Duration,
}

impl ImdsPtp {
    pub fn new(host: Host, ipam: Box<dyn IpamDelegate>, metadata: DynMetadata) -> Self {
        Self {
            host,
            ipam,
            metadata,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// How often to look for an IPv6 router advertisement.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn from_env() -> Result<Self> {
        let client = ImdsClient::new(ImdsConfig::from_env())?;
        Ok(Self::new(
            Host::system(),
            Box::new(ExecIpam::new()),
            Metadata::boxed(MetadataSnapshot::new(client)),
        ))
    }

    async fn add_with(
        &self,
        inv: &Invocation,
        conf: &PtpNetConf,
        mut result: CniResult,
    ) -> Result<CniResult> {
        let args = &inv.args;
        if result.ips.is_empty() {
            bail!("IPAM plugin returned missing IP config");
        }

        enable_forwarding(self.host.sysctl.as_ref(), &result.ips)
            .context("could not enable IP forwarding")?;

        let net = self.host.net.as_ref();
        let pod = net
            .enter(&args.netns)
            .with_context(|| format!("failed to open netns {:?}", args.netns))?;
        let params = VethParams {
            network: &conf.net.name,
            container_id: &args.container_id,
            netns: &args.netns,
            ifname: &args.ifname,
            mtu: conf.mtu,
        };

        let pair = setup_container_veth(
            net,
            pod.as_ref(),
            &params,
            &result.ips,
            PodRoutes::Configured(&result.routes),
        )?;
        setup_host_veth(net, &pair.host.name, &result.ips)?;

        PolicyRouter::new(
            net,
            self.host.firewall.as_ref(),
            self.host.sysctl.as_ref(),
            &self.metadata,
        )
        .mtu(conf.mtu)
        .gateway_timeout(conf.gateway_timeout())
        .poll_interval(self.poll_interval)
        .cancel_on(inv.cancel.clone())
        .setup_host_eni(&pair.host.name, &result.ips)
        .await?;

        result.interfaces.clear();
        result.add_interface(pair.host);
        let container = result.add_interface(pair.container);
        for ip in &mut result.ips {
            ip.interface = Some(container);
        }
        if !conf.net.dns.is_empty() {
            result.set_dns(conf.net.dns.clone());
        }
        result.cni_version = conf.net.result_version().to_string();
        Ok(result)
    }
}

/// Addresses worth cleaning up after; kernel-assigned link-local ones are
/// never pinned.
fn routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => true,
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

#[async_trait(?Send)]
impl CniPlugin for ImdsPtp {
    fn name(&self) -> &'static str {
        "imds-ptp"
    }

    async fn add(&self, inv: &Invocation) -> Result<CniResult> {
        let args = &inv.args;
        let conf = PtpNetConf::parse(&args.stdin_data)?;
        let ipam_type = &conf.net.ipam()?.ipam_type;

        let allocated = self
            .ipam
            .add(ipam_type, args)
            .await
            .context("running IPAM plugin failed")?;

        match self.add_with(inv, &conf, allocated).await {
            Ok(result) => {
                info!("ADD done: {} ip(s) on {}", result.ips.len(), args.ifname);
                Ok(result)
            }
            Err(e) => {
                // Give the address back; nothing will DEL a failed ADD.
                if let Err(del) = self.ipam.del(ipam_type, args).await {
                    warn!("failed to release address after failed ADD: {}", del);
                }
                Err(e)
            }
        }
    }

    async fn check(&self, inv: &Invocation) -> Result<()> {
        let args = &inv.args;
        let conf = PtpNetConf::parse(&args.stdin_data)?;
        let pod = self
            .host
            .net
            .enter(&args.netns)
            .with_context(|| format!("failed to open netns {:?}", args.netns))?;

        self.ipam.check(&conf.net.ipam()?.ipam_type, args).await?;
        let expected = conf.net.prev_result()?;

        check_container_link(pod.as_ref(), expected, &args.ifname, &args.netns)?;
        Ok(())
    }

    async fn del(&self, inv: &Invocation) -> Result<()> {
        let args = &inv.args;
        let conf = PtpNetConf::parse(&args.stdin_data)?;

        self.ipam
            .del(&conf.net.ipam()?.ipam_type, args)
            .await
            .context("running IPAM plugin failed")?;

        if args.netns.is_empty() {
            return Ok(());
        }

        let net = self.host.net.as_ref();
        let mut ips: Vec<IpAddr> = match net.enter(&args.netns) {
            Ok(pod) => delete_container_veth(pod.as_ref(), &args.ifname)?
                .into_iter()
                .map(|a| a.ip())
                .collect(),
            Err(NetError::Namespace { path, message }) => {
                debug!("netns {} already gone: {}", path, message);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(prev) = &conf.net.prev_result {
            ips.extend(prev.ips.iter().map(|ip| ip.address.ip()));
        }
        ips.retain(routable);
        ips.sort();
        ips.dedup();

        let host_name = host_veth_name(&conf.net.name, &args.container_id, &args.ifname);
        teardown_pod(net, self.host.firewall.as_ref(), &host_name, &ips)?;
        net.delete_link(&host_name).ignore_missing()?;

        info!("DEL done for {}", args.ifname);
        Ok(())
    }
}
