//! `imds-ipam`: hands out ENI secondary addresses.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::CheckError;
use crate::commands::{CniPlugin, Invocation};
use crate::config::IpamNetConf;
use crate::ipam::{ImdsAllocator, Store};
use crate::metadata::{DynMetadata, ImdsClient, ImdsConfig, Metadata, MetadataSnapshot};
use crate::types::Result as CniResult;

pub struct ImdsIpam {
    metadata: DynMetadata,
}

impl ImdsIpam {
    pub fn new(metadata: DynMetadata) -> Self {
        Self { metadata }
    }

    /// Backed by the metadata service, one snapshot per invocation.
    pub fn from_env() -> Result<Self> {
        let client = ImdsClient::new(ImdsConfig::from_env())?;
        Ok(Self::new(Metadata::boxed(MetadataSnapshot::new(client))))
    }
}

#[async_trait(?Send)]
impl CniPlugin for ImdsIpam {
    fn name(&self) -> &'static str {
        "imds-ipam"
    }

    async fn add(&self, inv: &Invocation) -> Result<CniResult> {
        let args = &inv.args;
        let conf = IpamNetConf::parse(&args.stdin_data)?;
        let ipam = conf.net.ipam()?;

        let mut store = Store::open(ipam.store_dir(&conf.net.name))?;
        // On failure the store is dropped unsaved, releasing the lock.
        let ip = ImdsAllocator::new(&mut store, &self.metadata)
            .ignoring(&ipam.ignore_interfaces)
            .get(&args.container_id, &args.ifname, ipam.ip_version)
            .await
            .context("failed to allocate IP address")?;
        store.close()?;

        let mut result = CniResult::new(conf.net.result_version());
        result.add_ip(ip);
        for route in &ipam.routes {
            result.add_route(route.clone());
        }
        if !conf.net.dns.is_empty() {
            result.set_dns(conf.net.dns.clone());
        }
        Ok(result)
    }

    async fn check(&self, inv: &Invocation) -> Result<()> {
        let args = &inv.args;
        let conf = IpamNetConf::parse(&args.stdin_data)?;
        let store = Store::open(conf.net.ipam()?.store_dir(&conf.net.name))?;
        if store.find_by_id(&args.container_id, &args.ifname).is_none() {
            return Err(CheckError::NoReservation {
                id: args.container_id.clone(),
                ifname: args.ifname.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn del(&self, inv: &Invocation) -> Result<()> {
        let args = &inv.args;
        let conf = IpamNetConf::parse(&args.stdin_data)?;
        let mut store = Store::open(conf.net.ipam()?.store_dir(&conf.net.name))?;
        ImdsAllocator::new(&mut store, &self.metadata).put(&args.container_id, &args.ifname);
        store.close()?;
        info!("DEL done for {}/{}", args.container_id, args.ifname);
        Ok(())
    }
}
