//! Address allocation from ENI secondary addresses.
//!
//! Candidates come straight from instance metadata; the only local state
//! is the [`Store`] of reservations, locked for one invocation.

mod checkpoint;
mod store;

pub use checkpoint::JsonFile;
pub use store::{destroy, Store, StoreError, StoreRow};

use ipnetwork::IpNetwork;
use rand::seq::SliceRandom;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{IgnoreInterfaceTerm, IpVersion};
use crate::metadata::{Metadata, MetadataError, MetadataSource};
use crate::types::IPConfig;

/// Gateway handed to pods for IPv4; lives on the host end of the veth.
pub const GATEWAY_V4: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 1);

/// Gateway handed to pods for IPv6.
pub const GATEWAY_V6: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);

pub fn gateway_for(version: IpVersion) -> IpAddr {
    match version {
        IpVersion::V4 => IpAddr::V4(GATEWAY_V4),
        IpVersion::V6 => IpAddr::V6(GATEWAY_V6),
    }
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no IP addresses available")]
    Exhausted,
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid address {ip} for subnet {subnet}: {message}")]
    Address {
        ip: IpAddr,
        subnet: IpNetwork,
        message: String,
    },
}

/// Picks unreserved secondary addresses of attached ENIs.
pub struct ImdsAllocator<'a, S> {
    store: &'a mut Store,
    metadata: &'a Metadata<S>,
    ignore: &'a [IgnoreInterfaceTerm],
}

impl<'a, S: MetadataSource> ImdsAllocator<'a, S> {
    pub fn new(store: &'a mut Store, metadata: &'a Metadata<S>) -> Self {
        Self {
            store,
            metadata,
            ignore: &[],
        }
    }

    pub fn ignoring(mut self, ignore: &'a [IgnoreInterfaceTerm]) -> Self {
        self.ignore = ignore;
        self
    }

    /// Reserve an address for `(id, ifname)`.
    ///
    /// ENIs and their addresses are tried in random order so crash-looping
    /// pods do not keep fighting over the same address. Each ENI's first
    /// address is its primary and stays with the host. A tuple that already
    /// holds an address of the requested family gets the same one back, so
    /// a retried ADD does not leak.
    pub async fn get(
        &mut self,
        id: &str,
        ifname: &str,
        version: IpVersion,
    ) -> Result<IPConfig, AllocError> {
        let mut macs = self.metadata.macs().await?;

        if let Some(ip) = self.store.find(id, ifname, version) {
            match self.owner_subnet(ip, version, &macs).await? {
                Some(subnet) => {
                    info!("{}/{} already holds {}", id, ifname, ip);
                    return ip_config(ip, subnet, version);
                }
                None => {
                    debug!("dropping stale reservation {} for {}/{}", ip, id, ifname);
                    self.store.release_ip(id, ifname, ip);
                }
            }
        }

        macs.shuffle(&mut rand::thread_rng());

        for mac in &macs {
            if !self.ignore.is_empty() {
                let device = self.metadata.device_number(mac).await?;
                if self.ignore.iter().any(|t| t.matches(device)) {
                    debug!("skipping ignored interface {} (device {})", mac, device);
                    continue;
                }
            }

            let ips = self.metadata.addresses(mac, version).await?;
            let Some((_primary, secondary)) = ips.split_first() else {
                continue;
            };
            if secondary.is_empty() {
                continue;
            }
            let subnet = self.metadata.subnet(mac, version).await?;

            let mut candidates = secondary.to_vec();
            candidates.shuffle(&mut rand::thread_rng());

            for ip in candidates {
                match self.store.reserve(id, ifname, ip) {
                    Ok(()) => {
                        let config = ip_config(ip, subnet, version)?;
                        info!("reserved {} on {} for {}/{}", config.address, mac, id, ifname);
                        return Ok(config);
                    }
                    Err(StoreError::AlreadyReserved(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Err(AllocError::Exhausted)
    }

    /// Subnet of the ENI that currently carries `ip` as a secondary address.
    async fn owner_subnet(
        &self,
        ip: IpAddr,
        version: IpVersion,
        macs: &[String],
    ) -> Result<Option<IpNetwork>, AllocError> {
        for mac in macs {
            let ips = self.metadata.addresses(mac, version).await?;
            if ips.iter().skip(1).any(|a| *a == ip) {
                return Ok(Some(self.metadata.subnet(mac, version).await?));
            }
        }
        Ok(None)
    }

    /// Release whatever `(id, ifname)` holds. Never fails for unknown tuples.
    pub fn put(&mut self, id: &str, ifname: &str) {
        for ip in self.store.release(id, ifname) {
            info!("released {} for {}/{}", ip, id, ifname);
        }
    }
}

fn ip_config(ip: IpAddr, subnet: IpNetwork, version: IpVersion) -> Result<IPConfig, AllocError> {
    let address = IpNetwork::new(ip, subnet.prefix()).map_err(|e| AllocError::Address {
        ip,
        subnet,
        message: e.to_string(),
    })?;
    Ok(IPConfig {
        interface: None,
        address,
        gateway: Some(gateway_for(version)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::StaticMetadata;
    use std::collections::HashSet;

    fn single_eni() -> Metadata<StaticMetadata> {
        let mut md = StaticMetadata::new();
        md.add_interface(
            "0a:00:00:00:00:01",
            0,
            "10.0.0.0/24",
            &["10.0.0.5", "10.0.0.6", "10.0.0.7"],
        );
        Metadata::new(md)
    }

    #[tokio::test]
    async fn allocates_each_secondary_once_then_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        let md = single_eni();
        let mut store = Store::open(dir.path()).unwrap();

        let first = ImdsAllocator::new(&mut store, &md)
            .get("p1", "eth0", IpVersion::V4)
            .await
            .unwrap();
        assert_eq!(first.gateway, Some("169.254.0.1".parse().unwrap()));
        assert_eq!(first.address.prefix(), 24);

        let second = ImdsAllocator::new(&mut store, &md)
            .get("p2", "eth0", IpVersion::V4)
            .await
            .unwrap();

        let got: HashSet<IpAddr> = [first.address.ip(), second.address.ip()].into();
        let want: HashSet<IpAddr> = ["10.0.0.6".parse().unwrap(), "10.0.0.7".parse().unwrap()].into();
        assert_eq!(got, want);

        let err = ImdsAllocator::new(&mut store, &md)
            .get("p3", "eth0", IpVersion::V4)
            .await
            .unwrap_err();
        assert!(matches!(err, AllocError::Exhausted));
        assert_eq!(store.rows().len(), 2);
        assert_eq!(store.find_by_id("p3", "eth0"), None);
    }

    #[tokio::test]
    async fn put_frees_address_for_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let mut md = StaticMetadata::new();
        md.add_interface("0a:00:00:00:00:01", 0, "10.0.0.0/24", &["10.0.0.5", "10.0.0.6"]);
        let md = Metadata::new(md);
        let mut store = Store::open(dir.path()).unwrap();

        let mut alloc = ImdsAllocator::new(&mut store, &md);
        alloc.get("p1", "eth0", IpVersion::V4).await.unwrap();
        alloc.put("p1", "eth0");
        alloc.put("p1", "eth0");
        let again = alloc.get("p2", "eth0", IpVersion::V4).await.unwrap();
        assert_eq!(again.address.ip(), "10.0.0.6".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn ignored_interfaces_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut md = StaticMetadata::new();
        md.add_interface("0a:00:00:00:00:01", 0, "10.0.0.0/24", &["10.0.0.5", "10.0.0.6"])
            .add_interface("0a:00:00:00:00:02", 1, "10.0.1.0/24", &["10.0.1.5", "10.0.1.6"]);
        let md = Metadata::new(md);
        let mut store = Store::open(dir.path()).unwrap();
        let ignore = [IgnoreInterfaceTerm {
            device_index_start: 0,
            device_index_end: 1,
        }];

        for _ in 0..5 {
            let mut alloc = ImdsAllocator::new(&mut store, &md).ignoring(&ignore);
            let ip = alloc.get("p1", "eth0", IpVersion::V4).await.unwrap();
            assert_eq!(ip.address.ip(), "10.0.1.6".parse::<IpAddr>().unwrap());
            alloc.put("p1", "eth0");
        }
    }

    #[tokio::test]
    async fn ipv6_uses_link_local_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let mut md = StaticMetadata::new();
        md.add_interface(
            "0a:00:00:00:00:01",
            0,
            "2001:db8:1::/64",
            &["2001:db8:1::5", "2001:db8:1::6"],
        );
        let md = Metadata::new(md);
        let mut store = Store::open(dir.path()).unwrap();

        let ip = ImdsAllocator::new(&mut store, &md)
            .get("p1", "eth0", IpVersion::V6)
            .await
            .unwrap();
        assert_eq!(ip.address, "2001:db8:1::6/64".parse::<IpNetwork>().unwrap());
        assert_eq!(ip.gateway, Some("fe80::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn repeated_get_returns_held_address() {
        let dir = tempfile::tempdir().unwrap();
        let md = single_eni();
        let mut store = Store::open(dir.path()).unwrap();

        let mut alloc = ImdsAllocator::new(&mut store, &md);
        let first = alloc.get("p1", "eth0", IpVersion::V4).await.unwrap();
        let again = alloc.get("p1", "eth0", IpVersion::V4).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn stale_reservation_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let md = single_eni();
        let mut store = Store::open(dir.path()).unwrap();
        store.reserve("p1", "eth0", "10.9.9.9".parse().unwrap()).unwrap();

        let ip = ImdsAllocator::new(&mut store, &md)
            .get("p1", "eth0", IpVersion::V4)
            .await
            .unwrap();
        assert_ne!(ip.address.ip(), "10.9.9.9".parse::<IpAddr>().unwrap());
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn dual_stack_tuple_reuses_each_family_and_put_frees_both() {
        let dir = tempfile::tempdir().unwrap();
        let mut md = StaticMetadata::new();
        md.add_interface("0a:00:00:00:00:01", 0, "10.0.0.0/24", &["10.0.0.5", "10.0.0.6"])
            .add_interface(
                "0a:00:00:00:00:02",
                1,
                "2001:db8:1::/64",
                &["2001:db8:1::5", "2001:db8:1::6", "2001:db8:1::7"],
            );
        let md = Metadata::new(md);
        let mut store = Store::open(dir.path()).unwrap();

        let mut alloc = ImdsAllocator::new(&mut store, &md);
        let v4 = alloc.get("p1", "eth0", IpVersion::V4).await.unwrap();
        let v6 = alloc.get("p1", "eth0", IpVersion::V6).await.unwrap();
        assert_eq!(alloc.get("p1", "eth0", IpVersion::V6).await.unwrap(), v6);
        assert_eq!(alloc.get("p1", "eth0", IpVersion::V4).await.unwrap(), v4);
        alloc.put("p1", "eth0");

        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn missing_family_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let md = single_eni();
        let mut store = Store::open(dir.path()).unwrap();
        let err = ImdsAllocator::new(&mut store, &md)
            .get("p1", "eth0", IpVersion::V6)
            .await
            .unwrap_err();
        assert!(matches!(err, AllocError::Exhausted));
    }
}
