//! The plugins and the pieces they share.

pub mod delegate;
pub mod egress;
pub mod ipam;
pub mod ptp;
pub mod routing;
pub mod snat;
pub mod veth;

pub use delegate::{DelegateError, ExecIpam, IpamDelegate};
pub use egress::EgressV4;
pub use ipam::ImdsIpam;
pub use ptp::ImdsPtp;
pub use routing::{PolicyRouter, RoutingError};

use itertools::Itertools;
use ipnetwork::IpNetwork;
use ring::digest;
use std::net::IpAddr;
use thiserror::Error;

use crate::firewall::{Firewall, FirewallError, IptablesCommand};
use crate::netlink::{masked, version_of, IpCommand, NetError, NetOps};
use crate::sysctl::{ProcSys, Sysctl};
use crate::types::Result as CniResult;

/// Host-side kernel handles a plugin works through.
pub struct Host {
    pub net: Box<dyn NetOps>,
    pub firewall: Box<dyn Firewall>,
    pub sysctl: Box<dyn Sysctl>,
}

impl Host {
    /// The running kernel, driven by `ip`, `iptables` and `/proc/sys`.
    pub fn system() -> Self {
        Self {
            net: Box::new(IpCommand::new()),
            firewall: Box::new(IptablesCommand::new()),
            sysctl: Box::new(ProcSys::new()),
        }
    }
}

/// A CHECK found state that differs from what ADD reported.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("interface {ifname} in {netns} not found in prevResult")]
    NotInResult { ifname: String, netns: String },
    #[error("container interface {0} not found")]
    MissingInterface(String),
    #[error("container interface {0} is not a veth")]
    NotVeth(String),
    #[error("interface {ifname} has MAC {actual}, expected {expected}")]
    MacMismatch {
        ifname: String,
        expected: String,
        actual: String,
    },
    #[error("interface {ifname} is missing address {address}")]
    MissingAddress { ifname: String, address: IpNetwork },
    #[error("route to {dst} not found")]
    MissingRoute { dst: IpNetwork },
    #[error("no SNAT rule for {ip} in chain {chain}")]
    MissingSnat { ip: IpAddr, chain: String },
    #[error("no reservation for {id}/{ifname}")]
    NoReservation { id: String, ifname: String },
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Firewall(#[from] FirewallError),
}

/// Lowercase hex SHA-512 of `data`.
pub(crate) fn sha512_hex(data: &[u8]) -> String {
    digest::digest(&digest::SHA512, data)
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .join("")
}

/// Audit the pod end of a link against `expected`, the result ADD
/// returned. Read-only.
pub fn check_container_link(
    pod: &dyn NetOps,
    expected: &CniResult,
    ifname: &str,
    netns: &str,
) -> Result<(), CheckError> {
    let index = expected
        .interfaces
        .iter()
        .position(|i| i.name == ifname && i.sandbox.as_deref() == Some(netns))
        .ok_or_else(|| CheckError::NotInResult {
            ifname: ifname.to_string(),
            netns: netns.to_string(),
        })?;
    let want = &expected.interfaces[index];

    let link = pod
        .link_by_name(ifname)?
        .ok_or_else(|| CheckError::MissingInterface(ifname.to_string()))?;
    if !link.is_veth() {
        return Err(CheckError::NotVeth(ifname.to_string()));
    }
    if let Some(mac) = &want.mac {
        let actual = link.mac.clone().unwrap_or_default();
        if !mac.eq_ignore_ascii_case(&actual) {
            return Err(CheckError::MacMismatch {
                ifname: ifname.to_string(),
                expected: mac.clone(),
                actual,
            });
        }
    }

    let present = pod.addresses(ifname)?;
    for ip in expected
        .ips
        .iter()
        .filter(|ip| ip.interface.map_or(true, |i| i == index))
    {
        if !present.iter().any(|a| a.network == ip.address) {
            return Err(CheckError::MissingAddress {
                ifname: ifname.to_string(),
                address: ip.address,
            });
        }
    }

    for route in &expected.routes {
        let dst = masked(route.dst);
        let found = pod
            .routes(version_of(&dst.ip()), None, None)?
            .iter()
            .any(|r| masked(r.dst) == dst && route.gw.map_or(true, |gw| r.gateway == Some(gw)));
        if !found {
            return Err(CheckError::MissingRoute { dst: route.dst });
        }
    }
    Ok(())
}
