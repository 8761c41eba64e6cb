//! Per-pod IPv4 source NAT in the `nat` table.
//!
//! Layout for one pod:
//!
//! ```text
//! POSTROUTING  -s <pod ip> -j E4-<hash>
//! E4-<hash>    -d 224.0.0.0/4 -j RETURN
//! E4-<hash>    -j SNAT --to-source <snat ip>
//! ```

use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info};

use super::{sha512_hex, CheckError};
use crate::config::IpVersion;
use crate::firewall::{rule, Firewall, FirewallError};

const NAT: &str = "nat";
const POSTROUTING: &str = "POSTROUTING";
const CHAIN_PREFIX: &str = "E4-";
/// iptables chain names are limited to 28 characters.
const CHAIN_MAX: usize = 28;
const MULTICAST: &str = "224.0.0.0/4";

/// Chain owned by one `(network, container)` pair.
pub fn chain_name(network: &str, container_id: &str) -> String {
    let hex = sha512_hex(format!("{}{}", network, container_id).as_bytes());
    let mut name = format!("{}{}", CHAIN_PREFIX, hex);
    name.truncate(CHAIN_MAX);
    name
}

pub fn comment(network: &str, container_id: &str) -> String {
    format!("name: {:?} id: {:?}", network, container_id)
}

fn jump_rule(ip: IpAddr, chain: &str, comment: &str) -> Vec<String> {
    rule(&[
        "-s", &ip.to_string(),
        "-j", chain,
        "-m", "comment", "--comment", comment,
    ])
}

/// Rewrite the source of everything `ip` sends off-host to `snat_ip`.
/// Safe to repeat.
pub fn snat4(
    fw: &dyn Firewall,
    network: &str,
    container_id: &str,
    ip: IpAddr,
    snat_ip: Ipv4Addr,
) -> Result<(), FirewallError> {
    let chain = chain_name(network, container_id);
    let comment = comment(network, container_id);
    let v = IpVersion::V4;

    match fw.new_chain(v, NAT, &chain) {
        Ok(()) => {}
        Err(FirewallError::AlreadyExists(_)) => {}
        Err(e) => return Err(e),
    }

    let to = snat_ip.to_string();
    fw.append_unique(
        v,
        NAT,
        &chain,
        &rule(&["-d", MULTICAST, "-j", "RETURN", "-m", "comment", "--comment", &comment]),
    )?;
    fw.append_unique(
        v,
        NAT,
        &chain,
        &rule(&["-j", "SNAT", "--to-source", &to, "-m", "comment", "--comment", &comment]),
    )?;
    fw.append_unique(v, NAT, POSTROUTING, &jump_rule(ip, &chain, &comment))?;

    info!("SNAT {} -> {} via {}", ip, snat_ip, chain);
    Ok(())
}

/// Remove every jump into the pod's chain and the chain itself. Works
/// without knowing the pod address, so it still cleans up after the pod
/// link is gone.
pub fn snat4_del(fw: &dyn Firewall, network: &str, container_id: &str) -> Result<(), FirewallError> {
    let chain = chain_name(network, container_id);
    let v = IpVersion::V4;

    let targets = fw.list_targets(v, NAT, POSTROUTING)?;
    // Highest number first so earlier numbers stay valid.
    for (idx, target) in targets.iter().enumerate().rev() {
        if *target != chain {
            continue;
        }
        match fw.delete_at(v, NAT, POSTROUTING, idx + 1) {
            Ok(()) => debug!("removed POSTROUTING rule {} -> {}", idx + 1, chain),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    match fw.delete_chain(v, NAT, &chain) {
        Ok(()) => {
            info!("removed SNAT chain {}", chain);
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Verify the jump for `ip` is in place.
pub fn snat4_check(
    fw: &dyn Firewall,
    network: &str,
    container_id: &str,
    ip: IpAddr,
) -> Result<(), CheckError> {
    let chain = chain_name(network, container_id);
    let comment = comment(network, container_id);
    let v = IpVersion::V4;

    if !fw.chain_exists(v, NAT, &chain)? {
        return Err(CheckError::MissingSnat { ip, chain });
    }
    if !fw.exists(v, NAT, POSTROUTING, &jump_rule(ip, &chain, &comment))? {
        return Err(CheckError::MissingSnat { ip, chain });
    }
    Ok(())
}
