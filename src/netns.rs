//! Running kernel operations inside another network namespace.
//!
//! `setns` only affects the calling thread, so everything here assumes the
//! caller stays on one OS thread (the plugins use a current-thread
//! runtime). Child processes spawned while switched inherit the namespace.

use ipnetwork::IpNetwork;
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::net::IpAddr;
use std::os::unix::io::AsRawFd;
use tracing::trace;

use crate::config::IpVersion;
use crate::netlink::{Address, Link, NetError, NetOps, Route, Rule, Scope};

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// An open handle on a network namespace.
#[derive(Debug)]
pub struct NetNs {
    file: File,
    path: String,
}

impl NetNs {
    pub fn open(path: &str) -> Result<Self, NetError> {
        let file = File::open(path).map_err(|e| NetError::Namespace {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run `f` with the calling thread switched into this namespace, then
    /// switch back. Failing to switch back is reported even if `f`
    /// succeeded; the thread would otherwise be left in the pod.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> Result<T, NetError> {
        let origin = NetNs::open(THREAD_NETNS)?;
        self.enter()?;
        trace!("entered {}", self.path);
        let out = f();
        origin.enter()?;
        trace!("left {}", self.path);
        Ok(out)
    }

    fn enter(&self) -> Result<(), NetError> {
        setns(self.file.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| NetError::Namespace {
            path: self.path.clone(),
            message: format!("setns: {}", e),
        })
    }
}

/// [`NetOps`] that runs every call of `inner` inside `ns`.
#[derive(Debug)]
pub struct NsNet<N> {
    ns: NetNs,
    inner: N,
}

impl<N: NetOps> NsNet<N> {
    pub fn new(ns: NetNs, inner: N) -> Self {
        Self { ns, inner }
    }

    fn call<T>(&self, f: impl FnOnce(&N) -> Result<T, NetError>) -> Result<T, NetError> {
        self.ns.run(|| f(&self.inner))?
    }
}

impl<N: NetOps> NetOps for NsNet<N> {
    fn enter(&self, netns_path: &str) -> Result<Box<dyn NetOps>, NetError> {
        self.inner.enter(netns_path)
    }

    fn links(&self) -> Result<Vec<Link>, NetError> {
        self.call(|n| n.links())
    }

    fn link_by_name(&self, name: &str) -> Result<Option<Link>, NetError> {
        self.call(|n| n.link_by_name(name))
    }

    fn add_veth(&self, name: &str, peer: &str, mtu: Option<u32>) -> Result<(), NetError> {
        self.call(|n| n.add_veth(name, peer, mtu))
    }

    fn move_link(&self, name: &str, netns_path: &str) -> Result<(), NetError> {
        self.call(|n| n.move_link(name, netns_path))
    }

    fn rename_link(&self, name: &str, new_name: &str) -> Result<(), NetError> {
        self.call(|n| n.rename_link(name, new_name))
    }

    fn set_link_up(&self, name: &str) -> Result<(), NetError> {
        self.call(|n| n.set_link_up(name))
    }

    fn set_link_mtu(&self, name: &str, mtu: u32) -> Result<(), NetError> {
        self.call(|n| n.set_link_mtu(name, mtu))
    }

    fn delete_link(&self, name: &str) -> Result<(), NetError> {
        self.call(|n| n.delete_link(name))
    }

    fn addresses(&self, dev: &str) -> Result<Vec<Address>, NetError> {
        self.call(|n| n.addresses(dev))
    }

    fn add_address(&self, dev: &str, addr: IpNetwork, scope: Scope) -> Result<(), NetError> {
        self.call(|n| n.add_address(dev, addr, scope))
    }

    fn routes(
        &self,
        version: IpVersion,
        table: Option<u32>,
        dev: Option<&str>,
    ) -> Result<Vec<Route>, NetError> {
        self.call(|n| n.routes(version, table, dev))
    }

    fn add_route(&self, route: &Route) -> Result<(), NetError> {
        self.call(|n| n.add_route(route))
    }

    fn replace_route(&self, route: &Route) -> Result<(), NetError> {
        self.call(|n| n.replace_route(route))
    }

    fn delete_route(&self, route: &Route) -> Result<(), NetError> {
        self.call(|n| n.delete_route(route))
    }

    fn rules(&self, version: IpVersion) -> Result<Vec<Rule>, NetError> {
        self.call(|n| n.rules(version))
    }

    fn add_rule(&self, rule: &Rule) -> Result<(), NetError> {
        self.call(|n| n.add_rule(rule))
    }

    fn delete_rule(&self, rule: &Rule) -> Result<(), NetError> {
        self.call(|n| n.delete_rule(rule))
    }

    fn announce(&self, dev: &str, ip: IpAddr) -> Result<(), NetError> {
        self.call(|n| n.announce(dev, ip))
    }
}
