//! Kernel link, address, route and rule access.
//!
//! Everything the plugins do to kernel networking state goes through
//! [`NetOps`]. [`IpCommand`] drives the real kernel via iproute2;
//! [`MemoryNet`] is a small in-memory model with the same "already
//! exists" / "not found" behaviour.

mod ip;
mod memory;

pub use ip::IpCommand;
pub use memory::MemoryNet;

use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

use crate::config::IpVersion;

/// Main routing table id.
pub const TABLE_MAIN: u32 = libc::RT_TABLE_MAIN as u32;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("{0}: already exists")]
    AlreadyExists(String),
    #[error("{0}: not found")]
    NotFound(String),
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("failed to parse output of `{command}`: {message}")]
    Parse { command: String, message: String },
    #[error("network namespace {path}: {message}")]
    Namespace { path: String, message: String },
}

impl NetError {
    pub fn is_exists(&self) -> bool {
        matches!(self, NetError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NetError::NotFound(_))
    }
}

/// Swallow the benign outcomes of idempotent construction and teardown.
pub trait Tolerate {
    fn ignore_exists(self) -> Result<(), NetError>;
    fn ignore_missing(self) -> Result<(), NetError>;
}

impl Tolerate for Result<(), NetError> {
    fn ignore_exists(self) -> Result<(), NetError> {
        match self {
            Err(e) if e.is_exists() => Ok(()),
            other => other,
        }
    }

    fn ignore_missing(self) -> Result<(), NetError> {
        match self {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Scope {
    #[default]
    Universe,
    Site,
    Link,
    Host,
    Nowhere,
}

impl Scope {
    /// iproute2 spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Universe => "global",
            Scope::Site => "site",
            Scope::Link => "link",
            Scope::Host => "host",
            Scope::Nowhere => "nowhere",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "link" => Scope::Link,
            "host" => Scope::Host,
            "site" => Scope::Site,
            "nowhere" => Scope::Nowhere,
            _ => Scope::Universe,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: Option<String>,
    pub mtu: u32,
    pub up: bool,
    /// `linkinfo` kind, e.g. `veth`; `None` for physical devices
    pub kind: Option<String>,
}

impl Link {
    pub fn is_veth(&self) -> bool {
        self.kind.as_deref() == Some("veth")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub network: IpNetwork,
    pub scope: Scope,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub dst: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub dev: String,
    /// `None` means the main table
    pub table: Option<u32>,
    pub scope: Scope,
    pub src: Option<IpAddr>,
}

impl Route {
    pub fn new(dst: IpNetwork, dev: impl Into<String>) -> Self {
        Self {
            dst,
            gateway: None,
            dev: dev.into(),
            table: None,
            scope: Scope::Universe,
            src: None,
        }
    }

    /// Default route for `version` out of `dev`.
    pub fn default_via(version: IpVersion, gateway: IpAddr, dev: impl Into<String>) -> Self {
        Self::new(default_network(version), dev).via(gateway)
    }

    pub fn via(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn table(mut self, table: u32) -> Self {
        self.table = Some(table);
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn src(mut self, src: IpAddr) -> Self {
        self.src = Some(src);
        self
    }

    pub fn table_id(&self) -> u32 {
        self.table.unwrap_or(TABLE_MAIN)
    }

    pub fn is_default(&self) -> bool {
        self.dst.prefix() == 0
    }

    pub fn version(&self) -> IpVersion {
        version_of(&self.dst.ip())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dst)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        write!(f, " dev {} table {}", self.dev, self.table_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub priority: u32,
    pub version: IpVersion,
    pub src: Option<IpNetwork>,
    /// `(mark, mask)`
    pub mark: Option<(u32, u32)>,
    pub table: u32,
}

impl Rule {
    pub fn new(version: IpVersion, priority: u32, table: u32) -> Self {
        Self {
            priority,
            version,
            src: None,
            mark: None,
            table,
        }
    }

    pub fn from_src(mut self, src: IpNetwork) -> Self {
        self.src = Some(src);
        self
    }

    pub fn fwmark(mut self, mark: u32, mask: u32) -> Self {
        self.mark = Some((mark, mask));
        self
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.priority)?;
        if let Some(src) = self.src {
            write!(f, " from {}", src)?;
        }
        if let Some((mark, mask)) = self.mark {
            write!(f, " fwmark {:#x}/{:#x}", mark, mask)?;
        }
        write!(f, " lookup {}", self.table)
    }
}

pub fn version_of(ip: &IpAddr) -> IpVersion {
    match ip {
        IpAddr::V4(_) => IpVersion::V4,
        IpAddr::V6(_) => IpVersion::V6,
    }
}

/// `0.0.0.0/0` or `::/0`.
pub fn default_network(version: IpVersion) -> IpNetwork {
    match version {
        IpVersion::V4 => IpNetwork::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
        IpVersion::V6 => IpNetwork::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
    }
    .expect("zero prefix is always valid")
}

/// `/32` or `/128` network holding exactly `ip`.
pub fn host_network(ip: IpAddr) -> IpNetwork {
    IpNetwork::from(ip)
}

/// Network address of `net` with the prefix kept, e.g. `10.0.1.0/24`.
pub fn masked(net: IpNetwork) -> IpNetwork {
    IpNetwork::new(net.network(), net.prefix()).unwrap_or(net)
}

/// Kernel networking operations, scoped to one network namespace.
///
/// Creation returns [`NetError::AlreadyExists`] and removal returns
/// [`NetError::NotFound`] so callers can decide what is benign.
pub trait NetOps: Send + Sync {
    /// Operations on the namespace mounted at `netns_path`.
    fn enter(&self, netns_path: &str) -> Result<Box<dyn NetOps>, NetError>;

    fn links(&self) -> Result<Vec<Link>, NetError>;

    fn link_by_name(&self, name: &str) -> Result<Option<Link>, NetError> {
        Ok(self.links()?.into_iter().find(|l| l.name == name))
    }

    fn link_by_mac(&self, mac: &str) -> Result<Option<Link>, NetError> {
        Ok(self.links()?.into_iter().find(|l| {
            l.mac
                .as_deref()
                .is_some_and(|m| m.eq_ignore_ascii_case(mac))
        }))
    }

    /// Create a veth pair in this namespace.
    fn add_veth(&self, name: &str, peer: &str, mtu: Option<u32>) -> Result<(), NetError>;
    /// Move a link into the namespace mounted at `netns_path`.
    fn move_link(&self, name: &str, netns_path: &str) -> Result<(), NetError>;
    fn rename_link(&self, name: &str, new_name: &str) -> Result<(), NetError>;
    fn set_link_up(&self, name: &str) -> Result<(), NetError>;
    fn set_link_mtu(&self, name: &str, mtu: u32) -> Result<(), NetError>;
    fn delete_link(&self, name: &str) -> Result<(), NetError>;

    fn addresses(&self, dev: &str) -> Result<Vec<Address>, NetError>;
    fn add_address(&self, dev: &str, addr: IpNetwork, scope: Scope) -> Result<(), NetError>;

    /// Routes of one family, optionally restricted to a table and device.
    fn routes(
        &self,
        version: IpVersion,
        table: Option<u32>,
        dev: Option<&str>,
    ) -> Result<Vec<Route>, NetError>;
    fn add_route(&self, route: &Route) -> Result<(), NetError>;
    fn replace_route(&self, route: &Route) -> Result<(), NetError>;
    fn delete_route(&self, route: &Route) -> Result<(), NetError>;

    fn rules(&self, version: IpVersion) -> Result<Vec<Rule>, NetError>;
    fn add_rule(&self, rule: &Rule) -> Result<(), NetError>;
    fn delete_rule(&self, rule: &Rule) -> Result<(), NetError>;

    /// Announce `ip` on `dev` with an unsolicited ARP reply.
    fn announce(&self, dev: &str, ip: IpAddr) -> Result<(), NetError>;

    /// Add `rule` unless an identical one is present. The kernel does not
    /// reliably reject duplicate rules, so check first.
    fn ensure_rule(&self, rule: &Rule) -> Result<(), NetError> {
        if self.rules(rule.version)?.iter().any(|r| r == rule) {
            return Ok(());
        }
        self.add_rule(rule).ignore_exists()
    }
}
