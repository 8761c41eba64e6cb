use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::net::IpAddr;
use std::process::{Command, Output};
use tracing::debug;

use super::{Address, Link, NetError, NetOps, Route, Rule, Scope, TABLE_MAIN};
use crate::config::IpVersion;
use crate::netns::{NetNs, NsNet};

/// [`NetOps`] backed by the `ip` command, acting on the namespace of
/// the calling thread.
#[derive(Debug, Clone)]
pub struct IpCommand {
    program: String,
}

impl Default for IpCommand {
    fn default() -> Self {
        Self {
            program: "ip".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct JsonLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    linkinfo: Option<JsonLinkInfo>,
}

#[derive(Deserialize)]
struct JsonLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Deserialize)]
struct JsonAddrLink {
    #[serde(default)]
    addr_info: Vec<JsonAddr>,
}

#[derive(Deserialize)]
struct JsonAddr {
    local: IpAddr,
    prefixlen: u8,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct JsonRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<IpAddr>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    prefsrc: Option<IpAddr>,
}

#[derive(Deserialize)]
struct JsonRule {
    priority: u32,
    #[serde(default)]
    src: Option<String>,
    #[serde(default)]
    srclen: Option<u8>,
    #[serde(default)]
    fwmark: Option<String>,
    #[serde(default)]
    fwmask: Option<String>,
    #[serde(default)]
    table: Option<String>,
}

fn family_flag(version: IpVersion) -> &'static str {
    match version {
        IpVersion::V4 => "-4",
        IpVersion::V6 => "-6",
    }
}

fn table_name(table: u32) -> String {
    table.to_string()
}

fn parse_table(name: &str) -> Option<u32> {
    match name {
        "main" => Some(TABLE_MAIN),
        "local" => Some(libc::RT_TABLE_LOCAL as u32),
        "default" => Some(libc::RT_TABLE_DEFAULT as u32),
        other => other.parse().ok(),
    }
}

fn parse_hex(s: &str) -> Option<u32> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn classify(command: String, stderr: &str) -> NetError {
    let stderr = stderr.trim().to_string();
    if stderr.contains("File exists") {
        NetError::AlreadyExists(command)
    } else if stderr.contains("Cannot find device")
        || stderr.contains("does not exist")
        || stderr.contains("No such process")
        || stderr.contains("No such file or directory")
        || stderr.contains("Cannot assign requested address")
    {
        NetError::NotFound(command)
    } else {
        NetError::Command { command, stderr }
    }
}

fn route_args(route: &Route) -> Vec<String> {
    let mut args = vec![route.dst.to_string()];
    if let Some(gw) = route.gateway {
        args.extend(["via".to_string(), gw.to_string()]);
    }
    args.extend(["dev".to_string(), route.dev.clone()]);
    if route.scope != Scope::Universe {
        args.extend(["scope".to_string(), route.scope.as_str().to_string()]);
    }
    if let Some(src) = route.src {
        args.extend(["src".to_string(), src.to_string()]);
    }
    args.extend(["table".to_string(), table_name(route.table_id())]);
    args
}

fn rule_args(rule: &Rule) -> Vec<String> {
    let mut args = vec!["priority".to_string(), rule.priority.to_string()];
    if let Some(src) = rule.src {
        args.extend(["from".to_string(), src.to_string()]);
    }
    if let Some((mark, mask)) = rule.mark {
        args.extend(["fwmark".to_string(), format!("{:#x}/{:#x}", mark, mask)]);
    }
    args.extend(["table".to_string(), table_name(rule.table)]);
    args
}

impl IpCommand {
    pub fn new() -> Self {
        Self::default()
    }

    fn output<S: AsRef<str>>(&self, args: &[S]) -> Result<(String, Output), NetError> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        let command = format!("{} {}", self.program, args.join(" "));
        debug!("{}", command);
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| NetError::Spawn {
                command: command.clone(),
                source,
            })?;
        Ok((command, output))
    }

    fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<(), NetError> {
        let (command, output) = self.output(args)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify(command, &String::from_utf8_lossy(&output.stderr)))
        }
    }

    fn query<T, S>(&self, args: &[S]) -> Result<Vec<T>, NetError>
    where
        T: for<'de> Deserialize<'de>,
        S: AsRef<str>,
    {
        let (command, output) = self.output(args)?;
        if !output.status.success() {
            return Err(classify(command, &String::from_utf8_lossy(&output.stderr)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&stdout).map_err(|e| NetError::Parse {
            command,
            message: e.to_string(),
        })
    }
}

impl From<JsonLink> for Link {
    fn from(l: JsonLink) -> Self {
        Link {
            index: l.ifindex,
            up: l.flags.iter().any(|f| f == "UP"),
            name: l.ifname,
            mac: l.address,
            mtu: l.mtu,
            kind: l.linkinfo.and_then(|i| i.info_kind),
        }
    }
}

impl NetOps for IpCommand {
    fn enter(&self, netns_path: &str) -> Result<Box<dyn NetOps>, NetError> {
        let ns = NetNs::open(netns_path)?;
        Ok(Box::new(NsNet::new(ns, self.clone())))
    }

    fn links(&self) -> Result<Vec<Link>, NetError> {
        let links: Vec<JsonLink> = self.query(&["-j", "-d", "link", "show"])?;
        Ok(links.into_iter().map(Link::from).collect())
    }

    fn link_by_name(&self, name: &str) -> Result<Option<Link>, NetError> {
        match self.query::<JsonLink, _>(&["-j", "-d", "link", "show", "dev", name]) {
            Ok(links) => Ok(links.into_iter().next().map(Link::from)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn add_veth(&self, name: &str, peer: &str, mtu: Option<u32>) -> Result<(), NetError> {
        let mut args = vec!["link", "add", name];
        let mtu = mtu.map(|m| m.to_string());
        if let Some(mtu) = &mtu {
            args.extend(["mtu", mtu.as_str()]);
        }
        args.extend(["type", "veth", "peer", "name", peer]);
        if let Some(mtu) = &mtu {
            args.extend(["mtu", mtu.as_str()]);
        }
        self.run(&args)
    }

    fn move_link(&self, name: &str, netns_path: &str) -> Result<(), NetError> {
        self.run(&["link", "set", "dev", name, "netns", netns_path])
    }

    fn rename_link(&self, name: &str, new_name: &str) -> Result<(), NetError> {
        self.run(&["link", "set", "dev", name, "name", new_name])
    }

    fn set_link_up(&self, name: &str) -> Result<(), NetError> {
        self.run(&["link", "set", "dev", name, "up"])
    }

    fn set_link_mtu(&self, name: &str, mtu: u32) -> Result<(), NetError> {
        self.run(&["link", "set", "dev", name, "mtu", &mtu.to_string()])
    }

    fn delete_link(&self, name: &str) -> Result<(), NetError> {
        self.run(&["link", "del", "dev", name])
    }

    fn addresses(&self, dev: &str) -> Result<Vec<Address>, NetError> {
        let links: Vec<JsonAddrLink> = self.query(&["-j", "addr", "show", "dev", dev])?;
        Ok(links
            .into_iter()
            .flat_map(|l| l.addr_info)
            .filter_map(|a| {
                IpNetwork::new(a.local, a.prefixlen).ok().map(|network| Address {
                    network,
                    scope: Scope::parse(a.scope.as_deref().unwrap_or("global")),
                })
            })
            .collect())
    }

    fn add_address(&self, dev: &str, addr: IpNetwork, scope: Scope) -> Result<(), NetError> {
        let addr = addr.to_string();
        let mut args = vec!["addr", "add", addr.as_str(), "dev", dev, "scope", scope.as_str()];
        if addr.contains(':') {
            // Skip duplicate address detection; these addresses are ours.
            args.push("nodad");
        }
        self.run(&args)
    }

    fn routes(
        &self,
        version: IpVersion,
        table: Option<u32>,
        dev: Option<&str>,
    ) -> Result<Vec<Route>, NetError> {
        let table = table.unwrap_or(TABLE_MAIN);
        let table_arg = table_name(table);
        let mut args = vec!["-j", family_flag(version), "route", "show", "table", &table_arg];
        if let Some(dev) = dev {
            args.extend(["dev", dev]);
        }
        let command = args.join(" ");
        let routes: Vec<JsonRoute> = self.query(&args)?;

        routes
            .into_iter()
            .map(|r| {
                let dst = if r.dst == "default" {
                    super::default_network(version)
                } else {
                    r.dst.parse().map_err(|e: ipnetwork::IpNetworkError| NetError::Parse {
                        command: command.clone(),
                        message: format!("{}: {}", r.dst, e),
                    })?
                };
                Ok(Route {
                    dst,
                    gateway: r.gateway,
                    dev: r.dev.or_else(|| dev.map(str::to_string)).unwrap_or_default(),
                    table: Some(table),
                    scope: Scope::parse(r.scope.as_deref().unwrap_or("global")),
                    src: r.prefsrc,
                })
            })
            .collect()
    }

    fn add_route(&self, route: &Route) -> Result<(), NetError> {
        let mut args = vec![family_flag(route.version()).to_string(), "route".into(), "add".into()];
        args.extend(route_args(route));
        self.run(&args)
    }

    fn replace_route(&self, route: &Route) -> Result<(), NetError> {
        let mut args = vec![
            family_flag(route.version()).to_string(),
            "route".into(),
            "replace".into(),
        ];
        args.extend(route_args(route));
        self.run(&args)
    }

    fn delete_route(&self, route: &Route) -> Result<(), NetError> {
        let mut args = vec![
            family_flag(route.version()).to_string(),
            "route".into(),
            "del".into(),
            route.dst.to_string(),
            "dev".into(),
            route.dev.clone(),
            "table".into(),
            table_name(route.table_id()),
        ];
        if let Some(gw) = route.gateway {
            args.extend(["via".to_string(), gw.to_string()]);
        }
        self.run(&args)
    }

    fn rules(&self, version: IpVersion) -> Result<Vec<Rule>, NetError> {
        let rules: Vec<JsonRule> = self.query(&["-j", family_flag(version), "rule", "show"])?;
        Ok(rules
            .into_iter()
            .filter_map(|r| {
                let table = parse_table(r.table.as_deref()?)?;
                let src = match r.src.as_deref() {
                    None | Some("all") => None,
                    Some(s) => {
                        let ip: IpAddr = s.parse().ok()?;
                        let len = r.srclen.unwrap_or(if ip.is_ipv4() { 32 } else { 128 });
                        Some(IpNetwork::new(ip, len).ok()?)
                    }
                };
                let mark = r.fwmark.as_deref().and_then(|m| {
                    let (mark, mask) = match m.split_once('/') {
                        Some((mark, mask)) => (parse_hex(mark)?, parse_hex(mask)?),
                        None => (
                            parse_hex(m)?,
                            r.fwmask.as_deref().and_then(parse_hex).unwrap_or(u32::MAX),
                        ),
                    };
                    Some((mark, mask))
                });
                Some(Rule {
                    priority: r.priority,
                    version,
                    src,
                    mark,
                    table,
                })
            })
            .collect())
    }

    fn add_rule(&self, rule: &Rule) -> Result<(), NetError> {
        let mut args = vec![family_flag(rule.version).to_string(), "rule".into(), "add".into()];
        args.extend(rule_args(rule));
        self.run(&args)
    }

    fn delete_rule(&self, rule: &Rule) -> Result<(), NetError> {
        let mut args = vec![family_flag(rule.version).to_string(), "rule".into(), "del".into()];
        args.extend(rule_args(rule));
        self.run(&args)
    }

    fn announce(&self, dev: &str, ip: IpAddr) -> Result<(), NetError> {
        let ip = ip.to_string();
        let args = ["-U", "-c", "1", "-I", dev, "-s", ip.as_str(), ip.as_str()];
        let command = format!("arping {}", args.join(" "));
        let output = Command::new("arping")
            .args(args)
            .output()
            .map_err(|source| NetError::Spawn {
                command: command.clone(),
                source,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify(command, &String::from_utf8_lossy(&output.stderr)))
        }
    }
}
