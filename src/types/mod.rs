use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// CNI specification version emitted by these plugins.
pub const CNI_VERSION: &str = "1.0.0";

/// Versions accepted on input and reported by `VERSION`.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// CNI command arguments
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path (may be empty on DEL)
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Arguments
    pub args: HashMap<String, String>,
    /// Path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// Current result format (CNI 1.0.0)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Interfaces created
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
    /// IP configurations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IPConfig>,
    /// Routes to configure
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    /// DNS configuration
    #[serde(default, skip_serializing_if = "DNS::is_empty")]
    pub dns: DNS,
}

/// Interface information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace); absent for host interfaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IPConfig {
    /// Index into `interfaces` this IP is assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: IpNetwork,
    /// Gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

impl IPConfig {
    pub fn is_v4(&self) -> bool {
        self.address.is_ipv4()
    }
}

/// DNS configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DNS {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl DNS {
    /// True when no field is set; such a block is left out of results.
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_none()
            && self.domain.is_none()
            && self.search.is_none()
            && self.options.is_none()
    }
}

/// Route configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: IpNetwork,
    /// Gateway for this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// Error object written to stdout when a command fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default)]
    pub details: String,
}

impl ErrorResult {
    pub fn new(code: u32, msg: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            cni_version: CNI_VERSION.to_string(),
            code,
            msg: msg.into(),
            details: details.into(),
        }
    }

    pub fn print(&self) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(self)?);
        Ok(())
    }
}

/// Reply to the `VERSION` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Default for VersionResult {
    fn default() -> Self {
        Self {
            cni_version: CNI_VERSION.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl Result {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            ..Default::default()
        }
    }

    /// Add an interface to the result, returning its index
    pub fn add_interface(&mut self, interface: Interface) -> usize {
        self.interfaces.push(interface);
        self.interfaces.len() - 1
    }

    /// Add an IP configuration to the result
    pub fn add_ip(&mut self, ip: IPConfig) {
        self.ips.push(ip);
    }

    /// Add a route to the result
    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// Set DNS configuration
    pub fn set_dns(&mut self, dns: DNS) {
        self.dns = dns;
    }

    /// IPv4 addresses carried by this result.
    pub fn v4_ips(&self) -> impl Iterator<Item = &IPConfig> {
        self.ips.iter().filter(|ip| ip.is_v4())
    }

    /// Encode in the format of `cni_version`. Results before 1.0.0 tag
    /// every IP with its family (`"version": "4"` or `"6"`).
    pub fn encode(&self, cni_version: &str) -> serde_json::Result<serde_json::Value> {
        let mut out = self.clone();
        out.cni_version = cni_version.to_string();
        let mut value = serde_json::to_value(&out)?;
        if is_legacy(cni_version) {
            if let Some(ips) = value.get_mut("ips").and_then(|v| v.as_array_mut()) {
                for (json, ip) in ips.iter_mut().zip(&self.ips) {
                    let family = if ip.is_v4() { "4" } else { "6" };
                    json["version"] = family.into();
                }
            }
        }
        Ok(value)
    }

    /// Print result as JSON, stamped with the requested version
    pub fn print(&self, cni_version: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.encode(cni_version)?)?;
        println!("{}", json);
        Ok(())
    }
}

/// 0.x result formats, which carry `ips[].version`.
fn is_legacy(cni_version: &str) -> bool {
    cni_version.starts_with("0.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_legacy_result_with_version_field() {
        let raw = r#"{
            "cniVersion": "0.3.1",
            "ips": [{"version": "4", "address": "192.0.2.27/24"}]
        }"#;
        let result: Result = serde_json::from_str(raw).unwrap();
        assert_eq!(result.ips.len(), 1);
        assert!(result.ips[0].is_v4());
        assert!(result.ips[0].gateway.is_none());
        assert!(result.interfaces.is_empty());
    }

    #[test]
    fn legacy_versions_tag_ip_family() {
        let mut result = Result::new(CNI_VERSION);
        result.add_ip(IPConfig {
            interface: Some(0),
            address: "10.0.0.6/24".parse().unwrap(),
            gateway: None,
        });
        result.add_ip(IPConfig {
            interface: Some(0),
            address: "2001:db8::6/64".parse().unwrap(),
            gateway: None,
        });

        let old = result.encode("0.4.0").unwrap();
        assert_eq!(old["cniVersion"], "0.4.0");
        assert_eq!(old["ips"][0]["version"], "4");
        assert_eq!(old["ips"][1]["version"], "6");
        assert_eq!(old["ips"][0]["interface"], 0);
        assert_eq!(result.encode("0.3.1").unwrap()["ips"][1]["version"], "6");

        let current = result.encode("1.0.0").unwrap();
        assert!(current["ips"][0].get("version").is_none());
    }

    #[test]
    fn empty_sections_are_omitted() {
        let json = serde_json::to_value(Result::new(CNI_VERSION)).unwrap();
        assert_eq!(json, serde_json::json!({"cniVersion": "1.0.0"}));
    }

    #[test]
    fn add_interface_returns_index() {
        let mut result = Result::new(CNI_VERSION);
        let host = result.add_interface(Interface {
            name: "veth0".into(),
            ..Default::default()
        });
        let cont = result.add_interface(Interface {
            name: "eth0".into(),
            sandbox: Some("/var/run/netns/p1".into()),
            ..Default::default()
        });
        assert_eq!((host, cont), (0, 1));
    }
}
