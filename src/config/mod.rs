use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Result as CniResult, Route, DNS};

/// Default location of the reservation store.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/cni/imds-ipam";

/// Default name of the hidden egress interface.
pub const DEFAULT_EGRESS_IFNAME: &str = "nat0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse network configuration: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("IPAM config missing 'ipam' key")]
    MissingIpam,
    #[error("must be called as a chained plugin")]
    MissingPrevResult,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Address family requested from IPAM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    #[default]
    #[serde(rename = "4")]
    V4,
    #[serde(rename = "6")]
    V6,
}

impl IpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            IpVersion::V4 => "4",
            IpVersion::V6 => "6",
        }
    }
}

/// Ignore ENIs with device index in `[device_index_start, device_index_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreInterfaceTerm {
    pub device_index_start: u32,
    pub device_index_end: u32,
}

impl IgnoreInterfaceTerm {
    pub fn matches(&self, device_index: u32) -> bool {
        (self.device_index_start..self.device_index_end).contains(&device_index)
    }
}

/// IPAM (IP Address Management) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPAMConfig {
    /// Type of IPAM plugin
    #[serde(rename = "type")]
    pub ipam_type: String,
    /// Directory holding one reservation store per network
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Address family to allocate
    #[serde(default)]
    pub ip_version: IpVersion,
    /// Routes handed back verbatim in the result
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Interfaces never used for allocation
    #[serde(default)]
    pub ignore_interfaces: Vec<IgnoreInterfaceTerm>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

impl IPAMConfig {
    pub fn is_ignored(&self, device_index: u32) -> bool {
        self.ignore_interfaces.iter().any(|t| t.matches(device_index))
    }

    /// Store directory for one network: `<dataDir>/<networkName>`.
    pub fn store_dir(&self, network: &str) -> PathBuf {
        self.data_dir.join(network)
    }
}

/// Fields every plugin configuration carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Name of the network
    #[serde(default)]
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// IPAM configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IPAMConfig>,
    #[serde(default, skip_serializing_if = "DNS::is_empty")]
    pub dns: DNS,
    /// Result of the previous plugin in a chain
    #[serde(rename = "prevResult", default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<CniResult>,
}

impl NetConf {
    pub fn ipam(&self) -> Result<&IPAMConfig, ConfigError> {
        self.ipam.as_ref().ok_or(ConfigError::MissingIpam)
    }

    pub fn prev_result(&self) -> Result<&CniResult, ConfigError> {
        self.prev_result.as_ref().ok_or(ConfigError::MissingPrevResult)
    }

    /// Version to stamp on printed results.
    pub fn result_version(&self) -> &str {
        if self.cni_version.is_empty() {
            crate::types::CNI_VERSION
        } else {
            &self.cni_version
        }
    }
}

/// Configuration of the `imds-ipam` plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpamNetConf {
    #[serde(flatten)]
    pub net: NetConf,
}

impl IpamNetConf {
    /// Parse from bytes; `ipam` is required.
    pub fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        let conf: IpamNetConf = serde_json::from_slice(bytes)?;
        conf.net.ipam()?;
        Ok(conf)
    }
}

/// Configuration of the `imds-ptp` plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtpNetConf {
    #[serde(flatten)]
    pub net: NetConf,
    /// Interface MTU; left untouched when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// Seconds to wait for an IPv6 router advertisement; unset waits forever
    #[serde(
        rename = "ipv6GatewayTimeout",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ipv6_gateway_timeout: Option<u64>,
}

impl PtpNetConf {
    pub fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        let conf: PtpNetConf = serde_json::from_slice(bytes)?;
        conf.net.ipam()?;
        if conf.mtu == Some(0) {
            return Err(ConfigError::Invalid("mtu must be greater than zero".into()));
        }
        Ok(conf)
    }

    pub fn gateway_timeout(&self) -> Option<Duration> {
        self.ipv6_gateway_timeout.map(Duration::from_secs)
    }
}

/// Configuration of the `egress-v4` plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressNetConf {
    #[serde(flatten)]
    pub net: NetConf,
    /// Interface inside the container to create
    #[serde(rename = "ifName", default = "default_egress_ifname")]
    pub if_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// IP to use as SNAT target
    #[serde(rename = "snatIP", default, skip_serializing_if = "Option::is_none")]
    pub snat_ip: Option<Ipv4Addr>,
}

fn default_egress_ifname() -> String {
    DEFAULT_EGRESS_IFNAME.to_string()
}

impl EgressNetConf {
    pub fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        let conf: EgressNetConf = serde_json::from_slice(bytes)?;
        if conf.if_name.is_empty() || conf.if_name.len() > 15 {
            return Err(ConfigError::Invalid(format!(
                "invalid ifName {:?}",
                conf.if_name
            )));
        }
        Ok(conf)
    }
}
