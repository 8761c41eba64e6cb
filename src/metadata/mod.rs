//! Instance metadata access.
//!
//! [`MetadataSource`] is the raw key/value primitive. [`ImdsClient`] talks
//! to the instance metadata service with bounded retries, [`MetadataSnapshot`]
//! memoises values so that a multi-field decision sees one consistent view,
//! and [`Metadata`] layers typed accessors on top of any source.

mod imds;
mod snapshot;

pub use imds::{ImdsClient, ImdsConfig};
pub use snapshot::MetadataSnapshot;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

use crate::config::IpVersion;

#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    /// The key does not exist (yet). Newly attached interfaces show up
    /// here until the metadata service catches up.
    #[error("metadata key {0} not found")]
    NotFound(String),
    #[error("metadata request for {path} failed: {message}")]
    Request { path: String, message: String },
    #[error("metadata request for {path} returned HTTP {status}")]
    Status { path: String, status: u16 },
    #[error("invalid metadata value for {path}: {message}")]
    Parse { path: String, message: String },
}

impl MetadataError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound(_))
    }
}

/// Raw metadata lookup. `path` is relative to `latest/meta-data/`.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn get(&self, path: &str) -> Result<String, MetadataError>;
}

#[async_trait]
impl<S: MetadataSource + ?Sized> MetadataSource for Box<S> {
    async fn get(&self, path: &str) -> Result<String, MetadataError> {
        (**self).get(path).await
    }
}

/// Fixed key/value source.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    values: HashMap<String, String>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(path.into(), value.into());
        self
    }

    /// Describe one attached interface. `ips[0]` is its primary address.
    pub fn add_interface(
        &mut self,
        mac: &str,
        device_number: u32,
        subnet: &str,
        ips: &[&str],
    ) -> &mut Self {
        let base = format!("network/interfaces/macs/{mac}");
        let mut macs = self
            .values
            .get("network/interfaces/macs")
            .cloned()
            .unwrap_or_default();
        macs.push_str(&format!("{mac}/\n"));
        self.values.insert("network/interfaces/macs".into(), macs);
        if !self.values.contains_key("mac") {
            self.values.insert("mac".into(), mac.to_string());
        }
        self.insert(format!("{base}/device-number"), device_number.to_string());
        self.insert(format!("{base}/interface-id"), format!("eni-{device_number:08x}"));
        let v6 = subnet.contains(':');
        if v6 {
            self.insert(format!("{base}/subnet-ipv6-cidr-blocks"), subnet);
            self.insert(format!("{base}/ipv6s"), ips.join("\n"));
        } else {
            self.insert(format!("{base}/subnet-ipv4-cidr-block"), subnet);
            self.insert(format!("{base}/local-ipv4s"), ips.join("\n"));
        }
        self
    }
}

#[async_trait]
impl MetadataSource for StaticMetadata {
    async fn get(&self, path: &str) -> Result<String, MetadataError> {
        self.values
            .get(path.trim_end_matches('/'))
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(path.to_string()))
    }
}

/// Metadata over a boxed source, as the plugins hold it.
pub type DynMetadata = Metadata<Box<dyn MetadataSource>>;

/// Typed accessors over a [`MetadataSource`].
pub struct Metadata<S> {
    source: S,
}

impl DynMetadata {
    /// Erase the source type.
    pub fn boxed(source: impl MetadataSource + 'static) -> Self {
        let source: Box<dyn MetadataSource> = Box::new(source);
        Self { source }
    }
}

impl<S: MetadataSource> Metadata<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    async fn get_string(&self, path: &str) -> Result<String, MetadataError> {
        Ok(self.source.get(path).await?.trim().to_string())
    }

    async fn get_lines(&self, path: &str) -> Result<Vec<String>, MetadataError> {
        let raw = self.source.get(path).await?;
        Ok(raw
            .split_whitespace()
            .map(|l| l.trim_end_matches('/').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn get_parsed<T>(&self, path: &str) -> Result<T, MetadataError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.get_string(path).await?;
        raw.parse().map_err(|e: T::Err| MetadataError::Parse {
            path: path.to_string(),
            message: format!("{raw:?}: {e}"),
        })
    }

    async fn get_parsed_lines<T>(&self, path: &str) -> Result<Vec<T>, MetadataError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get_lines(path)
            .await?
            .into_iter()
            .map(|l| {
                l.parse().map_err(|e: T::Err| MetadataError::Parse {
                    path: path.to_string(),
                    message: format!("{l:?}: {e}"),
                })
            })
            .collect()
    }

    pub async fn instance_id(&self) -> Result<String, MetadataError> {
        self.get_string("instance-id").await
    }

    pub async fn instance_type(&self) -> Result<String, MetadataError> {
        self.get_string("instance-type").await
    }

    /// MAC of the primary interface.
    pub async fn primary_mac(&self) -> Result<String, MetadataError> {
        self.get_string("mac").await
    }

    /// MACs of all attached interfaces.
    pub async fn macs(&self) -> Result<Vec<String>, MetadataError> {
        self.get_lines("network/interfaces/macs").await
    }

    pub async fn device_number(&self, mac: &str) -> Result<u32, MetadataError> {
        self.get_parsed(&format!("network/interfaces/macs/{mac}/device-number"))
            .await
    }

    pub async fn interface_id(&self, mac: &str) -> Result<String, MetadataError> {
        self.get_string(&format!("network/interfaces/macs/{mac}/interface-id"))
            .await
    }

    pub async fn security_group_ids(&self, mac: &str) -> Result<Vec<String>, MetadataError> {
        self.get_lines(&format!(
            "network/interfaces/macs/{mac}/security-group-ids"
        ))
        .await
    }

    pub async fn subnet_id(&self, mac: &str) -> Result<String, MetadataError> {
        self.get_string(&format!("network/interfaces/macs/{mac}/subnet-id"))
            .await
    }

    /// IPv4 addresses of an interface, primary first.
    pub async fn local_ipv4s(&self, mac: &str) -> Result<Vec<IpAddr>, MetadataError> {
        self.get_parsed_lines(&format!("network/interfaces/macs/{mac}/local-ipv4s"))
            .await
    }

    /// IPv6 addresses of an interface. An interface without IPv6 has no
    /// such key, which is reported as an empty list.
    pub async fn ipv6s(&self, mac: &str) -> Result<Vec<IpAddr>, MetadataError> {
        match self
            .get_parsed_lines(&format!("network/interfaces/macs/{mac}/ipv6s"))
            .await
        {
            Err(MetadataError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    pub async fn subnet_ipv4_cidr(&self, mac: &str) -> Result<IpNetwork, MetadataError> {
        self.get_parsed(&format!(
            "network/interfaces/macs/{mac}/subnet-ipv4-cidr-block"
        ))
        .await
    }

    /// First IPv6 CIDR block of the interface's subnet.
    pub async fn subnet_ipv6_cidr(&self, mac: &str) -> Result<IpNetwork, MetadataError> {
        let path = format!("network/interfaces/macs/{mac}/subnet-ipv6-cidr-blocks");
        self.get_parsed_lines::<IpNetwork>(&path)
            .await?
            .into_iter()
            .next()
            .ok_or(MetadataError::NotFound(path))
    }

    pub async fn addresses(
        &self,
        mac: &str,
        version: IpVersion,
    ) -> Result<Vec<IpAddr>, MetadataError> {
        match version {
            IpVersion::V4 => self.local_ipv4s(mac).await,
            IpVersion::V6 => self.ipv6s(mac).await,
        }
    }

    pub async fn subnet(&self, mac: &str, version: IpVersion) -> Result<IpNetwork, MetadataError> {
        match version {
            IpVersion::V4 => self.subnet_ipv4_cidr(mac).await,
            IpVersion::V6 => self.subnet_ipv6_cidr(mac).await,
        }
    }
}
