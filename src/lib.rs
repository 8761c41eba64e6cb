//! ENI-aware CNI plugins for EC2 hosts.
//!
//! - `imds-ipam` hands out secondary addresses of attached ENIs, read from
//!   the instance metadata service, and keeps reservations on disk.
//! - `imds-ptp` wires a pod to the host with a veth pair and routes its
//!   traffic out of the ENI that owns its address.
//! - `egress-v4` gives IPv6-only pods IPv4 egress through a hidden,
//!   SNATed interface.

pub mod commands;
pub mod config;
pub mod firewall;
pub mod ipam;
pub mod logging;
pub mod metadata;
pub mod netlink;
pub mod netns;
pub mod plugin;
pub mod sysctl;
pub mod types;

pub use commands::{run_cni, CniPlugin};
pub use config::NetConf;
pub use plugin::{EgressV4, ImdsIpam, ImdsPtp};
