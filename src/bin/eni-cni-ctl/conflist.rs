//! The network configuration list written by `generate`.

use serde::Serialize;
use std::net::Ipv4Addr;

use eni_cni::config::IpVersion;
use eni_cni::types::CNI_VERSION;

/// Link-local range the egress interface draws from.
pub const EGRESS_SUBNET: &str = "169.254.172.0/22";

#[derive(Debug, Serialize)]
pub struct ConfList {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    pub plugins: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub name: String,
    pub mtu: Option<u32>,
    pub snat_ip: Option<Ipv4Addr>,
    pub ip_version: IpVersion,
}

pub fn generate(opts: &Options) -> ConfList {
    let mut ptp = serde_json::json!({
        "type": "imds-ptp",
        "ipam": {
            "type": "imds-ipam",
            "ipVersion": opts.ip_version,
        },
    });
    if let Some(mtu) = opts.mtu {
        ptp["mtu"] = mtu.into();
    }

    let mut egress = serde_json::json!({
        "type": "egress-v4",
        "ipam": {
            "type": "host-local",
            "ranges": [[{"subnet": EGRESS_SUBNET}]],
            "routes": [{"dst": "0.0.0.0/0"}],
        },
    });
    if let Some(mtu) = opts.mtu {
        egress["mtu"] = mtu.into();
    }
    if let Some(ip) = opts.snat_ip {
        egress["snatIP"] = ip.to_string().into();
    }

    ConfList {
        cni_version: CNI_VERSION.to_string(),
        name: opts.name.clone(),
        plugins: vec![ptp, egress],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eni_cni::config::{EgressNetConf, PtpNetConf};

    fn opts() -> Options {
        Options {
            name: "pods".into(),
            mtu: Some(9001),
            snat_ip: Some(Ipv4Addr::new(198, 51, 100, 10)),
            ip_version: IpVersion::V6,
        }
    }

    /// Each entry, with the list's name and version folded in, is what
    /// the runtime hands the plugin on stdin.
    fn as_plugin_conf(list: &ConfList, i: usize) -> Vec<u8> {
        let mut conf = list.plugins[i].clone();
        conf["name"] = list.name.clone().into();
        conf["cniVersion"] = list.cni_version.clone().into();
        serde_json::to_vec(&conf).unwrap()
    }

    #[test]
    fn chains_ptp_then_egress() {
        let list = generate(&opts());
        let types: Vec<_> = list.plugins.iter().map(|p| p["type"].clone()).collect();
        assert_eq!(types, vec!["imds-ptp", "egress-v4"]);

        let ptp = PtpNetConf::parse(&as_plugin_conf(&list, 0)).unwrap();
        assert_eq!(ptp.mtu, Some(9001));
        let ipam = ptp.net.ipam().unwrap();
        assert_eq!(ipam.ipam_type, "imds-ipam");
        assert_eq!(ipam.ip_version, IpVersion::V6);

        let egress = EgressNetConf::parse(&as_plugin_conf(&list, 1)).unwrap();
        assert_eq!(egress.snat_ip, Some(Ipv4Addr::new(198, 51, 100, 10)));
        assert_eq!(egress.if_name, "nat0");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let list = generate(&Options {
            mtu: None,
            snat_ip: None,
            ..opts()
        });
        assert!(list.plugins[0].get("mtu").is_none());
        assert!(list.plugins[1].get("snatIP").is_none());
    }
}
