// Drives imds-ptp against the real kernel. Needs root, `ip` and `iptables`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::process::Command;

use eni_cni::commands::{CniPlugin, Invocation};
use eni_cni::metadata::{Metadata, StaticMetadata};
use eni_cni::plugin::veth::host_veth_name;
use eni_cni::plugin::{DelegateError, Host, ImdsPtp, IpamDelegate};
use eni_cni::types::{CmdArgs, IPConfig, Result as CniResult};

const NETNS: &str = "eni-cni-test";
const ENI: &str = "enitest0";
const POD_IP: &str = "10.99.0.11";

struct FixedIpam(CniResult);

#[async_trait(?Send)]
impl IpamDelegate for FixedIpam {
    async fn add(&self, _plugin: &str, _args: &CmdArgs) -> Result<CniResult, DelegateError> {
        Ok(self.0.clone())
    }

    async fn check(&self, _plugin: &str, _args: &CmdArgs) -> Result<(), DelegateError> {
        Ok(())
    }

    async fn del(&self, _plugin: &str, _args: &CmdArgs) -> Result<(), DelegateError> {
        Ok(())
    }
}

fn ip(args: &[&str]) -> Result<String, Box<dyn std::error::Error>> {
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(format!(
            "ip {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(String::from_utf8(output.stdout)?)
}

fn cleanup() {
    let _ = ip(&["netns", "delete", NETNS]);
    let _ = ip(&["link", "delete", ENI]);
    for pref in ["30000", "30010", "30020"] {
        while ip(&["rule", "del", "pref", pref]).is_ok() {}
    }
}

fn invocation(prev: Option<&CniResult>) -> Result<Invocation, Box<dyn std::error::Error>> {
    let mut conf = serde_json::json!({
        "cniVersion": "1.0.0",
        "name": "eni-test",
        "type": "imds-ptp",
        "ipam": {"type": "imds-ipam"},
    });
    if let Some(prev) = prev {
        conf["prevResult"] = serde_json::to_value(prev)?;
    }
    Ok(Invocation::new(CmdArgs {
        container_id: "test-container".to_string(),
        netns: format!("/var/run/netns/{}", NETNS),
        ifname: "eth0".to_string(),
        args: HashMap::new(),
        path: String::new(),
        stdin_data: serde_json::to_vec(&conf)?,
    }))
}

// This test requires root privileges to run
#[tokio::test(flavor = "current_thread")]
#[ignore]
async fn test_ptp_against_kernel() -> Result<(), Box<dyn std::error::Error>> {
    if !nix::unistd::geteuid().is_root() {
        println!("Skipping test_ptp_against_kernel: not running as root");
        return Ok(());
    }
    cleanup();

    // A dummy link stands in for a secondary ENI.
    ip(&["netns", "add", NETNS])?;
    ip(&["link", "add", ENI, "type", "dummy"])?;
    let mac = fs::read_to_string(format!("/sys/class/net/{}/address", ENI))?;
    let mut md = StaticMetadata::new();
    md.add_interface(mac.trim(), 1, "10.99.0.0/24", &["10.99.0.10", POD_IP]);

    let mut allocated = CniResult::new("1.0.0");
    allocated.add_ip(IPConfig {
        interface: None,
        address: format!("{}/24", POD_IP).parse()?,
        gateway: Some("169.254.0.1".parse()?),
    });
    let plugin = ImdsPtp::new(
        Host::system(),
        Box::new(FixedIpam(allocated)),
        Metadata::boxed(md),
    );

    let result = plugin.add(&invocation(None)?).await?;
    println!("CNI result: {:?}", result);
    assert_eq!(result.interfaces.len(), 2);

    let rules = ip(&["-4", "rule", "show"])?;
    assert!(rules.contains(&format!("30020:\tfrom {} lookup 11", POD_IP)));
    let table = ip(&["-4", "route", "show", "table", "11"])?;
    assert!(table.contains("default via 10.99.0.1"));

    plugin.check(&invocation(Some(&result))?).await?;

    plugin.del(&invocation(Some(&result))?).await?;
    let host = host_veth_name("eni-test", "test-container", "eth0");
    assert!(ip(&["link", "show", &host]).is_err());
    assert!(!ip(&["-4", "rule", "show"])?.contains(POD_IP));

    cleanup();
    Ok(())
}
