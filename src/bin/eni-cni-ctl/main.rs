use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{info, warn};

use eni_cni::config::{IpVersion, DEFAULT_DATA_DIR};
use eni_cni::ipam::{destroy, Store};
use eni_cni::logging;
use eni_cni::metadata::{ImdsClient, ImdsConfig, Metadata, MetadataError};
use eni_cni::plugin::routing::eni_table;

mod conflist;

/// Inspect and manage the state of the ENI CNI plugins
#[derive(Parser)]
#[command(name = "eni-cni-ctl", author, version, about)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List address reservations of a network
    Reservations {
        #[arg(long, default_value = DEFAULT_DATA_DIR)]
        data_dir: PathBuf,

        /// Network name
        #[arg(long)]
        network: String,
    },

    /// Release the address held by one container interface
    Release {
        #[arg(long, default_value = DEFAULT_DATA_DIR)]
        data_dir: PathBuf,

        #[arg(long)]
        network: String,

        #[arg(long)]
        container_id: String,

        #[arg(long, default_value = "eth0")]
        ifname: String,
    },

    /// Drop every reservation of a network
    Reset {
        #[arg(long, default_value = DEFAULT_DATA_DIR)]
        data_dir: PathBuf,

        #[arg(long)]
        network: String,

        /// Skip confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Show attached ENIs and the route table each one uses
    Enis {
        #[arg(long, default_value = "4", value_parser = parse_ip_version)]
        ip_version: IpVersion,
    },

    /// Generate a network configuration list
    Generate {
        /// Network name
        #[arg(long)]
        name: String,

        /// Interface MTU
        #[arg(long)]
        mtu: Option<u32>,

        /// SNAT address for IPv4 egress
        #[arg(long)]
        snat_ip: Option<Ipv4Addr>,

        #[arg(long, default_value = "4", value_parser = parse_ip_version)]
        ip_version: IpVersion,

        /// Output file path
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn parse_ip_version(s: &str) -> Result<IpVersion, String> {
    match s {
        "4" => Ok(IpVersion::V4),
        "6" => Ok(IpVersion::V6),
        other => Err(format!("expected 4 or 6, got {:?}", other)),
    }
}

fn reservations(data_dir: PathBuf, network: &str) -> Result<()> {
    let dir = data_dir.join(network);
    if !dir.exists() {
        println!("No reservations for network {}", network);
        return Ok(());
    }
    // Read-only: dropping the store releases the lock without saving.
    let store = Store::open(&dir)?;
    let mut rows = store.rows().to_vec();
    rows.sort_by(|a, b| a.ip.cmp(&b.ip));

    println!("Reservations for network {}:", network);
    for row in rows {
        println!("  {:<40} {:<24} {}", row.ip, row.id, row.ifname);
    }
    Ok(())
}

fn release(data_dir: PathBuf, network: &str, container_id: &str, ifname: &str) -> Result<()> {
    let mut store = Store::open(data_dir.join(network))?;
    let released = store.release(container_id, ifname);
    store.close()?;
    if released.is_empty() {
        println!("Nothing reserved for {}/{}", container_id, ifname);
    }
    for ip in released {
        println!("Released {} held by {}/{}", ip, container_id, ifname);
    }
    Ok(())
}

fn reset(data_dir: PathBuf, network: &str, yes: bool) -> Result<()> {
    let dir = data_dir.join(network);
    if !yes {
        println!("This will forget every reservation in {}.", dir.display());
        println!("Continue? [y/N]");

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Reset aborted.");
            return Ok(());
        }
    }
    destroy(&dir).with_context(|| format!("failed to remove {}", dir.display()))?;
    info!("removed reservation store {}", dir.display());
    Ok(())
}

async fn enis(version: IpVersion) -> Result<()> {
    let metadata = Metadata::new(ImdsClient::new(ImdsConfig::from_env())?);
    let primary = metadata.primary_mac().await?;

    println!("Attached ENIs (IPv{}):", version.as_str());
    for mac in metadata.macs().await? {
        let device = metadata.device_number(&mac).await?;
        let subnet = match metadata.subnet(&mac, version).await {
            Ok(s) => s.to_string(),
            Err(MetadataError::NotFound(_)) => "-".to_string(),
            Err(e) => return Err(e.into()),
        };
        let addresses = match metadata.addresses(&mac, version).await {
            Ok(a) => a,
            Err(e) if e.is_not_found() => {
                warn!("no IPv{} addresses on {}", version.as_str(), mac);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let primary_tag = if mac.eq_ignore_ascii_case(&primary) { ", primary" } else { "" };
        println!("  {} (device {}{}):", mac, device, primary_tag);
        println!("    Table: {}", eni_table(device));
        println!("    Subnet: {}", subnet);
        // The first address is the ENI's own; the rest are handed to pods.
        for (i, ip) in addresses.iter().enumerate() {
            let role = if i == 0 { "eni" } else { "pod" };
            println!("    {:<4} {}", role, ip);
        }
    }
    Ok(())
}

fn write_generated(opts: conflist::Options, output: Option<PathBuf>) -> Result<()> {
    let config = conflist::generate(&opts);
    let config_json = serde_json::to_string_pretty(&config)?;

    if let Some(path) = output {
        fs::write(&path, config_json)?;
        println!("Network configuration written to {}", path.display());
    } else {
        println!("{}", config_json);
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Reservations { data_dir, network } => reservations(data_dir, &network),
        Commands::Release {
            data_dir,
            network,
            container_id,
            ifname,
        } => release(data_dir, &network, &container_id, &ifname),
        Commands::Reset {
            data_dir,
            network,
            yes,
        } => reset(data_dir, &network, yes),
        Commands::Enis { ip_version } => enis(ip_version).await,
        Commands::Generate {
            name,
            mtu,
            snat_ip,
            ip_version,
            output,
        } => write_generated(
            conflist::Options {
                name,
                mtu,
                snat_ip,
                ip_version,
            },
            output,
        ),
    }
}
