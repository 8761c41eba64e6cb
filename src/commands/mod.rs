//! The CNI exec protocol: environment and stdin in, JSON on stdout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use std::process::ExitCode;
use std::str::FromStr;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::{ConfigError, NetConf};
use crate::ipam::{AllocError, StoreError};
use crate::metadata::MetadataError;
use crate::netlink::NetError;
use crate::plugin::{CheckError, DelegateError, RoutingError};
use crate::types::{CmdArgs, ErrorResult, Result as CniResult, VersionResult, CNI_VERSION};

pub const ERR_INVALID_ENV: u32 = 4;
pub const ERR_IO: u32 = 5;
pub const ERR_DECODE: u32 = 6;
pub const ERR_INVALID_CONFIG: u32 = 7;
pub const ERR_TRY_AGAIN_LATER: u32 = 11;
pub const ERR_GENERIC: u32 = 100;
pub const ERR_EXHAUSTED: u32 = 101;
pub const ERR_INCONSISTENT: u32 = 102;
pub const ERR_METADATA: u32 = 103;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{0} not found in environment")]
    Missing(&'static str),
    #[error("unknown CNI command {0:?}")]
    UnknownCommand(String),
    #[error("failed to read network configuration from stdin: {0}")]
    Stdin(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Check,
    Del,
    Version,
}

impl FromStr for Command {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "CHECK" => Ok(Command::Check),
            "DEL" => Ok(Command::Del),
            "VERSION" => Ok(Command::Version),
            other => Err(EnvError::UnknownCommand(other.to_string())),
        }
    }
}

/// One plugin invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub args: CmdArgs,
    /// Fires when the runtime asks the process to stop.
    pub cancel: CancellationToken,
}

impl Invocation {
    pub fn new(args: CmdArgs) -> Self {
        Self {
            args,
            cancel: CancellationToken::new(),
        }
    }
}

/// A CNI plugin. Implementations return typed errors wrapped in `anyhow`;
/// [`error_code`] maps them onto protocol codes.
#[async_trait(?Send)]
pub trait CniPlugin {
    fn name(&self) -> &'static str;
    async fn add(&self, inv: &Invocation) -> Result<CniResult>;
    async fn check(&self, inv: &Invocation) -> Result<()>;
    async fn del(&self, inv: &Invocation) -> Result<()>;
}

pub fn parse_command() -> Result<Command, EnvError> {
    env::var("CNI_COMMAND")
        .map_err(|_| EnvError::Missing("CNI_COMMAND"))?
        .parse()
}

/// Parse command arguments from the environment and stdin.
pub fn parse_args(command: Command) -> Result<CmdArgs, EnvError> {
    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .map_err(EnvError::Stdin)?;
    parse_args_from(|key| env::var(key).ok(), command, stdin_data)
}

/// `CNI_NETNS` and `CNI_PATH` may be empty on DEL; the namespace may
/// already be gone.
pub fn parse_args_from(
    lookup: impl Fn(&str) -> Option<String>,
    command: Command,
    stdin_data: Vec<u8>,
) -> Result<CmdArgs, EnvError> {
    let required = |key: &'static str| {
        lookup(key)
            .filter(|v| !v.is_empty())
            .ok_or(EnvError::Missing(key))
    };
    let optional_on_del = |key: &'static str| match command {
        Command::Del => Ok(lookup(key).unwrap_or_default()),
        _ => required(key),
    };

    Ok(CmdArgs {
        container_id: required("CNI_CONTAINERID")?,
        netns: optional_on_del("CNI_NETNS")?,
        ifname: required("CNI_IFNAME")?,
        args: parse_cni_args(&lookup("CNI_ARGS").unwrap_or_default()),
        path: optional_on_del("CNI_PATH")?,
        stdin_data,
    })
}

/// Parse `CNI_ARGS` (`K1=V1;K2=V2`) into key-value pairs.
fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Run one command against `plugin`. Only ADD yields a result.
pub async fn dispatch<P: CniPlugin + ?Sized>(
    plugin: &P,
    command: Command,
    inv: &Invocation,
) -> Result<Option<CniResult>> {
    match command {
        Command::Add => plugin.add(inv).await.map(Some),
        Command::Check => plugin.check(inv).await.map(|()| None),
        Command::Del => plugin.del(inv).await.map(|()| None),
        Command::Version => Ok(None),
    }
}

fn metadata_code(e: &MetadataError) -> u32 {
    if e.is_not_found() {
        ERR_TRY_AGAIN_LATER
    } else {
        ERR_METADATA
    }
}

/// Protocol error code for `err`: the first typed error in the chain
/// decides.
pub fn error_code(err: &anyhow::Error) -> u32 {
    for cause in err.chain() {
        if cause.downcast_ref::<EnvError>().is_some() {
            return ERR_INVALID_ENV;
        }
        if let Some(e) = cause.downcast_ref::<ConfigError>() {
            return match e {
                ConfigError::Decode(_) => ERR_DECODE,
                _ => ERR_INVALID_CONFIG,
            };
        }
        if let Some(e) = cause.downcast_ref::<AllocError>() {
            return match e {
                AllocError::Exhausted => ERR_EXHAUSTED,
                AllocError::Metadata(m) => metadata_code(m),
                AllocError::Store(_) => ERR_IO,
                AllocError::Address { .. } => ERR_METADATA,
            };
        }
        if cause.downcast_ref::<StoreError>().is_some() {
            return ERR_IO;
        }
        if let Some(e) = cause.downcast_ref::<MetadataError>() {
            return metadata_code(e);
        }
        if let Some(e) = cause.downcast_ref::<RoutingError>() {
            return match e {
                RoutingError::EniNotFound(_)
                | RoutingError::InterfaceNotFound(_)
                | RoutingError::NoAddresses(_) => ERR_INCONSISTENT,
                RoutingError::Metadata(m) => metadata_code(m),
                RoutingError::Sysctl { .. } => ERR_IO,
                _ => ERR_GENERIC,
            };
        }
        if let Some(e) = cause.downcast_ref::<CheckError>() {
            return match e {
                CheckError::Net(_) | CheckError::Firewall(_) => ERR_GENERIC,
                _ => ERR_INCONSISTENT,
            };
        }
        if let Some(e) = cause.downcast_ref::<DelegateError>() {
            return match e {
                DelegateError::Plugin { error, .. } => error.code,
                DelegateError::Spawn { .. } => ERR_IO,
                DelegateError::Decode { .. } => ERR_DECODE,
                _ => ERR_GENERIC,
            };
        }
        if let Some(NetError::Namespace { .. }) = cause.downcast_ref::<NetError>() {
            return ERR_INCONSISTENT;
        }
        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return ERR_DECODE;
        }
        if cause.downcast_ref::<io::Error>().is_some() {
            return ERR_IO;
        }
    }
    ERR_GENERIC
}

/// Error object for `err`. `msg` is the outermost message, `details` the
/// whole chain.
pub fn error_result(err: &anyhow::Error, cni_version: &str) -> ErrorResult {
    let mut out = ErrorResult::new(error_code(err), err.to_string(), format!("{:#}", err));
    out.cni_version = cni_version.to_string();
    out
}

/// Version to stamp on output, taken leniently from the configuration.
fn requested_version(stdin_data: &[u8]) -> String {
    serde_json::from_slice::<NetConf>(stdin_data)
        .map(|c| c.result_version().to_string())
        .unwrap_or_else(|_| CNI_VERSION.to_string())
}

fn fail(err: anyhow::Error, cni_version: &str) -> ExitCode {
    error!("{:#}", err);
    if let Err(e) = error_result(&err, cni_version).print() {
        error!("failed to write error result: {}", e);
    }
    ExitCode::FAILURE
}

/// Cancel `token` on SIGTERM or SIGINT.
fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received, cancelling"),
            _ = int.recv() => info!("SIGINT received, cancelling"),
        }
        token.cancel();
    });
    Ok(())
}

/// Main entry point for a CNI plugin binary.
///
/// Everything runs on one thread: namespace switches are per thread.
pub fn run_cni<P, F>(build: F) -> ExitCode
where
    P: CniPlugin,
    F: FnOnce() -> Result<P>,
{
    let command = match parse_command() {
        Ok(c) => c,
        Err(e) => return fail(e.into(), CNI_VERSION),
    };
    if command == Command::Version {
        return match serde_json::to_string(&VersionResult::default()) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => fail(e.into(), CNI_VERSION),
        };
    }

    let args = match parse_args(command) {
        Ok(a) => a,
        Err(e) => return fail(e.into(), CNI_VERSION),
    };
    let version = requested_version(&args.stdin_data);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")
    {
        Ok(rt) => rt,
        Err(e) => return fail(e, &version),
    };

    let plugin = match build() {
        Ok(p) => p,
        Err(e) => return fail(e, &version),
    };

    let inv = Invocation::new(args);
    let span = info_span!(
        "cni",
        plugin = plugin.name(),
        container = %inv.args.container_id,
        command = ?command,
    );

    let outcome = runtime.block_on(
        async {
            cancel_on_signal(inv.cancel.clone())?;
            debug!("netns={:?} ifname={}", inv.args.netns, inv.args.ifname);
            dispatch(&plugin, command, &inv).await
        }
        .instrument(span),
    );

    match outcome {
        Ok(Some(result)) => match result.print(&version) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => fail(e, &version),
        },
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => fail(e, &version),
    }
}
