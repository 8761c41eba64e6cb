//! Running the IPAM plugin named in the network configuration.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::types::{CmdArgs, ErrorResult, Result as CniResult};

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("failed to find plugin {plugin:?} in path {path:?}")]
    NotFound { plugin: String, path: String },
    #[error("failed to run {}: {source}", .binary.display())]
    Spawn { binary: PathBuf, source: io::Error },
    /// The delegate ran and reported an error object.
    #[error("{plugin}: {}", .error.msg)]
    Plugin { plugin: String, error: ErrorResult },
    #[error("{plugin} exited with {status} and no error object")]
    Exit { plugin: String, status: String },
    #[error("failed to decode {plugin} result: {source}")]
    Decode {
        plugin: String,
        source: serde_json::Error,
    },
}

/// Delegated IPAM, called with the invoking plugin's own arguments.
#[async_trait(?Send)]
pub trait IpamDelegate {
    async fn add(&self, plugin: &str, args: &CmdArgs) -> Result<CniResult, DelegateError>;
    async fn check(&self, plugin: &str, args: &CmdArgs) -> Result<(), DelegateError>;
    async fn del(&self, plugin: &str, args: &CmdArgs) -> Result<(), DelegateError>;
}

/// Executes the IPAM binary found in `CNI_PATH`.
#[derive(Debug, Clone, Default)]
pub struct ExecIpam;

impl ExecIpam {
    pub fn new() -> Self {
        Self
    }

    async fn exec(
        &self,
        command: &str,
        plugin: &str,
        args: &CmdArgs,
    ) -> Result<Vec<u8>, DelegateError> {
        let binary = find_in_path(plugin, &args.path).ok_or_else(|| DelegateError::NotFound {
            plugin: plugin.to_string(),
            path: args.path.clone(),
        })?;
        debug!("delegating {} to {}", command, binary.display());

        let spawn_err = |source| DelegateError::Spawn {
            binary: binary.clone(),
            source,
        };

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &args.container_id)
            .env("CNI_NETNS", &args.netns)
            .env("CNI_IFNAME", &args.ifname)
            .env("CNI_PATH", &args.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_err)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&args.stdin_data).await.map_err(spawn_err)?;
        }
        let output = child.wait_with_output().await.map_err(spawn_err)?;

        if output.status.success() {
            return Ok(output.stdout);
        }
        match serde_json::from_slice::<ErrorResult>(&output.stdout) {
            Ok(error) => Err(DelegateError::Plugin {
                plugin: plugin.to_string(),
                error,
            }),
            Err(_) => Err(DelegateError::Exit {
                plugin: plugin.to_string(),
                status: output.status.to_string(),
            }),
        }
    }
}

/// First executable called `plugin` in the colon-separated `path`.
/// Plugin names are bare; anything with a separator is refused.
pub fn find_in_path(plugin: &str, path: &str) -> Option<PathBuf> {
    if plugin.is_empty() || plugin.contains('/') {
        return None;
    }
    path.split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(plugin))
        .find(|candidate| candidate.is_file())
}

#[async_trait(?Send)]
impl IpamDelegate for ExecIpam {
    async fn add(&self, plugin: &str, args: &CmdArgs) -> Result<CniResult, DelegateError> {
        let stdout = self.exec("ADD", plugin, args).await?;
        serde_json::from_slice(&stdout).map_err(|source| DelegateError::Decode {
            plugin: plugin.to_string(),
            source,
        })
    }

    async fn check(&self, plugin: &str, args: &CmdArgs) -> Result<(), DelegateError> {
        self.exec("CHECK", plugin, args).await.map(drop)
    }

    async fn del(&self, plugin: &str, args: &CmdArgs) -> Result<(), DelegateError> {
        self.exec("DEL", plugin, args).await.map(drop)
    }
}
