use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Kernel tunables under `/proc/sys`, keyed by path, e.g.
/// `net/ipv4/conf/eth0/rp_filter`.
pub trait Sysctl: Send + Sync {
    fn set(&self, key: &str, value: &str) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ProcSys {
    root: PathBuf,
}

impl Default for ProcSys {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc/sys"),
        }
    }
}

impl ProcSys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Sysctl for ProcSys {
    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let path = self.root.join(key);
        debug!("sysctl {}={}", key, value);
        fs::write(&path, value).map_err(|e| io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySysctl {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySysctl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

impl Sysctl for MemorySysctl {
    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
