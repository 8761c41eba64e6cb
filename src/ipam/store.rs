use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::net::IpAddr;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use super::checkpoint::JsonFile;
use crate::config::IpVersion;
use crate::netlink::version_of;

const STORE_FILE: &str = "data.json";
const LOCK_FILE: &str = "lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IP {0} is already allocated")]
    AlreadyReserved(IpAddr),
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to lock {path}: {source}")]
    Lock { path: PathBuf, source: io::Error },
    #[error("failed to load reservations from {path}: {source}")]
    Load { path: PathBuf, source: io::Error },
    #[error("failed to save reservations to {path}: {source}")]
    Save { path: PathBuf, source: io::Error },
}

/// One reservation. Persisted as `{"id", "ifname", "ip"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreRow {
    pub id: String,
    pub ifname: String,
    pub ip: IpAddr,
}

/// Reservation store for one network, locked for as long as it is open.
///
/// Rows are an unordered flat list; lookups are linear. Changes are
/// persisted by [`Store::close`]. Dropping an open store releases the
/// lock and discards changes.
#[derive(Debug)]
pub struct Store {
    dir: PathBuf,
    rows: Vec<StoreRow>,
    file: JsonFile,
    _lock: File,
}

impl Store {
    /// Take the exclusive lock on `dir` (blocking until any other holder
    /// closes) and load the persisted rows.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|source| StoreError::CreateDir {
                path: dir.clone(),
                source,
            })?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = lock_exclusive(&lock_path).map_err(|source| StoreError::Lock {
            path: lock_path.clone(),
            source,
        })?;

        let file = JsonFile::new(dir.join(STORE_FILE));
        let rows = file
            .restore::<Vec<StoreRow>>()
            .map_err(|source| StoreError::Load {
                path: file.path().to_path_buf(),
                source,
            })?
            .unwrap_or_default();
        debug!("opened store {} with {} reservations", dir.display(), rows.len());

        Ok(Self {
            dir,
            rows,
            file,
            _lock: lock,
        })
    }

    /// Persist and release the lock.
    pub fn close(self) -> Result<(), StoreError> {
        self.file
            .checkpoint(&self.rows)
            .map_err(|source| StoreError::Save {
                path: self.file.path().to_path_buf(),
                source,
            })
        // Lock released when `self._lock` drops.
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rows(&self) -> &[StoreRow] {
        &self.rows
    }

    /// Record `ip` for `(id, ifname)`. Fails if anyone holds `ip` already.
    pub fn reserve(&mut self, id: &str, ifname: &str, ip: IpAddr) -> Result<(), StoreError> {
        if self.rows.iter().any(|row| row.ip == ip) {
            return Err(StoreError::AlreadyReserved(ip));
        }
        self.rows.push(StoreRow {
            id: id.to_string(),
            ifname: ifname.to_string(),
            ip,
        });
        Ok(())
    }

    /// First address held by `(id, ifname)`, of either family.
    pub fn find_by_id(&self, id: &str, ifname: &str) -> Option<IpAddr> {
        self.rows
            .iter()
            .find(|row| row.id == id && row.ifname == ifname)
            .map(|row| row.ip)
    }

    /// Address of family `version` held by `(id, ifname)`.
    pub fn find(&self, id: &str, ifname: &str, version: IpVersion) -> Option<IpAddr> {
        self.rows
            .iter()
            .find(|row| {
                row.id == id && row.ifname == ifname && version_of(&row.ip) == version
            })
            .map(|row| row.ip)
    }

    /// Drop every reservation of `(id, ifname)`; returns what was held.
    /// Releasing an unknown tuple is a no-op.
    pub fn release(&mut self, id: &str, ifname: &str) -> Vec<IpAddr> {
        let mut released = Vec::new();
        self.rows.retain(|row| {
            let hit = row.id == id && row.ifname == ifname;
            if hit {
                released.push(row.ip);
            }
            !hit
        });
        released
    }

    /// Drop the single row binding `ip` to `(id, ifname)`.
    pub fn release_ip(&mut self, id: &str, ifname: &str, ip: IpAddr) -> bool {
        let before = self.rows.len();
        self.rows
            .retain(|row| !(row.id == id && row.ifname == ifname && row.ip == ip));
        self.rows.len() != before
    }
}

fn lock_exclusive(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(io::Error::from)?;
    Ok(file)
}

/// Remove a network's store directory entirely.
pub fn destroy(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn reserve_rejects_duplicate_ip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path().join("net")).unwrap();
        store.reserve("p1", "eth0", ip("10.0.0.6")).unwrap();
        let err = store.reserve("p2", "eth0", ip("10.0.0.6")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyReserved(_)));
        assert_eq!(store.rows().len(), 1);
    }

    #[test]
    fn release_unknown_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        store.reserve("p1", "eth0", ip("10.0.0.6")).unwrap();
        assert!(store.release("p9", "eth0").is_empty());
        assert!(store.release("p1", "eth1").is_empty());
        assert_eq!(store.rows().len(), 1);
        assert_eq!(store.release("p1", "eth0"), vec![ip("10.0.0.6")]);
        assert!(store.release("p1", "eth0").is_empty());
    }

    #[test]
    fn dual_stack_tuple_is_found_per_family_and_released_whole() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        store.reserve("p1", "eth0", ip("10.0.0.6")).unwrap();
        store.reserve("p1", "eth0", ip("2001:db8::6")).unwrap();
        store.reserve("p2", "eth0", ip("10.0.0.7")).unwrap();

        assert_eq!(store.find("p1", "eth0", IpVersion::V4), Some(ip("10.0.0.6")));
        assert_eq!(store.find("p1", "eth0", IpVersion::V6), Some(ip("2001:db8::6")));
        assert_eq!(store.find("p2", "eth0", IpVersion::V6), None);

        assert!(store.release_ip("p1", "eth0", ip("2001:db8::6")));
        assert!(!store.release_ip("p1", "eth0", ip("2001:db8::6")));
        store.reserve("p1", "eth0", ip("2001:db8::9")).unwrap();

        let mut released = store.release("p1", "eth0");
        released.sort();
        assert_eq!(released, vec![ip("10.0.0.6"), ip("2001:db8::9")]);
        assert_eq!(store.rows().len(), 1);
    }

    #[test]
    fn reload_yields_same_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        store.reserve("p1", "eth0", ip("10.0.0.6")).unwrap();
        store.reserve("p2", "eth0", ip("10.0.0.7")).unwrap();
        store.reserve("p3", "nat0", ip("2001:db8::7")).unwrap();
        store.release("p1", "eth0");
        let before: HashSet<_> = store.rows().iter().cloned().collect();
        store.close().unwrap();

        let store = Store::open(dir.path()).unwrap();
        let after: HashSet<_> = store.rows().iter().cloned().collect();
        assert_eq!(before, after);
        assert_eq!(store.find_by_id("p2", "eth0"), Some(ip("10.0.0.7")));
    }

    #[test]
    fn drop_without_close_discards() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = Store::open(dir.path()).unwrap();
            store.reserve("p1", "eth0", ip("10.0.0.6")).unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert!(store.rows().is_empty());
    }

    #[test]
    fn persisted_format_is_flat_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        store.reserve("p1", "eth0", ip("10.0.0.6")).unwrap();
        store.close().unwrap();

        let raw = fs::read_to_string(dir.path().join("data.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!([{"id": "p1", "ifname": "eth0", "ip": "10.0.0.6"}])
        );
        assert!(dir.path().join("lock").exists());
    }
}
