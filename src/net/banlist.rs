//! Manual ban list, persisted as `banlist.json`.
//!
//! Distinct from discouragement: bans are operator-driven, survive
//! restarts, and have explicit expiry times. A corrupt file is logged and
//! reset, never fatal.

use crate::chain::store::atomic_write;
use crate::errors::StorageError;
use crate::timedata::unix_now;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const BANLIST_FILE: &str = "banlist.json";

#[derive(Serialize, Deserialize)]
struct BanEntry {
    addr: String,
    banned_until: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct BanFile {
    bans: Vec<BanEntry>,
}

pub struct BanList {
    path: PathBuf,
    entries: HashMap<IpAddr, u64>,
}

impl BanList {
    /// Load from the datadir; corruption is recoverable (fresh list).
    pub fn load(datadir: &Path) -> Self {
        let path = datadir.join(BANLIST_FILE);
        let entries = match Self::read_file(&path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "ban list unreadable; starting with an empty one");
                HashMap::new()
            }
        };
        Self { path, entries }
    }

    fn read_file(path: &Path) -> Result<HashMap<IpAddr, u64>, StorageError> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(StorageError::CorruptBanlist(e.to_string())),
        };
        let file: BanFile = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::CorruptBanlist(e.to_string()))?;
        let mut entries = HashMap::new();
        for entry in file.bans {
            let ip: IpAddr = entry
                .addr
                .parse()
                .map_err(|_| StorageError::CorruptBanlist(format!("bad address {}", entry.addr)))?;
            entries.insert(ip, entry.banned_until);
        }
        Ok(entries)
    }

    pub fn save(&self) -> Result<(), StorageError> {
        let file = BanFile {
            bans: self
                .entries
                .iter()
                .map(|(ip, until)| BanEntry {
                    addr: ip.to_string(),
                    banned_until: *until,
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| StorageError::CorruptBanlist(e.to_string()))?;
        atomic_write(&self.path, &bytes)?;
        Ok(())
    }

    pub fn ban(&mut self, ip: IpAddr, duration_secs: u64) {
        self.entries.insert(ip, unix_now() + duration_secs);
    }

    pub fn unban(&mut self, ip: &IpAddr) -> bool {
        self.entries.remove(ip).is_some()
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        match self.entries.get(ip) {
            Some(&until) => until > unix_now(),
            None => false,
        }
    }

    pub fn prune_expired(&mut self) {
        let now = unix_now();
        self.entries.retain(|_, &mut until| until > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = BanList::load(dir.path());
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        list.ban(ip, 3600);
        assert!(list.is_banned(&ip));
        list.save().unwrap();

        let restored = BanList::load(dir.path());
        assert!(restored.is_banned(&ip));
    }

    #[test]
    fn expired_bans_do_not_apply() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = BanList::load(dir.path());
        let ip: IpAddr = "203.0.113.8".parse().unwrap();
        list.ban(ip, 0);
        assert!(!list.is_banned(&ip));
        list.prune_expired();
        assert!(list.is_empty());
    }

    #[test]
    fn corrupt_file_resets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BANLIST_FILE), b"{{{{").unwrap();
        let list = BanList::load(dir.path());
        assert!(list.is_empty());
    }

    #[test]
    fn unban_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = BanList::load(dir.path());
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        list.ban(ip, 3600);
        assert!(list.unban(&ip));
        assert!(!list.is_banned(&ip));
        assert!(!list.unban(&ip));
    }
}
