//! JSON snapshots of the in-memory tables

use crate::memory::{MemoryStore, Tables};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot format error: {0}")]
    Format(#[from] serde_json::Error),
}

impl From<SnapshotError> for bidloop_core::BidError {
    fn from(e: SnapshotError) -> Self {
        bidloop_core::BidError::Storage(e.to_string())
    }
}

impl MemoryStore {
    /// Write every table to `path`, replacing it atomically
    pub fn save_snapshot(&self, path: &Path) -> Result<(), SnapshotError> {
        let bytes = {
            let tables = self.tables.read();
            serde_json::to_vec_pretty(&*tables)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), bytes = bytes.len(), "Snapshot written");
        Ok(())
    }

    /// Load a snapshot written by [`MemoryStore::save_snapshot`]
    pub fn load_snapshot(path: &Path) -> Result<Self, SnapshotError> {
        let bytes = fs::read(path)?;
        let tables: Tables = serde_json::from_slice(&bytes)?;
        info!(
            path = %path.display(),
            cycles = tables.cycles.len(),
            accounts = tables.accounts.len(),
            "Snapshot loaded"
        );
        Ok(Self::from_tables(tables))
    }

    /// Load `path` if it exists, otherwise start empty
    pub fn open(path: &Path) -> Result<Self, SnapshotError> {
        if path.exists() {
            Self::load_snapshot(path)
        } else {
            info!(path = %path.display(), "No snapshot found, starting with an empty store");
            Ok(Self::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::*;
    use bidloop_core::prelude::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_restores_balances_and_cycles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("bidloop.json");

        let store = MemoryStore::new();
        let user = UserId::new("alice");
        store
            .create_account(Account {
                user_id: user.clone(),
                balance: dec!(123.45),
                payout_address: Some("0xfeed".into()),
                created_at: Utc::now(),
            })
            .unwrap();
        let now = Utc::now();
        let cycle = store
            .insert_cycle(Cycle {
                id: CycleId::new(),
                index: 3,
                date: now.date_naive(),
                capacity: 10,
                filled: 4,
                status: CycleStatus::Open,
                open_time: now,
                close_time: None,
                growth: GrowthConfig::default(),
                created_at: now,
            })
            .unwrap();
        store.save_snapshot(&path).unwrap();

        let restored = MemoryStore::open(&path).unwrap();
        assert_eq!(restored.balance(&user).unwrap(), dec!(123.45));
        assert_eq!(restored.cycle(&cycle.id).unwrap(), cycle);
        assert_eq!(restored.open_cycle().map(|c| c.id), Some(cycle.id));
    }

    #[test]
    fn test_processing_transfer_requeued_after_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bidloop.json");
        let before = Utc::now() - chrono::Duration::minutes(1);

        let store = MemoryStore::new();
        let t = PendingTransfer::new("treasury", "0xabc", dec!(5), TransferKind::Return, "p1", before);
        let id = t.id;
        store.enqueue_transfer(t).unwrap();
        assert_eq!(store.claim_pending(10, before).len(), 1);
        store.save_snapshot(&path).unwrap();

        let restored = MemoryStore::open(&path).unwrap();
        assert!(restored.claim_pending(10, Utc::now()).is_empty());
        let now = Utc::now();
        assert_eq!(restored.requeue_stale(now, now), 1);
        assert_eq!(restored.transfer(&id).unwrap().retry_count, 0);
        assert_eq!(restored.claim_pending(10, now).len(), 1);
    }

    #[test]
    fn test_open_missing_snapshot_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(&dir.path().join("missing.json")).unwrap();
        assert_eq!(store.cycle_counts().total, 0);
    }
}
