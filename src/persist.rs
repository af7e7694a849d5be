//! Grid persistence
//!
//! Snapshots the ladder and the monetary counters to JSON, atomically
//! (temp file + rename) and behind a write lock so snapshots never
//! interleave. A failed write is retained as a pending-retry record and
//! re-attempted in the next stable phase; a snapshot loaded at startup
//! must reproduce the exact ladder and counters.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::order::{SidePair, Slot};

/// Identity of a grid; a snapshot refuses to load against a different one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridFingerprint {
    pub base_symbol: String,
    pub quote_symbol: String,
    pub min_price: f64,
    pub max_price: f64,
    pub increment_percent: f64,
    pub slot_count: usize,
}

/// Everything needed to reproduce the grid after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub bot_id: Uuid,
    pub saved_at: DateTime<Utc>,
    pub fingerprint: GridFingerprint,
    pub slots: Vec<Slot>,
    pub cache_funds: SidePair<f64>,
    pub fee_debt: f64,
}

impl GridSnapshot {
    pub fn new(
        bot_id: Uuid,
        fingerprint: GridFingerprint,
        slots: Vec<Slot>,
        cache_funds: SidePair<f64>,
        fee_debt: f64,
    ) -> Self {
        Self {
            bot_id,
            saved_at: Utc::now(),
            fingerprint,
            slots,
            cache_funds,
            fee_debt,
        }
    }

    /// Reject a snapshot whose grid parameters do not match the running
    /// configuration.
    pub fn validate_against(&self, fingerprint: &GridFingerprint) -> EngineResult<()> {
        if self.fingerprint != *fingerprint {
            return Err(EngineError::Persistence(format!(
                "snapshot fingerprint {:?} does not match configuration {:?}",
                self.fingerprint, fingerprint
            )));
        }
        Ok(())
    }
}

/// Serialized snapshot writer with a pending-retry slot.
pub struct GridStore {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
    pending_retry: Mutex<Option<GridSnapshot>>,
}

impl GridStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
            pending_retry: Mutex::new(None),
        }
    }

    /// Persist a snapshot atomically. On failure the snapshot is kept as
    /// a pending-retry record for the next stable cycle.
    pub async fn save(&self, snapshot: &GridSnapshot) -> EngineResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        match write_atomic(path, snapshot) {
            Ok(()) => {
                *self.pending_retry.lock().await = None;
                Ok(())
            }
            Err(e) => {
                warn!("snapshot write failed, retry pending: {}", e);
                *self.pending_retry.lock().await = Some(snapshot.clone());
                Err(e)
            }
        }
    }

    /// Re-attempt a previously failed write. Returns true when nothing is
    /// pending anymore.
    pub async fn retry_pending(&self) -> bool {
        let pending = self.pending_retry.lock().await.clone();
        let Some(snapshot) = pending else { return true };
        let Some(path) = &self.path else { return true };

        let _guard = self.write_lock.lock().await;
        match write_atomic(path, &snapshot) {
            Ok(()) => {
                info!("pending snapshot write succeeded");
                *self.pending_retry.lock().await = None;
                true
            }
            Err(e) => {
                warn!("pending snapshot write failed again: {}", e);
                false
            }
        }
    }

    pub async fn has_pending(&self) -> bool {
        self.pending_retry.lock().await.is_some()
    }

    /// Load the last snapshot, if any exists.
    pub fn load(&self) -> EngineResult<Option<GridSnapshot>> {
        let Some(path) = &self.path else { return Ok(None) };
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let snapshot: GridSnapshot = serde_json::from_str(&content)?;
        info!(
            "loaded snapshot {} from {:?}: {} slots, saved {}",
            snapshot.bot_id,
            path,
            snapshot.slots.len(),
            snapshot.saved_at
        );
        Ok(Some(snapshot))
    }
}

fn write_atomic(path: &Path, snapshot: &GridSnapshot) -> EngineResult<()> {
    let content = serde_json::to_string_pretty(snapshot)?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::SlotRole;

    fn fingerprint() -> GridFingerprint {
        GridFingerprint {
            base_symbol: "GOLD".into(),
            quote_symbol: "USD".into(),
            min_price: 0.5,
            max_price: 2.0,
            increment_percent: 5.0,
            slot_count: 3,
        }
    }

    fn snapshot() -> GridSnapshot {
        let mut sell = Slot::new_virtual("sell-0", 1.05, SlotRole::Sell, 10.0);
        sell.mark_partial("1.7.42");
        sell.merge = Some(crate::order::MergeTracker::new(1.25));
        GridSnapshot::new(
            Uuid::new_v4(),
            fingerprint(),
            vec![
                Slot::new_virtual("buy-0", 0.95, SlotRole::Buy, 12.5),
                Slot::new_virtual("spread-0", 1.0, SlotRole::Spread, 0.0),
                sell,
            ],
            SidePair::new(1.5, 2.5),
            0.125,
        )
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("dexgrid-test-{}.json", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let path = temp_path();
        let store = GridStore::new(Some(path.clone()));
        let snap = snapshot();

        store.save(&snap).await.unwrap();
        let loaded = store.load().unwrap().expect("snapshot exists");

        assert_eq!(loaded, snap);
        // merge metadata and chain ids survive the trip
        let sell = loaded.slots.iter().find(|s| s.id == "sell-0").unwrap();
        assert_eq!(sell.chain_id(), Some("1.7.42"));
        assert!((sell.merge.unwrap().merged_size - 1.25).abs() < 1e-12);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let path = temp_path();
        let store = GridStore::new(Some(path.clone()));
        store.save(&snapshot()).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_failed_write_keeps_pending_retry() {
        // a directory that does not exist makes the write fail
        let path = std::env::temp_dir()
            .join(format!("dexgrid-missing-{}", Uuid::new_v4()))
            .join("state.json");
        let store = GridStore::new(Some(path.clone()));

        assert!(store.save(&snapshot()).await.is_err());
        assert!(store.has_pending().await);

        // the directory appears; the stable phase retry succeeds
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        assert!(store.retry_pending().await);
        assert!(!store.has_pending().await);
        assert!(path.exists());

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_fingerprint_mismatch_is_rejected() {
        let snap = snapshot();
        assert!(snap.validate_against(&fingerprint()).is_ok());

        let mut other = fingerprint();
        other.increment_percent = 2.0;
        assert!(snap.validate_against(&other).is_err());
    }

    #[tokio::test]
    async fn test_pathless_store_is_a_noop() {
        let store = GridStore::new(None);
        store.save(&snapshot()).await.unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(store.retry_pending().await);
    }
}
