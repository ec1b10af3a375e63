//! On-disk form of the ledger.
//!
//! The store is a JSON object keyed by ticker, each value the ordered list of every
//! [`BotTrade`] ever placed for that ticker (closed ones included). Writes go to a
//! sibling temp file and are renamed over the primary; the previous primary is copied
//! to `<file>.backup.<timestamp>` first. Loading falls back to backups newest-first.
//! A corrupt primary is moved to `<file>.corrupt.<timestamp>`. Until that copy is retired
//! (backup recovery, a recorded buy, or an operator clear), every load reports
//! [`LoadSource::Unrecoverable`].

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{BotTrade, Side};

pub type LedgerMap = BTreeMap<String, Vec<BotTrade>>;

const BACKUP_TAG: &str = ".backup.";
const CORRUPT_TAG: &str = ".corrupt.";
const RETIRED_TAG: &str = ".corrupt-cleared.";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid ledger: {0}")]
    Invalid(String),

    #[error("duplicate order id {0}")]
    DuplicateOrder(String),

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("unknown order id {0}")]
    UnknownOrder(String),
}

/// Where the loaded ledger came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// No store and no backups: first run.
    Fresh,
    Primary,
    /// Primary missing or invalid; recovered from this backup.
    Backup(PathBuf),
    /// Primary invalid (now or on an earlier load) and no usable backup. The ledger
    /// starts in safe mode.
    Unrecoverable,
}

impl LoadSource {
    pub fn requires_safe_mode(&self) -> bool {
        matches!(self, LoadSource::Unrecoverable)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
    backup_keep: usize,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>, backup_keep: usize) -> Self {
        Self {
            path: path.into(),
            backup_keep: backup_keep.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the store with `trades`, backing up the previous version.
    pub fn save(&self, trades: &LedgerMap) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        if self.path.exists() {
            let backup = self.sibling(BACKUP_TAG);
            fs::copy(&self.path, &backup)?;
        }

        let tmp = self.path.with_file_name(format!("{}.tmp", self.file_name()));
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, trades)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        self.prune_backups()?;

        debug!(
            path = %self.path.display(),
            tickers = trades.len(),
            "Saved ledger"
        );
        Ok(())
    }

    /// Load the primary store, falling back to the newest valid backup.
    pub fn load(&self) -> Result<(LedgerMap, LoadSource), LedgerError> {
        let backups = self.backups()?;
        let corrupt = self.corrupt_copies()?;

        if self.path.exists() {
            match read_validated(&self.path) {
                Ok(trades) if corrupt.is_empty() => {
                    info!(
                        path = %self.path.display(),
                        tickers = trades.len(),
                        "Loaded ledger"
                    );
                    return Ok((trades, LoadSource::Primary));
                }
                Ok(trades) => {
                    warn!(
                        path = %self.path.display(),
                        corrupt = corrupt.len(),
                        "Loaded ledger written during safe mode, corrupt copies still unacknowledged"
                    );
                    return Ok((trades, LoadSource::Unrecoverable));
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Ledger store is corrupt");
                    let aside = self.sibling(CORRUPT_TAG);
                    fs::rename(&self.path, &aside)?;
                    warn!(moved_to = %aside.display(), "Moved corrupt ledger aside");
                }
            }
        } else if backups.is_empty() && corrupt.is_empty() {
            info!(path = %self.path.display(), "No ledger store found, starting fresh");
            return Ok((LedgerMap::new(), LoadSource::Fresh));
        } else {
            warn!(
                path = %self.path.display(),
                backups = backups.len(),
                corrupt = corrupt.len(),
                "Ledger store missing"
            );
        }

        for backup in backups.iter().rev() {
            match read_validated(backup) {
                Ok(trades) => {
                    warn!(backup = %backup.display(), "Recovered ledger from backup");
                    self.retire_corrupt_copies()?;
                    return Ok((trades, LoadSource::Backup(backup.clone())));
                }
                Err(e) => {
                    warn!(backup = %backup.display(), error = %e, "Skipping invalid backup");
                }
            }
        }

        warn!(path = %self.path.display(), "No valid ledger backup, starting empty in safe mode");
        Ok((LedgerMap::new(), LoadSource::Unrecoverable))
    }

    /// Mark every corrupt copy as handled so later loads stop reporting
    /// [`LoadSource::Unrecoverable`]. The files are renamed, never deleted.
    pub fn retire_corrupt_copies(&self) -> Result<usize, LedgerError> {
        let corrupt = self.corrupt_copies()?;
        for path in &corrupt {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let retired = path.with_file_name(name.replacen(CORRUPT_TAG, RETIRED_TAG, 1));
            fs::rename(path, &retired)?;
            info!(from = %path.display(), to = %retired.display(), "Retired corrupt ledger copy");
        }
        Ok(corrupt.len())
    }

    /// Backup files, oldest first.
    pub fn backups(&self) -> Result<Vec<PathBuf>, LedgerError> {
        self.tagged(BACKUP_TAG)
    }

    /// Corrupt primaries moved aside by earlier loads, oldest first.
    pub fn corrupt_copies(&self) -> Result<Vec<PathBuf>, LedgerError> {
        self.tagged(CORRUPT_TAG)
    }

    fn tagged(&self, tag: &str) -> Result<Vec<PathBuf>, LedgerError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}{}", self.file_name(), tag);
        let mut found: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect();
        // Timestamps are fixed-width, so lexical order is chronological.
        found.sort();
        Ok(found)
    }

    fn prune_backups(&self) -> Result<(), LedgerError> {
        let backups = self.backups()?;
        if backups.len() > self.backup_keep {
            for old in &backups[..backups.len() - self.backup_keep] {
                fs::remove_file(old)?;
                debug!(backup = %old.display(), "Pruned ledger backup");
            }
        }
        Ok(())
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ledger.json".into())
    }

    fn sibling(&self, tag: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        self.path
            .with_file_name(format!("{}{}{}", self.file_name(), tag, stamp))
    }
}

fn read_validated(path: &Path) -> Result<LedgerMap, LedgerError> {
    let reader = BufReader::new(File::open(path)?);
    let trades: LedgerMap = serde_json::from_reader(reader)?;
    validate(&trades)?;
    Ok(trades)
}

/// Structural checks a hand-edited store must still pass.
pub fn validate(trades: &LedgerMap) -> Result<(), LedgerError> {
    let mut seen = HashSet::new();
    for (ticker, entries) in trades {
        for t in entries {
            let at = || format!("{ticker}/{}", t.order_id);
            if t.order_id.trim().is_empty() {
                return Err(LedgerError::Invalid(format!("{ticker}: empty order id")));
            }
            if &t.ticker != ticker {
                return Err(LedgerError::Invalid(format!(
                    "{}: filed under {ticker} but ticker is {}",
                    at(),
                    t.ticker
                )));
            }
            if !seen.insert(t.order_id.as_str()) {
                return Err(LedgerError::Invalid(format!("{}: duplicate order id", at())));
            }
            if t.quantity <= Decimal::ZERO {
                return Err(LedgerError::Invalid(format!("{}: quantity {}", at(), t.quantity)));
            }
            if t.remaining_quantity < Decimal::ZERO || t.remaining_quantity > t.quantity {
                return Err(LedgerError::Invalid(format!(
                    "{}: remaining {} outside 0..={}",
                    at(),
                    t.remaining_quantity,
                    t.quantity
                )));
            }
            match t.action {
                Side::Buy if t.is_closed != t.remaining_quantity.is_zero() => {
                    return Err(LedgerError::Invalid(format!(
                        "{}: is_closed={} with remaining {}",
                        at(),
                        t.is_closed,
                        t.remaining_quantity
                    )));
                }
                Side::Sell if !t.remaining_quantity.is_zero() => {
                    return Err(LedgerError::Invalid(format!(
                        "{}: sell with remaining quantity",
                        at()
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeStatus;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn temp_store(keep: usize) -> (TempDir, LedgerStore) {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::new(dir.path().join("bot_trades.json"), keep);
        (dir, store)
    }

    fn sample() -> LedgerMap {
        let mut map = LedgerMap::new();
        map.insert(
            "AAPL".into(),
            vec![BotTrade::open_buy("o-1", "AAPL", dec!(4), dec!(190), TradeStatus::Filled, None, None)],
        );
        map
    }

    #[test]
    fn test_missing_store_is_fresh() {
        let (_dir, store) = temp_store(3);
        let (trades, source) = store.load().unwrap();
        assert!(trades.is_empty());
        assert_eq!(source, LoadSource::Fresh);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = temp_store(3);
        let map = sample();
        store.save(&map).unwrap();
        let (loaded, source) = store.load().unwrap();
        assert_eq!(source, LoadSource::Primary);
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_backup_written_before_rewrite_and_pruned() {
        let (_dir, store) = temp_store(2);
        for _ in 0..5 {
            store.save(&sample()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let backups = store.backups().unwrap();
        assert_eq!(backups.len(), 2);
    }

    #[test]
    fn test_corrupt_primary_recovers_from_backup() {
        let (_dir, store) = temp_store(3);
        let map = sample();
        store.save(&map).unwrap();
        store.save(&map).unwrap();
        fs::write(store.path(), "{ not json").unwrap();

        let (loaded, source) = store.load().unwrap();
        assert!(matches!(source, LoadSource::Backup(_)));
        assert_eq!(loaded, map);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_corrupt_primary_without_backup_is_unrecoverable() {
        let (_dir, store) = temp_store(3);
        fs::write(store.path(), "[]").unwrap();
        let (loaded, source) = store.load().unwrap();
        assert!(loaded.is_empty());
        assert!(source.requires_safe_mode());
    }

    #[test]
    fn test_unrecoverable_survives_restart_until_retired() {
        let (_dir, store) = temp_store(3);
        fs::write(store.path(), "garbage").unwrap();
        assert_eq!(store.load().unwrap().1, LoadSource::Unrecoverable);

        // The corrupt primary was moved aside; reloading must not look like a first run.
        assert!(!store.path().exists());
        assert_eq!(store.corrupt_copies().unwrap().len(), 1);
        assert_eq!(store.load().unwrap().1, LoadSource::Unrecoverable);

        // A save alone does not acknowledge the corruption.
        let saved = sample();
        store.save(&saved).unwrap();
        let (loaded, source) = store.load().unwrap();
        assert_eq!(source, LoadSource::Unrecoverable);
        assert_eq!(loaded, saved);

        assert_eq!(store.retire_corrupt_copies().unwrap(), 1);
        assert_eq!(store.load().unwrap().1, LoadSource::Primary);
    }

    #[test]
    fn test_backup_recovery_retires_corrupt_copy() {
        let (_dir, store) = temp_store(3);
        store.save(&sample()).unwrap();
        store.save(&sample()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();

        assert!(matches!(store.load().unwrap().1, LoadSource::Backup(_)));
        assert!(store.corrupt_copies().unwrap().is_empty());
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap().1, LoadSource::Primary);
    }

    #[test]
    fn test_validation_rejects_bad_remaining() {
        let mut map = sample();
        map.get_mut("AAPL").unwrap()[0].remaining_quantity = dec!(5);
        assert!(matches!(validate(&map), Err(LedgerError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_misfiled_ticker() {
        let mut map = sample();
        let entries = map.remove("AAPL").unwrap();
        map.insert("MSFT".into(), entries);
        assert!(validate(&map).is_err());
    }

    #[test]
    fn test_validation_rejects_duplicate_ids() {
        let mut map = sample();
        let dup = map["AAPL"][0].clone();
        map.get_mut("AAPL").unwrap().push(dup);
        assert!(validate(&map).is_err());
    }

    #[test]
    fn test_structurally_valid_hand_edit_loads() {
        let (_dir, store) = temp_store(3);
        let raw = r#"{
          "GOOGL": [{
            "order_id": "manual-1", "ticker": "GOOGL", "action": "BUY",
            "quantity": "5", "remaining_quantity": "5", "price": "140.5",
            "status": "filled", "is_closed": false, "sl_pct": null, "tp_pct": null,
            "opened_at": "2025-03-01T14:00:00Z"
          }]
        }"#;
        fs::write(store.path(), raw).unwrap();
        let (loaded, source) = store.load().unwrap();
        assert_eq!(source, LoadSource::Primary);
        assert_eq!(loaded["GOOGL"][0].remaining_quantity, dec!(5));
    }
}
