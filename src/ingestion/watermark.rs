use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::models::AlertMessage;

/// Position in the message stream: the newest `received_at` handled plus the
/// ids already handled at exactly that instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub last_processed: DateTime<Utc>,
    #[serde(default)]
    pub seen_at_mark: Vec<String>,
}

impl Watermark {
    pub fn at(last_processed: DateTime<Utc>) -> Self {
        Self {
            last_processed,
            seen_at_mark: Vec::new(),
        }
    }

    /// True when `msg` has not been handled yet.
    pub fn admits(&self, msg: &AlertMessage) -> bool {
        msg.received_at > self.last_processed
            || (msg.received_at == self.last_processed && !self.seen_at_mark.contains(&msg.id))
    }

    /// Record `msg` as handled. Messages are fed oldest first.
    pub fn advance(&mut self, msg: &AlertMessage) {
        if msg.received_at > self.last_processed {
            self.last_processed = msg.received_at;
            self.seen_at_mark.clear();
        }
        if msg.received_at == self.last_processed && !self.seen_at_mark.contains(&msg.id) {
            self.seen_at_mark.push(msg.id.clone());
        }
    }
}

/// Persisted [`Watermark`] of the message source.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Start of the deployment; used when no marker exists yet.
    pub fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Missing or unreadable markers fall back to [`WatermarkStore::origin`].
    pub fn load(&self) -> Watermark {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => {
                tracing::info!(path = %self.path.display(), "No watermark found, starting from origin");
                return Watermark::at(Self::origin());
            }
        };
        match serde_json::from_str::<Watermark>(&raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Corrupt watermark, starting from origin");
                Watermark::at(Self::origin())
            }
        }
    }

    /// Write via temp file + rename.
    pub fn save(&self, mark: &Watermark) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, mark)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing watermark {}", self.path.display()))?;
        tracing::debug!(
            last_processed = %mark.last_processed,
            seen = mark.seen_at_mark.len(),
            "Watermark advanced"
        );
        Ok(())
    }
}
