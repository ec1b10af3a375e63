use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::AlertMessage;

/// Where raw alerts come from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Messages received at or after `since`, oldest first. Inclusive so that
    /// messages sharing the watermark's timestamp are not lost; the caller
    /// skips the ids it already handled.
    async fn fetch_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<AlertMessage>>;
}

/// Reads alerts dropped as `*.json` files (`{subject, body, received_at}`) into a directory.
/// A message without an `id` is identified by its file name.
///
/// Files are never deleted; the watermark keeps them from being processed twice.
#[derive(Debug, Clone)]
pub struct SpoolDirSource {
    dir: PathBuf,
}

impl SpoolDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl MessageSource for SpoolDirSource {
    async fn fetch_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<AlertMessage>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || read_spool(&dir, since))
            .await
            .context("spool reader task panicked")?
    }
}

fn read_spool(dir: &Path, since: DateTime<Utc>) -> anyhow::Result<Vec<AlertMessage>> {
    if !dir.exists() {
        tracing::debug!(dir = %dir.display(), "Spool directory missing, nothing to fetch");
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading spool directory {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut messages = Vec::new();
    for file in files {
        let raw = match fs::read_to_string(&file) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "Unreadable alert file, skipping");
                continue;
            }
        };
        match serde_json::from_str::<AlertMessage>(&raw) {
            Ok(mut msg) if msg.received_at >= since => {
                if msg.id.is_empty() {
                    msg.id = file
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                }
                messages.push(msg);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "Malformed alert file, skipping");
            }
        }
    }

    // Stable sort keeps file-name order for equal timestamps.
    messages.sort_by_key(|m| m.received_at);
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn write(dir: &std::path::Path, name: &str, value: serde_json::Value) {
        fs::write(dir.join(name), value.to_string()).unwrap();
    }

    #[tokio::test]
    async fn test_fetch_since_orders_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.json", json!({"subject": "s2", "body": "b2", "received_at": "2025-03-02T10:00:00Z"}));
        write(dir.path(), "a.json", json!({"subject": "s1", "body": "b1", "received_at": "2025-03-01T10:00:00Z"}));
        write(dir.path(), "c.json", json!({"subject": "s0", "body": "b0", "received_at": "2025-02-01T10:00:00Z"}));
        fs::write(dir.path().join("broken.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = SpoolDirSource::new(dir.path());
        let since = Utc.with_ymd_and_hms(2025, 2, 15, 0, 0, 0).unwrap();
        let msgs = source.fetch_since(since).await.unwrap();

        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].subject, "s1");
        assert_eq!(msgs[1].subject, "s2");
    }

    #[tokio::test]
    async fn test_fetch_includes_watermark_instant_and_assigns_ids() {
        let dir = tempfile::tempdir().unwrap();
        let at = "2025-06-02T14:00:00Z";
        write(dir.path(), "1.json", json!({"subject": "first", "body": "b", "received_at": at}));
        write(dir.path(), "2.json", json!({"id": "<m2@mail>", "subject": "second", "body": "b", "received_at": at}));

        let since = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap();
        let msgs = SpoolDirSource::new(dir.path()).fetch_since(since).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].id, "1.json");
        assert_eq!(msgs[1].id, "<m2@mail>");
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let source = SpoolDirSource::new("/definitely/not/here");
        let msgs = source.fetch_since(Utc::now()).await.unwrap();
        assert!(msgs.is_empty());
    }
}
