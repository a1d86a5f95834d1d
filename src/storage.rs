//! Local history of recently viewed runs.
//!
//! There is no server-side list endpoint, so the client keeps its own: a capped,
//! most-recent-first list of run ids plus a cache of each run's last seen status.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::warn;

pub const MAX_RECENT_RUNS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentRun {
    pub run_id: String,
    /// RFC 3339, UTC.
    pub touched_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_status: Option<String>,
}

/// Where the poller reports the runs it has seen.
pub trait RunHistory: Send + Sync {
    /// Upsert `run_id` with the current time and move it to the front.
    fn remember(&self, run_id: &str) -> Result<()>;
    /// Cache the last status seen for `run_id`.
    fn record_status(&self, run_id: &str, status: &str) -> Result<()>;
    /// Most recent first.
    fn list(&self) -> Result<Vec<RecentRun>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default)]
    runs: Vec<RecentRun>,
    #[serde(default)]
    status_cache: BTreeMap<String, String>,
}

impl HistoryFile {
    fn remember(&mut self, run_id: &str, now: String) {
        self.runs.retain(|r| r.run_id != run_id);
        self.runs.insert(
            0,
            RecentRun {
                run_id: run_id.to_string(),
                touched_at: now,
                last_known_status: None,
            },
        );
        self.runs.truncate(MAX_RECENT_RUNS);
        self.prune_cache();
    }

    fn record_status(&mut self, run_id: &str, status: &str) {
        self.status_cache
            .insert(run_id.to_string(), status.to_string());
        self.prune_cache();
    }

    /// Drop cached statuses of runs that fell off the list.
    fn prune_cache(&mut self) {
        let runs = &self.runs;
        self.status_cache
            .retain(|id, _| runs.iter().any(|r| &r.run_id == id));
    }

    fn listing(&self) -> Vec<RecentRun> {
        self.runs
            .iter()
            .map(|r| RecentRun {
                last_known_status: self
                    .status_cache
                    .get(&r.run_id)
                    .cloned()
                    .or_else(|| r.last_known_status.clone()),
                ..r.clone()
            })
            .collect()
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// Default history location: `<data dir>/citylens/recent_runs.json`.
pub fn default_history_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("could not determine data directory")?;
    Ok(base.join("citylens").join("recent_runs.json"))
}

/// History persisted as one JSON document. Writes within the process are serialized.
pub struct FileRunHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRunHistory {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(default_history_path()?))
    }

    /// Unreadable or corrupt files are treated as empty history.
    fn read(&self) -> HistoryFile {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn write(&self, file: &HistoryFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create history dir")?;
        }
        let data = serde_json::to_vec_pretty(file)?;
        fs::write(&self.path, data)
            .with_context(|| format!("write history {}", self.path.display()))?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut HistoryFile)) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;
        let mut file = self.read();
        f(&mut file);
        self.write(&file)
    }
}

impl RunHistory for FileRunHistory {
    fn remember(&self, run_id: &str) -> Result<()> {
        let now = now_rfc3339();
        self.update(|f| f.remember(run_id, now))
    }

    fn record_status(&self, run_id: &str, status: &str) -> Result<()> {
        self.update(|f| f.record_status(run_id, status))
    }

    fn list(&self) -> Result<Vec<RecentRun>> {
        Ok(self.read().listing())
    }
}

/// History that lives only as long as the process.
#[derive(Default)]
pub struct MemoryRunHistory {
    inner: Mutex<HistoryFile>,
}

impl RunHistory for MemoryRunHistory {
    fn remember(&self, run_id: &str) -> Result<()> {
        let mut f = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;
        f.remember(run_id, now_rfc3339());
        Ok(())
    }

    fn record_status(&self, run_id: &str, status: &str) -> Result<()> {
        let mut f = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;
        f.record_status(run_id, status);
        Ok(())
    }

    fn list(&self) -> Result<Vec<RecentRun>> {
        let f = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;
        Ok(f.listing())
    }
}

/// Remember `run_id` and cache `status` on the blocking pool.
/// Failures are logged and never reach the caller.
pub async fn record_seen(history: Arc<dyn RunHistory>, run_id: String, status: Option<String>) {
    let res = tokio::task::spawn_blocking(move || -> Result<()> {
        history
            .remember(&run_id)
            .with_context(|| format!("remember {run_id}"))?;
        if let Some(status) = status {
            history
                .record_status(&run_id, &status)
                .with_context(|| format!("cache status of {run_id}"))?;
        }
        Ok(())
    })
    .await;
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("failed to update run history: {e:#}"),
        Err(e) => warn!("run history task failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::ThreadId;

    fn file_history() -> (tempfile::TempDir, FileRunHistory) {
        let dir = tempfile::tempdir().unwrap();
        let h = FileRunHistory::new(dir.path().join("citylens").join("recent_runs.json"));
        (dir, h)
    }

    #[test]
    fn caps_at_fifty_most_recent_first() {
        let (_dir, h) = file_history();
        for i in 0..60 {
            h.remember(&format!("r{i}")).unwrap();
        }
        let list = h.list().unwrap();
        assert_eq!(list.len(), MAX_RECENT_RUNS);
        assert_eq!(list[0].run_id, "r59");
        assert_eq!(list[49].run_id, "r10");
    }

    #[test]
    fn remembering_again_moves_to_front() {
        let h = MemoryRunHistory::default();
        h.remember("a").unwrap();
        h.remember("b").unwrap();
        h.remember("a").unwrap();
        let ids: Vec<_> = h.list().unwrap().into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn status_cache_is_merged_into_listing() {
        let (_dir, h) = file_history();
        h.remember("a").unwrap();
        h.record_status("a", "running").unwrap();
        h.record_status("a", "succeeded").unwrap();
        let list = h.list().unwrap();
        assert_eq!(list[0].last_known_status.as_deref(), Some("succeeded"));
    }

    #[test]
    fn status_survives_remember() {
        let h = MemoryRunHistory::default();
        h.remember("a").unwrap();
        h.record_status("a", "queued").unwrap();
        h.remember("a").unwrap();
        assert_eq!(h.list().unwrap()[0].last_known_status.as_deref(), Some("queued"));
    }

    /// Notes which thread each write ran on.
    #[derive(Default)]
    struct ThreadTracking {
        inner: MemoryRunHistory,
        threads: Mutex<Vec<ThreadId>>,
    }

    impl RunHistory for ThreadTracking {
        fn remember(&self, run_id: &str) -> Result<()> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            self.inner.remember(run_id)
        }

        fn record_status(&self, run_id: &str, status: &str) -> Result<()> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            self.inner.record_status(run_id, status)
        }

        fn list(&self) -> Result<Vec<RecentRun>> {
            self.inner.list()
        }
    }

    #[tokio::test]
    async fn record_seen_writes_off_the_runtime_thread() {
        let history = Arc::new(ThreadTracking::default());
        record_seen(history.clone(), "a".into(), Some("running".into())).await;

        let here = std::thread::current().id();
        let threads = history.threads.lock().unwrap().clone();
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|t| *t != here));
        assert_eq!(
            history.list().unwrap()[0].last_known_status.as_deref(),
            Some("running")
        );
    }

    #[tokio::test]
    async fn record_seen_without_status_leaves_cache_alone() {
        let history = Arc::new(MemoryRunHistory::default());
        record_seen(history.clone(), "a".into(), Some("queued".into())).await;
        record_seen(history.clone(), "a".into(), None).await;
        record_seen(history.clone(), "b".into(), None).await;

        let list = history.list().unwrap();
        assert_eq!(list[0].run_id, "b");
        assert_eq!(list[0].last_known_status, None);
        assert_eq!(list[1].last_known_status.as_deref(), Some("queued"));
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let (_dir, h) = file_history();
        fs::create_dir_all(h.path.parent().unwrap()).unwrap();
        fs::write(&h.path, "garbage").unwrap();
        assert!(h.list().unwrap().is_empty());
        h.remember("x").unwrap();
        assert_eq!(h.list().unwrap().len(), 1);
    }
}
