//! Retention sweeper: expires old jobs and orphaned scratch files.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::StoreError;
use crate::job::{job_id_of_file, JobRecord};
use crate::store::{lock_file, JobStore};

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub records_removed: usize,
    pub files_deleted: usize,
    pub orphans_deleted: usize,
    pub deletion_failures: usize,
}

/// Whether `record` is past the retention horizon at `now`
pub fn is_expired(record: &JobRecord, now: DateTime<Utc>, horizon: chrono::Duration) -> bool {
    now - record.retention_anchor() > horizon
}

pub struct RetentionSweeper {
    store: Arc<JobStore>,
    scratch_dir: PathBuf,
    horizon: chrono::Duration,
    /// Files in the scratch directory that are never orphans
    keep: HashSet<PathBuf>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<JobStore>, scratch_dir: PathBuf, horizon: chrono::Duration) -> Self {
        let mut keep = HashSet::new();
        keep.insert(store.path().to_path_buf());
        keep.insert(lock_file(store.path()));
        Self { store, scratch_dir, horizon, keep }
    }

    /// Never treat `path` as an orphan
    pub fn keep_file(mut self, path: PathBuf) -> Self {
        self.keep.insert(path);
        self
    }

    /// One full pass over the store and the scratch directory
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let records = self.store.list_all();
        let files = self.scratch_files();

        let mut by_job: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for path in &files {
            if let Some(id) = path.file_name().and_then(|n| n.to_str()).and_then(job_id_of_file) {
                by_job.entry(id.to_string()).or_default().push(path.clone());
            }
        }

        let mut expired: Vec<String> = Vec::new();
        let mut live: HashSet<String> = HashSet::new();
        for record in &records {
            if !is_expired(record, now, self.horizon) {
                live.insert(record.id.clone());
                continue;
            }
            info!(
                "Job {}: expired ({}, anchor {}), removing",
                record.id,
                record.state,
                record.retention_anchor().format("%Y-%m-%d %H:%M:%S")
            );
            let mut targets: Vec<PathBuf> = by_job.remove(&record.id).unwrap_or_default();
            for owned in record.owned_files(&self.scratch_dir) {
                if owned.exists() && !targets.contains(&owned) {
                    targets.push(owned);
                }
            }
            for path in targets {
                self.delete(&path, &mut report.files_deleted, &mut report.deletion_failures);
            }
            expired.push(record.id.clone());
        }

        if !expired.is_empty() {
            report.records_removed = self.store.remove(&expired)?;
        }

        let cutoff = SystemTime::from(now - self.horizon);
        for path in files {
            if self.keep.contains(&path) || !path.exists() {
                continue;
            }
            let owner = path.file_name().and_then(|n| n.to_str()).and_then(job_id_of_file);
            if owner.is_some_and(|id| live.contains(id)) {
                continue;
            }
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    debug!("Cannot stat {}: {}", path.display(), e);
                    continue;
                }
            };
            if modified < cutoff {
                info!("🗑️  Deleting orphaned file: {}", path.display());
                self.delete(&path, &mut report.orphans_deleted, &mut report.deletion_failures);
            }
        }

        if report != SweepReport::default() {
            info!(
                "Sweep: {} records removed, {} files deleted, {} orphans deleted, {} failures",
                report.records_removed, report.files_deleted, report.orphans_deleted, report.deletion_failures
            );
        } else {
            debug!("Sweep: nothing to do");
        }
        Ok(report)
    }

    /// Sweep every `every` until shutdown; the first pass runs immediately
    pub async fn run_periodic(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    debug!("Sweeper stopping");
                    return;
                }
            }
            if *shutdown.borrow() {
                return;
            }
            let sweeper = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || sweeper.sweep_once(Utc::now())).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Sweep failed: {}", e),
                Err(e) => error!("Sweep task panicked: {}", e),
            }
        }
    }

    /// Regular files directly inside the scratch directory
    fn scratch_files(&self) -> Vec<PathBuf> {
        walkdir::WalkDir::new(&self.scratch_dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }

    fn delete(&self, path: &Path, counter: &mut usize, failures: &mut usize) {
        match fs::remove_file(path) {
            Ok(()) => *counter += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to delete {}: {}", path.display(), e);
                *failures += 1;
            }
        }
    }
}
