use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use log::{info, warn};

use crate::error::JobError;
use crate::job::job_id_of_file;
use crate::tools::DiskSpace;

const MB: u64 = 1024 * 1024;

/// Headroom required over the downloaded source before converting
pub const CONVERSION_HEADROOM: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub admit: bool,
    /// `None` when the filesystem could not be identified
    pub free_bytes: Option<u64>,
}

/// Storage gate evaluated before and during a job
pub struct AdmissionController {
    scratch_dir: PathBuf,
    threshold_bytes: u64,
    disk: Arc<dyn DiskSpace>,
}

impl AdmissionController {
    pub fn new(scratch_dir: PathBuf, threshold_bytes: u64, disk: Arc<dyn DiskSpace>) -> Self {
        Self { scratch_dir, threshold_bytes, disk }
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes
    }

    pub fn check_admission(&self) -> AdmissionDecision {
        match self.disk.free_bytes(&self.scratch_dir) {
            Some(free) => AdmissionDecision {
                admit: free >= self.threshold_bytes,
                free_bytes: Some(free),
            },
            None => {
                warn!("Cannot determine free space for {}, admitting", self.scratch_dir.display());
                AdmissionDecision { admit: true, free_bytes: None }
            }
        }
    }

    /// Delete every job-owned scratch file except those of `protected` jobs.
    /// Returns the bytes freed.
    pub fn emergency_reclaim(&self, protected: &HashSet<String>) -> u64 {
        let entries = match fs::read_dir(&self.scratch_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Emergency reclaim cannot read {}: {}", self.scratch_dir.display(), e);
                return 0;
            }
        };

        let mut freed = 0u64;
        let mut deleted = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let name = entry.file_name();
            let Some(job_id) = name.to_str().and_then(job_id_of_file) else {
                continue;
            };
            if protected.contains(job_id) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    freed += meta.len();
                    deleted += 1;
                    info!("Emergency reclaim deleted {}", path.display());
                }
                Err(e) => warn!("Emergency reclaim failed to delete {}: {}", path.display(), e),
            }
        }
        warn!("⚠️ Emergency reclaim: deleted {} files, freed {} MB", deleted, freed / MB);
        freed
    }

    /// Gate a job before acquisition: check, reclaim once if needed, re-check
    pub fn admit_job(&self, job_id: &str, protected: &HashSet<String>) -> Result<AdmissionDecision, JobError> {
        let first = self.check_admission();
        if first.admit {
            return Ok(first);
        }
        warn!(
            "Job {}: low disk space ({} MB free, {} MB required), reclaiming",
            job_id,
            first.free_bytes.unwrap_or(0) / MB,
            self.threshold_bytes / MB
        );
        self.emergency_reclaim(protected);

        let second = self.check_admission();
        if second.admit {
            Ok(second)
        } else {
            Err(JobError::AdmissionRejected {
                free_mb: second.free_bytes.unwrap_or(0) / MB,
                required_mb: self.threshold_bytes / MB,
            })
        }
    }

    /// Second gate, after the source is on disk
    pub fn check_conversion(&self, source_bytes: u64) -> Result<(), JobError> {
        let Some(free) = self.disk.free_bytes(&self.scratch_dir) else {
            return Ok(());
        };
        let headroom = (source_bytes as f64 * CONVERSION_HEADROOM).ceil() as u64;
        let required = headroom.max(self.threshold_bytes);
        if free < required {
            return Err(JobError::InsufficientSpaceForConversion {
                free_mb: free / MB,
                required_mb: required.div_ceil(MB),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;

    /// Reports the queued values in order, repeating the last one
    struct ScriptedDisk(Mutex<VecDeque<u64>>);

    impl ScriptedDisk {
        fn new(values_mb: &[u64]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(values_mb.iter().map(|v| v * MB).collect())))
        }
    }

    impl DiskSpace for ScriptedDisk {
        fn free_bytes(&self, _path: &Path) -> Option<u64> {
            let mut q = self.0.lock().unwrap();
            if q.len() > 1 {
                q.pop_front()
            } else {
                q.front().copied()
            }
        }
    }

    fn touch(dir: &Path, name: &str, len: usize) {
        fs::write(dir.join(name), vec![0u8; len]).unwrap();
    }

    #[test]
    fn low_space_is_rejected_until_reclaim_frees_enough() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "aaaaaaaaaaaa.3gp", 10);
        let ctl = AdmissionController::new(dir.path().to_path_buf(), 1500 * MB, ScriptedDisk::new(&[1000, 1600]));

        let first = ctl.check_admission();
        assert!(!first.admit);
        assert_eq!(first.free_bytes, Some(1000 * MB));

        assert_eq!(ctl.emergency_reclaim(&HashSet::new()), 10);
        let second = ctl.check_admission();
        assert!(second.admit);
        assert_eq!(second.free_bytes, Some(1600 * MB));
    }

    #[test]
    fn admit_job_reclaims_then_rejects_when_still_short() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = AdmissionController::new(dir.path().to_path_buf(), 1500 * MB, ScriptedDisk::new(&[1000, 1200]));
        let err = ctl.admit_job("bbbbbbbbbbbb", &HashSet::new()).unwrap_err();
        assert!(matches!(err, JobError::AdmissionRejected { free_mb: 1200, required_mb: 1500 }));

        let ctl = AdmissionController::new(dir.path().to_path_buf(), 1500 * MB, ScriptedDisk::new(&[1000, 1600]));
        assert!(ctl.admit_job("bbbbbbbbbbbb", &HashSet::new()).unwrap().admit);
    }

    #[test]
    fn reclaim_spares_protected_jobs_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "aaaaaaaaaaaa_source.webm", 5);
        touch(dir.path(), "bbbbbbbbbbbb.3gp", 7);
        touch(dir.path(), "bbbbbbbbbbbb_part1.3gp", 3);
        touch(dir.path(), "proxy_cache.json", 2);
        let ctl = AdmissionController::new(dir.path().to_path_buf(), 0, ScriptedDisk::new(&[0]));

        let protected: HashSet<String> = ["aaaaaaaaaaaa".to_string()].into_iter().collect();
        assert_eq!(ctl.emergency_reclaim(&protected), 10);
        assert!(dir.path().join("aaaaaaaaaaaa_source.webm").exists());
        assert!(dir.path().join("proxy_cache.json").exists());
        assert!(!dir.path().join("bbbbbbbbbbbb.3gp").exists());
    }

    #[test]
    fn conversion_needs_headroom_over_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = AdmissionController::new(dir.path().to_path_buf(), 100 * MB, ScriptedDisk::new(&[1000]));
        assert!(ctl.check_conversion(600 * MB).is_ok());
        let err = ctl.check_conversion(700 * MB).unwrap_err();
        assert!(matches!(err, JobError::InsufficientSpaceForConversion { free_mb: 1000, required_mb: 1050 }));
    }

    #[test]
    fn unknown_filesystem_admits() {
        struct Blind;
        impl DiskSpace for Blind {
            fn free_bytes(&self, _path: &Path) -> Option<u64> {
                None
            }
        }
        let ctl = AdmissionController::new(PathBuf::from("/nowhere"), 1500 * MB, Arc::new(Blind));
        assert_eq!(ctl.check_admission(), AdmissionDecision { admit: true, free_bytes: None });
        assert!(ctl.check_conversion(u64::MAX / 4).is_ok());
    }
}
