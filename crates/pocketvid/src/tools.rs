//! Seams to the outside world: the acquisition tool, the transcoder, the
//! duration probe and the disk. The engines only talk to these traits.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use sysinfo::Disks;

use crate::acquire::profile::ClientProfile;
use crate::config::ProcessTimeout;
use crate::preset::OutputFormat;
use crate::process::{ProcessOutput, ProcessSupervisor, RunError};

/// One acquisition attempt as the engine describes it
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub job_id: &'a str,
    pub source_reference: &'a str,
    /// Directory the tool writes into
    pub output_dir: &'a Path,
    /// File name prefix the produced file must start with
    pub output_prefix: &'a str,
    pub format: OutputFormat,
    pub profile: &'a ClientProfile,
    pub proxy: Option<&'a str>,
    /// Validated credential file, if any
    pub cookies: Option<&'a Path>,
    /// 1-based attempt number
    pub attempt: usize,
}

#[async_trait]
pub trait AcquisitionTool: Send + Sync {
    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<ProcessOutput, RunError>;
}

#[async_trait]
pub trait TranscodeTool: Send + Sync {
    /// Run the transcoder with fully built arguments; the output path is last
    async fn transcode(&self, job_id: &str, args: &[String]) -> Result<ProcessOutput, RunError>;
}

#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Duration in seconds; `0.0` when the probe fails
    async fn duration_secs(&self, path: &Path) -> f64;
}

pub trait DiskSpace: Send + Sync {
    /// Free bytes on the filesystem holding `path`, if it can be determined
    fn free_bytes(&self, path: &Path) -> Option<u64>;
}

/// The real transcoder, run under the supervisor
pub struct Ffmpeg {
    pub bin: PathBuf,
    pub timeout: ProcessTimeout,
    pub supervisor: Arc<ProcessSupervisor>,
}

#[async_trait]
impl TranscodeTool for Ffmpeg {
    async fn transcode(&self, job_id: &str, args: &[String]) -> Result<ProcessOutput, RunError> {
        self.supervisor.run(job_id, &self.bin, args, self.timeout).await
    }
}

/// Total and available bytes of one filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub available: u64,
}

impl DiskUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let used = self.total.saturating_sub(self.available);
        ((used as f64 / self.total as f64) * 100.0).clamp(0.0, 100.0)
    }
}

/// Usage of the mount point that most specifically contains `path`
pub fn usage_for_path(disks: &Disks, path: &Path) -> Option<DiskUsage> {
    deepest_mount(
        disks.list().iter().map(|d| {
            (d.mount_point(), DiskUsage { total: d.total_space(), available: d.available_space() })
        }),
        path,
    )
}

fn deepest_mount<'a, I>(mounts: I, path: &Path) -> Option<DiskUsage>
where
    I: IntoIterator<Item = (&'a Path, DiskUsage)>,
{
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    mounts
        .into_iter()
        .filter(|(mount, _)| target.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, usage)| usage)
}

/// Free space from the mounted filesystems, matching the longest mount point
#[derive(Debug, Default)]
pub struct SystemDisk;

impl DiskSpace for SystemDisk {
    fn free_bytes(&self, path: &Path) -> Option<u64> {
        usage_for_path(&Disks::new_with_refreshed_list(), path).map(|u| u.available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(available: u64) -> DiskUsage {
        DiskUsage { total: 1000, available }
    }

    #[test]
    fn deepest_containing_mount_wins() {
        let mounts = [
            (Path::new("/"), usage(10)),
            (Path::new("/srv"), usage(20)),
            (Path::new("/srv/media"), usage(30)),
            (Path::new("/srv/mediax"), usage(40)),
        ];
        let found = deepest_mount(mounts.iter().copied(), Path::new("/srv/media/downloads"));
        assert_eq!(found, Some(usage(30)));
        let found = deepest_mount(mounts.iter().copied(), Path::new("/var/tmp"));
        assert_eq!(found, Some(usage(10)));
        assert_eq!(deepest_mount(mounts[1..].iter().copied(), Path::new("/var/tmp")), None);
    }

    #[test]
    fn used_percent_handles_empty_disks() {
        let usage = DiskUsage { total: 1000, available: 250 };
        assert!((usage.used_percent() - 75.0).abs() < 1e-9);
        assert_eq!(DiskUsage { total: 0, available: 0 }.used_percent(), 0.0);
    }
}
