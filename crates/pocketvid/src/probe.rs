use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command;

use crate::tools::MediaProbe;

/// Subset of ffprobe output the core needs
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    #[serde(default)]
    pub format_name: Option<String>,
    /// ffprobe reports numbers as strings
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
}

impl FFProbeData {
    pub fn duration_secs(&self) -> Option<f64> {
        self.format
            .duration
            .as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0)
    }
}

/// Parse `ffprobe -print_format json -show_format` output
pub fn parse_probe_json(json: &str) -> Result<FFProbeData> {
    serde_json::from_str(json).context("Failed to parse ffprobe JSON")
}

/// Run ffprobe and parse the JSON output
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path) -> Result<FFProbeData> {
    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    let output = Command::new(ffprobe_bin)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg(file_path)
        .output()
        .await
        .with_context(|| format!("Failed to execute ffprobe for: {}", file_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "ffprobe failed (exit code {}) for {}: {}",
            output.status.code().unwrap_or(-1),
            file_path.display(),
            stderr.trim()
        );
    }

    let json_str = String::from_utf8(output.stdout).context("ffprobe output is not valid UTF-8")?;
    parse_probe_json(&json_str).with_context(|| format!("Bad ffprobe output for: {}", file_path.display()))
}

/// Duration probe backed by the ffprobe binary
#[derive(Debug, Clone)]
pub struct FfProbe {
    pub bin: PathBuf,
}

#[async_trait]
impl MediaProbe for FfProbe {
    async fn duration_secs(&self, path: &Path) -> f64 {
        match probe_file(&self.bin, path).await {
            Ok(data) => {
                let secs = data.duration_secs().unwrap_or(0.0);
                debug!("Probed {}: {:.2}s", path.display(), secs);
                secs
            }
            Err(e) => {
                warn!("Duration probe failed for {}: {:#}", path.display(), e);
                0.0
            }
        }
    }
}
