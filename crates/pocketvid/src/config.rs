use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// Timeout applied to one external tool invocation.
///
/// "No timeout" is its own variant so it can never be confused with a
/// zero-second limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessTimeout {
    Unbounded,
    Seconds(u64),
}

impl ProcessTimeout {
    /// Duration to wait for, or None when unbounded
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            ProcessTimeout::Unbounded => None,
            ProcessTimeout::Seconds(secs) => Some(Duration::from_secs(*secs)),
        }
    }

    /// Parse an environment-style value: a positive number of seconds, or
    /// one of `none`, `unbounded`, `off`, `disabled`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_lowercase();
        match value.as_str() {
            "none" | "unbounded" | "off" | "disabled" => Some(ProcessTimeout::Unbounded),
            _ => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => Some(ProcessTimeout::Seconds(secs)),
                _ => None,
            },
        }
    }
}

/// Configuration for the conversion daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Scratch directory holding downloaded sources, outputs and parts
    pub scratch_dir: PathBuf,
    /// Job store snapshot file
    pub state_file: PathBuf,
    /// Maximum accepted media duration in seconds
    pub max_duration_secs: u64,
    /// Timeout for one acquisition tool invocation
    pub acquire_timeout: ProcessTimeout,
    /// Timeout for one transcoding tool invocation
    pub transcode_timeout: ProcessTimeout,
    /// Retention horizon in hours
    pub retention_hours: u64,
    /// Interval in seconds between retention sweeps
    pub sweep_interval_secs: u64,
    /// Max file size passed to the acquisition tool (yt-dlp syntax, e.g. "500M")
    pub max_filesize: String,
    /// Minimum free scratch space in megabytes before a job may start
    pub disk_threshold_mb: u64,
    /// Optional download rate ceiling (yt-dlp syntax, e.g. "1M")
    pub rate_limit: Option<String>,
    /// Prefer IPv6 when talking to the upstream service
    pub prefer_ipv6: bool,
    /// Fixed proxy endpoint
    pub proxy_url: Option<String>,
    /// Rotate through a proxy pool instead of one fixed endpoint
    pub proxy_rotation: bool,
    /// File with one proxy URL per line, feeds the rotation pool
    pub proxy_list_file: Option<PathBuf>,
    /// Seconds before the rotation pool re-reads its endpoints
    pub proxy_refresh_secs: u64,
    /// Most endpoints the rotation pool keeps
    pub max_proxy_cache: usize,
    /// Upper bound on simultaneously running jobs (None = no cap)
    pub max_concurrent_jobs: Option<usize>,
    /// Netscape-format cookie file handed to the acquisition tool when usable
    pub cookies_file: PathBuf,
    /// Path to the yt-dlp binary
    pub ytdlp_bin: PathBuf,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConverterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            scratch_dir: PathBuf::from("/tmp/downloads"),
            state_file: PathBuf::from("/tmp/conversion_status.json"),
            max_duration_secs: 6 * 60 * 60,
            acquire_timeout: ProcessTimeout::Seconds(300),
            transcode_timeout: ProcessTimeout::Seconds(300),
            retention_hours: 2,
            sweep_interval_secs: 1800,
            max_filesize: "500M".to_string(),
            disk_threshold_mb: 1500,
            rate_limit: None,
            prefer_ipv6: false,
            proxy_url: None,
            proxy_rotation: false,
            proxy_list_file: None,
            proxy_refresh_secs: 3600,
            max_proxy_cache: 20,
            max_concurrent_jobs: None,
            cookies_file: PathBuf::from("/tmp/cookies.txt"),
            ytdlp_bin: PathBuf::from("yt-dlp"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
        }
    }

    /// Load configuration from a file (if given and present), then apply
    /// environment overrides
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment-style overrides. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("POCKETVID_SCRATCH_DIR") {
            self.scratch_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("POCKETVID_STATE_FILE") {
            self.state_file = PathBuf::from(v);
        }
        if let Some(v) = parse_number(&lookup, "MAX_VIDEO_DURATION") {
            self.max_duration_secs = v;
        }
        if let Some(v) = lookup("DOWNLOAD_TIMEOUT") {
            match ProcessTimeout::parse(&v) {
                Some(t) => self.acquire_timeout = t,
                None => warn!("Ignoring invalid DOWNLOAD_TIMEOUT value: {:?}", v),
            }
        }
        if let Some(v) = lookup("CONVERSION_TIMEOUT") {
            match ProcessTimeout::parse(&v) {
                Some(t) => self.transcode_timeout = t,
                None => warn!("Ignoring invalid CONVERSION_TIMEOUT value: {:?}", v),
            }
        }
        if let Some(v) = parse_number(&lookup, "FILE_RETENTION_HOURS") {
            self.retention_hours = v;
        }
        if let Some(v) = parse_number(&lookup, "CLEANUP_INTERVAL") {
            self.sweep_interval_secs = v.max(1);
        }
        if let Some(v) = lookup("MAX_FILESIZE") {
            self.max_filesize = v;
        }
        if let Some(v) = parse_number(&lookup, "DISK_SPACE_THRESHOLD_MB") {
            self.disk_threshold_mb = v;
        }
        if let Some(v) = lookup("RATE_LIMIT") {
            self.rate_limit = non_empty(v);
        }
        if let Some(v) = lookup("PREFER_IPV6") {
            self.prefer_ipv6 = parse_flag(&v);
        }
        if let Some(v) = lookup("PROXY_URL") {
            self.proxy_url = non_empty(v);
        }
        if let Some(v) = lookup("ENABLE_PROXY_ROTATION") {
            self.proxy_rotation = parse_flag(&v);
        }
        if let Some(v) = lookup("PROXY_LIST_FILE") {
            self.proxy_list_file = non_empty(v).map(PathBuf::from);
        }
        if let Some(v) = parse_number(&lookup, "PROXY_REFRESH_INTERVAL") {
            self.proxy_refresh_secs = v;
        }
        if let Some(v) = parse_number(&lookup, "MAX_PROXY_CACHE") {
            self.max_proxy_cache = (v as usize).max(1);
        }
        if let Some(v) = parse_number(&lookup, "MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = if v == 0 { None } else { Some(v as usize) };
        }
        if let Some(v) = lookup("COOKIES_FILE") {
            self.cookies_file = PathBuf::from(v);
        }
    }

    /// Directory polled for submission request files
    pub fn request_dir(&self) -> PathBuf {
        self.scratch_dir.join("requests")
    }

    /// Where the proxy pool caches its state
    pub fn proxy_cache_file(&self) -> PathBuf {
        self.scratch_dir.join("proxy_cache.json")
    }

    pub fn retention_horizon(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    pub fn disk_threshold_bytes(&self) -> u64 {
        self.disk_threshold_mb * 1024 * 1024
    }
}

fn parse_number<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid {} value: {:?}", key, raw);
            None
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ConverterConfig::default();
        assert_eq!(cfg.retention_hours, 2);
        assert_eq!(cfg.sweep_interval_secs, 1800);
        assert_eq!(cfg.acquire_timeout, ProcessTimeout::Seconds(300));
        assert_eq!(cfg.disk_threshold_bytes(), 1500 * 1024 * 1024);
        assert!(cfg.max_concurrent_jobs.is_none());
    }

    #[test]
    fn timeout_keywords_are_unbounded_and_zero_is_rejected() {
        assert_eq!(ProcessTimeout::parse("none"), Some(ProcessTimeout::Unbounded));
        assert_eq!(ProcessTimeout::parse(" Unbounded "), Some(ProcessTimeout::Unbounded));
        assert_eq!(ProcessTimeout::parse("45"), Some(ProcessTimeout::Seconds(45)));
        assert_eq!(ProcessTimeout::parse("0"), None);
        assert_eq!(ProcessTimeout::parse("soon"), None);
        assert_eq!(ProcessTimeout::Unbounded.as_duration(), None);
    }

    #[test]
    fn env_overrides_apply_and_bad_values_keep_defaults() {
        let mut cfg = ConverterConfig::default();
        cfg.apply_env(env(&[
            ("FILE_RETENTION_HOURS", "6"),
            ("DOWNLOAD_TIMEOUT", "none"),
            ("CONVERSION_TIMEOUT", "0"),
            ("DISK_SPACE_THRESHOLD_MB", "lots"),
            ("ENABLE_PROXY_ROTATION", "true"),
            ("RATE_LIMIT", "  "),
            ("MAX_CONCURRENT_JOBS", "3"),
        ]));
        assert_eq!(cfg.retention_hours, 6);
        assert_eq!(cfg.acquire_timeout, ProcessTimeout::Unbounded);
        assert_eq!(cfg.transcode_timeout, ProcessTimeout::Seconds(300));
        assert_eq!(cfg.disk_threshold_mb, 1500);
        assert!(cfg.proxy_rotation);
        assert!(cfg.rate_limit.is_none());
        assert_eq!(cfg.max_concurrent_jobs, Some(3));
    }

    #[test]
    fn toml_file_accepts_both_timeout_forms() {
        let toml = r#"
            scratch_dir = "/srv/scratch"
            acquire_timeout = "unbounded"
            transcode_timeout = { seconds = 900 }
        "#;
        let cfg: ConverterConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.scratch_dir, PathBuf::from("/srv/scratch"));
        assert_eq!(cfg.acquire_timeout, ProcessTimeout::Unbounded);
        assert_eq!(cfg.transcode_timeout, ProcessTimeout::Seconds(900));
        assert_eq!(cfg.retention_hours, 2);
    }
}
