use std::path::PathBuf;
use std::sync::Arc;
use async_trait::async_trait;

use crate::config::{ConverterConfig, ProcessTimeout};
use crate::preset::OutputFormat;
use crate::process::{ProcessOutput, ProcessSupervisor, RunError};
use crate::tools::{AcquisitionTool, FetchRequest};

/// Invocation-wide options that do not change between attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Size ceiling as yt-dlp accepts it, e.g. "500M"
    pub max_filesize: String,
    pub rate_limit: Option<String>,
    pub prefer_ipv6: bool,
    pub socket_timeout_secs: u32,
}

impl FetchOptions {
    pub fn from_config(cfg: &ConverterConfig) -> Self {
        Self {
            max_filesize: cfg.max_filesize.clone(),
            rate_limit: cfg.rate_limit.clone(),
            prefer_ipv6: cfg.prefer_ipv6,
            socket_timeout_secs: 30,
        }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_filesize: "500M".to_string(),
            rate_limit: None,
            prefer_ipv6: false,
            socket_timeout_secs: 30,
        }
    }
}

/// Format selector: smallest stream that still carries what the output needs
pub fn format_selector(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Video3gp => "worst",
        OutputFormat::AudioMp3 => "bestaudio/worst",
    }
}

/// Build the yt-dlp command line for one attempt
pub fn build_fetch_args(request: &FetchRequest<'_>, options: &FetchOptions) -> Vec<String> {
    let mut args = Vec::new();

    args.push("-f".to_string());
    args.push(format_selector(request.format).to_string());
    args.push("--no-playlist".to_string());
    args.push("--no-progress".to_string());

    args.push("--max-filesize".to_string());
    args.push(options.max_filesize.clone());
    args.push("--socket-timeout".to_string());
    args.push(options.socket_timeout_secs.to_string());

    // Bounded retries inside this single invocation
    args.push("--retries".to_string());
    args.push("3".to_string());
    args.push("--fragment-retries".to_string());
    args.push("3".to_string());
    args.push("--retry-sleep".to_string());
    args.push("exp=1:8".to_string());

    args.push("--extractor-args".to_string());
    args.push(request.profile.extractor_args());
    args.push("--user-agent".to_string());
    args.push(request.profile.user_agent.to_string());
    for (name, value) in &request.profile.headers {
        args.push("--add-header".to_string());
        args.push(format!("{}:{}", name, value));
    }

    if let Some(cookies) = request.cookies {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().to_string());
    }
    if let Some(proxy) = request.proxy {
        args.push("--proxy".to_string());
        args.push(proxy.to_string());
    }
    if let Some(rate) = &options.rate_limit {
        args.push("--limit-rate".to_string());
        args.push(rate.clone());
    }
    if options.prefer_ipv6 {
        args.push("--force-ipv6".to_string());
    }

    let template = request.output_dir.join(format!("{}.%(ext)s", request.output_prefix));
    args.push("-o".to_string());
    args.push(template.to_string_lossy().to_string());

    args.push("--".to_string());
    args.push(request.source_reference.to_string());
    args
}

/// The real acquisition tool, run under the supervisor
pub struct YtDlp {
    pub bin: PathBuf,
    pub timeout: ProcessTimeout,
    pub options: FetchOptions,
    pub supervisor: Arc<ProcessSupervisor>,
}

#[async_trait]
impl AcquisitionTool for YtDlp {
    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<ProcessOutput, RunError> {
        let args = build_fetch_args(request, &self.options);
        self.supervisor.run(request.job_id, &self.bin, &args, self.timeout).await
    }
}
