use std::fmt;
use serde::{Deserialize, Serialize};

/// Output family a job produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Constrained-resolution video for feature phones
    #[default]
    #[serde(rename = "3gp")]
    Video3gp,
    /// Audio only
    #[serde(rename = "mp3")]
    AudioMp3,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Video3gp => "3gp",
            OutputFormat::AudioMp3 => "mp3",
        }
    }

    /// Parse a caller-supplied format tag; unknown tags fall back to 3gp
    pub fn parse_or_default(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "mp3" | "audio" => OutputFormat::AudioMp3,
            _ => OutputFormat::Video3gp,
        }
    }

    /// Infer the family from a file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "3gp" => Some(OutputFormat::Video3gp),
            "mp3" => Some(OutputFormat::AudioMp3),
            _ => None,
        }
    }

    /// Preset used when the caller names none or an unknown one
    pub fn default_preset(&self) -> &'static str {
        match self {
            OutputFormat::Video3gp => "low",
            OutputFormat::AudioMp3 => "medium",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, OutputFormat::Video3gp)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Video half of a preset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoParams {
    pub codec: &'static str,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
    /// Letterbox into the fixed frame preserving aspect ratio
    pub letterbox: bool,
}

/// Audio half of a preset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioParams {
    pub codec: &'static str,
    pub sample_rate: u32,
    pub channels: u32,
    /// Bitrate as ffmpeg expects it, e.g. "12.2k"
    pub bitrate: &'static str,
}

/// Immutable named bundle of encoding parameters for one output family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityPreset {
    pub name: &'static str,
    pub format: OutputFormat,
    pub video: Option<VideoParams>,
    pub audio: AudioParams,
}

const AMR_NB: AudioParams = AudioParams { codec: "amr_nb", sample_rate: 8000, channels: 1, bitrate: "12.2k" };

impl QualityPreset {
    /// Look up a preset by name; unknown names resolve to the family default
    pub fn resolve(format: OutputFormat, name: &str) -> QualityPreset {
        let wanted = name.trim().to_lowercase();
        match Self::lookup(format, &wanted) {
            Some(preset) => preset,
            None => {
                log::debug!("Unknown preset {:?} for {}, using {}", name, format, format.default_preset());
                Self::lookup(format, format.default_preset())
                    .unwrap_or_else(|| Self::safe(format))
            }
        }
    }

    fn lookup(format: OutputFormat, name: &str) -> Option<QualityPreset> {
        let preset = match (format, name) {
            (OutputFormat::Video3gp, "low") => QualityPreset {
                name: "low",
                format,
                video: Some(VideoParams { codec: "h263", width: 176, height: 144, frame_rate: 12, bitrate_kbps: 64, letterbox: true }),
                audio: AMR_NB,
            },
            (OutputFormat::Video3gp, "medium") => QualityPreset {
                name: "medium",
                format,
                video: Some(VideoParams { codec: "h263", width: 176, height: 144, frame_rate: 15, bitrate_kbps: 128, letterbox: true }),
                audio: AudioParams { codec: "aac", sample_rate: 22050, channels: 1, bitrate: "32k" },
            },
            (OutputFormat::Video3gp, "high") => QualityPreset {
                name: "high",
                format,
                video: Some(VideoParams { codec: "h263", width: 352, height: 288, frame_rate: 15, bitrate_kbps: 200, letterbox: true }),
                audio: AudioParams { codec: "aac", sample_rate: 44100, channels: 2, bitrate: "64k" },
            },
            (OutputFormat::AudioMp3, "low") => QualityPreset {
                name: "low",
                format,
                video: None,
                audio: AudioParams { codec: "libmp3lame", sample_rate: 22050, channels: 1, bitrate: "64k" },
            },
            (OutputFormat::AudioMp3, "medium") => QualityPreset {
                name: "medium",
                format,
                video: None,
                audio: AudioParams { codec: "libmp3lame", sample_rate: 44100, channels: 2, bitrate: "128k" },
            },
            (OutputFormat::AudioMp3, "high") => QualityPreset {
                name: "high",
                format,
                video: None,
                audio: AudioParams { codec: "libmp3lame", sample_rate: 44100, channels: 2, bitrate: "192k" },
            },
            _ => return None,
        };
        Some(preset)
    }

    /// Minimal, maximally compatible preset used after a failed primary encode
    pub fn safe(format: OutputFormat) -> QualityPreset {
        match format {
            OutputFormat::Video3gp => QualityPreset {
                name: "safe",
                format,
                video: Some(VideoParams { codec: "h263", width: 176, height: 144, frame_rate: 10, bitrate_kbps: 48, letterbox: false }),
                audio: AMR_NB,
            },
            OutputFormat::AudioMp3 => QualityPreset {
                name: "safe",
                format,
                video: None,
                audio: AudioParams { codec: "libmp3lame", sample_rate: 16000, channels: 1, bitrate: "32k" },
            },
        }
    }

    /// Human-readable summary for progress messages
    pub fn describe(&self) -> String {
        match &self.video {
            Some(v) => format!("{} format ({}x{})", self.format.extension().to_uppercase(), v.width, v.height),
            None => format!("{} audio ({})", self.format.extension().to_uppercase(), self.audio.bitrate),
        }
    }

    /// Video filter chain: fixed frame geometry, letterboxed when enabled
    pub fn video_filter(&self) -> Option<String> {
        let v = self.video.as_ref()?;
        let mut filter_parts = Vec::new();
        if v.letterbox {
            filter_parts.push(format!("scale={}:{}:force_original_aspect_ratio=decrease", v.width, v.height));
            filter_parts.push(format!("pad={}:{}:(ow-iw)/2:(oh-ih)/2", v.width, v.height));
            filter_parts.push("setsar=1".to_string());
        } else {
            filter_parts.push(format!("scale={}:{}", v.width, v.height));
        }
        Some(filter_parts.join(","))
    }

    /// Encoder arguments placed between the input and the output path
    pub fn encoder_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        match &self.video {
            Some(v) => {
                if let Some(filter) = self.video_filter() {
                    args.push("-vf".to_string());
                    args.push(filter);
                }
                args.push("-r".to_string());
                args.push(v.frame_rate.to_string());
                args.push("-c:v".to_string());
                args.push(v.codec.to_string());
                args.push("-b:v".to_string());
                args.push(format!("{}k", v.bitrate_kbps));
            }
            None => args.push("-vn".to_string()),
        }
        args.push("-c:a".to_string());
        args.push(self.audio.codec.to_string());
        args.push("-ar".to_string());
        args.push(self.audio.sample_rate.to_string());
        args.push("-ac".to_string());
        args.push(self.audio.channels.to_string());
        args.push("-b:a".to_string());
        args.push(self.audio.bitrate.to_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_preset_falls_back_to_family_default() {
        let p = QualityPreset::resolve(OutputFormat::Video3gp, "ultra");
        assert_eq!(p.name, "low");
        let p = QualityPreset::resolve(OutputFormat::AudioMp3, "");
        assert_eq!(p.name, "medium");
        let p = QualityPreset::resolve(OutputFormat::AudioMp3, " HIGH ");
        assert_eq!(p.name, "high");
    }

    #[test]
    fn low_3gp_matches_feature_phone_profile() {
        let p = QualityPreset::resolve(OutputFormat::Video3gp, "low");
        let args = p.encoder_args();
        let joined = args.join(" ");
        assert!(joined.contains("-c:v h263"));
        assert!(joined.contains("-b:v 64k"));
        assert!(joined.contains("-r 12"));
        assert!(joined.contains("-c:a amr_nb -ar 8000 -ac 1 -b:a 12.2k"));
        assert!(joined.contains("pad=176:144"));
    }

    #[test]
    fn safe_preset_is_plain_and_mono() {
        let safe = QualityPreset::safe(OutputFormat::Video3gp);
        assert_eq!(safe.video_filter().as_deref(), Some("scale=176:144"));
        assert_eq!(safe.audio.channels, 1);
        let safe_audio = QualityPreset::safe(OutputFormat::AudioMp3);
        let primary = QualityPreset::resolve(OutputFormat::AudioMp3, "low");
        assert!(safe_audio.audio.sample_rate < primary.audio.sample_rate);
        assert!(safe_audio.encoder_args().contains(&"-vn".to_string()));
    }

    #[test]
    fn format_tags_parse_and_serialize() {
        assert_eq!(OutputFormat::parse_or_default("MP3"), OutputFormat::AudioMp3);
        assert_eq!(OutputFormat::parse_or_default("avi"), OutputFormat::Video3gp);
        assert_eq!(serde_json::to_string(&OutputFormat::Video3gp).unwrap(), "\"3gp\"");
        assert_eq!(OutputFormat::from_extension("3GP"), Some(OutputFormat::Video3gp));
    }
}
