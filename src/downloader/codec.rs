//! Codec compliance for chat delivery.
//!
//! Only H.264 video plays inline everywhere. Local extraction already asks
//! for AVC formats, so a mismatch there is a retryable failure; remote
//! sources may be transcoded instead when the deployment allows it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;

use crate::config::{ToolPaths, TranscodingConfig};
use crate::downloader::persist_staged;
use crate::errors::{AppError, Result};
use crate::utils::{remove_quietly, run_tool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecPolicy {
    /// Reject anything that is not H.264.
    Strict,
    /// Re-encode non-H.264 video to H.264.
    Transcode,
}

impl CodecPolicy {
    /// Policy for media fetched by remote services.
    pub fn for_remote(transcoding: &TranscodingConfig) -> Self {
        if transcoding.enabled {
            CodecPolicy::Transcode
        } else {
            CodecPolicy::Strict
        }
    }
}

#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Codec name of the first video stream, `None` when there is no video.
    async fn video_codec(&self, path: &Path) -> Result<Option<String>>;
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode_to_h264(&self, input: &Path, output: &Path) -> Result<()>;
}

pub struct FfprobeProber {
    program: String,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn video_codec(&self, path: &Path) -> Result<Option<String>> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-select_streams".to_string(),
            "v:0".to_string(),
            "-show_entries".to_string(),
            "stream=codec_name".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            path.to_string_lossy().to_string(),
        ];
        let output = run_tool(&self.program, &args, self.timeout).await?;
        if !output.success {
            return Err(AppError::Codec(format!("ffprobe failed: {}", output.stderr.trim())));
        }

        let codec = String::from_utf8_lossy(&output.stdout).trim().to_lowercase();
        Ok((!codec.is_empty()).then_some(codec))
    }
}

pub struct FfmpegTranscoder {
    program: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_secs(1800),
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode_to_h264(&self, input: &Path, output: &Path) -> Result<()> {
        let mut args = vec!["-y".to_string(), "-i".to_string(), input.to_string_lossy().to_string()];
        args.extend(
            [
                "-c:v", "libx264", "-preset", "veryfast", "-crf", "23",
                "-c:a", "aac", "-b:a", "128k",
                "-movflags", "+faststart",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(output.to_string_lossy().to_string());

        let result = run_tool(&self.program, &args, self.timeout).await?;
        if !result.success {
            let tail: String = result.stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            return Err(AppError::Codec(format!("ffmpeg failed: {}", tail)));
        }
        Ok(())
    }
}

pub fn is_h264(codec: &str) -> bool {
    let codec = codec.to_lowercase();
    codec == "h264" || codec.starts_with("avc")
}

pub struct CodecGate {
    prober: Arc<dyn MediaProber>,
    transcoder: Arc<dyn Transcoder>,
}

impl CodecGate {
    pub fn new(prober: Arc<dyn MediaProber>, transcoder: Arc<dyn Transcoder>) -> Self {
        Self { prober, transcoder }
    }

    /// ffprobe and ffmpeg from the configured tool paths.
    pub fn from_tools(tools: &ToolPaths) -> Self {
        Self::new(
            Arc::new(FfprobeProber::new(&tools.ffprobe_path)),
            Arc::new(FfmpegTranscoder::new(&tools.ffmpeg_path)),
        )
    }

    /// Returns the path of a compliant file: the input untouched, or its
    /// transcoded replacement. Never deletes the input on rejection.
    pub async fn ensure_compliant(&self, path: &Path, policy: CodecPolicy) -> Result<PathBuf> {
        let codec = match self.prober.video_codec(path).await? {
            None => return Ok(path.to_path_buf()),
            Some(codec) if is_h264(&codec) => {
                log::info!("✅ [CODEC] {:?} is {}", path, codec);
                return Ok(path.to_path_buf());
            }
            Some(codec) => codec,
        };

        match policy {
            CodecPolicy::Strict => Err(AppError::Codec(format!(
                "unsupported video codec {} (expected h264)",
                codec
            ))),
            CodecPolicy::Transcode => {
                log::info!("🔄 [CODEC] Transcoding {:?} from {} to h264", path, codec);
                self.transcode(path).await
            }
        }
    }

    async fn transcode(&self, path: &Path) -> Result<PathBuf> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let scratch = TempPath::from_path(path.with_file_name(format!("{}.h264.tmp.mp4", stem)));
        self.transcoder.transcode_to_h264(path, &scratch).await?;

        // Only the input itself may be replaced.
        let target = path.with_extension("mp4");
        if target == path {
            scratch.persist(&target).map_err(|e| AppError::Io(e.error))?;
            return Ok(target);
        }
        let target = persist_staged(scratch, &target)?;
        remove_quietly(path);
        Ok(target)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::gate;
    use super::*;

    #[test]
    fn recognizes_avc_names() {
        assert!(is_h264("h264"));
        assert!(is_h264("avc1.64001F"));
        assert!(!is_h264("hevc"));
        assert!(!is_h264("vp9"));
    }

    #[test]
    fn remote_policy_follows_transcoding_switch() {
        assert_eq!(CodecPolicy::for_remote(&TranscodingConfig { enabled: true }), CodecPolicy::Transcode);
        assert_eq!(CodecPolicy::for_remote(&TranscodingConfig::default()), CodecPolicy::Strict);
    }

    #[tokio::test]
    async fn h264_passes_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"original bytes").unwrap();

        for policy in [CodecPolicy::Strict, CodecPolicy::Transcode] {
            let result = gate(Some("h264")).ensure_compliant(&path, policy).await.unwrap();
            assert_eq!(result, path);
            assert_eq!(std::fs::read(&path).unwrap(), b"original bytes");
        }
    }

    #[tokio::test]
    async fn hevc_is_rejected_when_strict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"hevc").unwrap();

        let err = gate(Some("hevc"))
            .ensure_compliant(&path, CodecPolicy::Strict)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hevc"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn hevc_is_replaced_when_transcoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.webm");
        std::fs::write(&path, b"vp9").unwrap();

        let result = gate(Some("vp9"))
            .ensure_compliant(&path, CodecPolicy::Transcode)
            .await
            .unwrap();

        assert_eq!(result, dir.path().join("clip.mp4"));
        assert_eq!(std::fs::read(&result).unwrap(), b"h264");
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn transcode_never_replaces_a_neighbouring_file() {
        let dir = tempfile::tempdir().unwrap();
        let neighbour = dir.path().join("clip.mp4");
        std::fs::write(&neighbour, b"someone else").unwrap();
        let path = dir.path().join("clip.webm");
        std::fs::write(&path, b"vp9").unwrap();

        let result = gate(Some("vp9"))
            .ensure_compliant(&path, CodecPolicy::Transcode)
            .await
            .unwrap();

        assert_ne!(result, neighbour);
        assert_eq!(result.extension().unwrap(), "mp4");
        assert_eq!(std::fs::read(&result).unwrap(), b"h264");
        assert_eq!(std::fs::read(&neighbour).unwrap(), b"someone else");
        assert!(!path.exists());
    }
}
