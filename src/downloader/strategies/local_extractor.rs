use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{default_identities, IdentityProfile, ToolPaths};
use crate::credentials::CredentialSnapshot;
use crate::downloader::codec::{CodecGate, CodecPolicy};
use crate::downloader::{
    AcquiredArtifact, AcquisitionBackend, AttemptContext, BackendFailure, BackendId, BackendOutcome,
    MediaKind, MediaMetadata, MediaPaths,
};
use crate::errors::AppError;
use crate::normalizer::{NormalizedUrl, Platform};
use crate::utils::{files_with_prefix, mask_proxy, remove_quietly, run_tool, short_id};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "mov", "m4v"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "opus", "ogg", "aac", "wav"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorErrorKind {
    /// 403 / bot wall; another identity may get through.
    Blocked,
    /// The impersonation target is not installed.
    ImpersonationUnavailable,
    NoMedia,
    Unsupported,
    Network,
    Other,
}

#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ExtractorError {
    pub kind: ExtractorErrorKind,
    pub message: String,
}

impl ExtractorError {
    pub fn new(kind: ExtractorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ExtractorError> for BackendFailure {
    fn from(error: ExtractorError) -> Self {
        match error.kind {
            ExtractorErrorKind::NoMedia | ExtractorErrorKind::Unsupported => {
                BackendFailure::Fatal(error.message)
            }
            _ => BackendFailure::Retryable(error.message),
        }
    }
}

/// The only place that interprets yt-dlp's stderr.
pub fn classify_failure(stderr: &str) -> ExtractorErrorKind {
    let text = stderr.to_lowercase();

    if text.contains("impersonate target") || text.contains("impersonation is not available") {
        ExtractorErrorKind::ImpersonationUnavailable
    } else if text.contains("http error 403")
        || text.contains("403: forbidden")
        || text.contains("http error 429")
        || text.contains("blocked")
        || text.contains("sign in to confirm")
    {
        ExtractorErrorKind::Blocked
    } else if text.contains("no video formats found")
        || text.contains("there is no video in this post")
        || text.contains("no media found")
        || text.contains("requested format is not available")
    {
        ExtractorErrorKind::NoMedia
    } else if text.contains("unsupported url") || text.contains("no working app info") {
        ExtractorErrorKind::Unsupported
    } else if text.contains("timed out")
        || text.contains("connection reset")
        || text.contains("temporary failure in name resolution")
        || text.contains("unable to download webpage")
    {
        ExtractorErrorKind::Network
    } else {
        ExtractorErrorKind::Other
    }
}

/// One yt-dlp run.
#[derive(Debug, Clone)]
pub struct ExtractorInvocation {
    pub url: String,
    pub format_selector: String,
    pub output_template: PathBuf,
    pub cookie_file: Option<PathBuf>,
    pub proxy: Option<String>,
    pub user_agent: String,
    pub impersonate: Option<String>,
    pub audio_only: bool,
    pub extractor_args: Option<String>,
}

/// The subset of yt-dlp's info JSON we keep.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[async_trait]
pub trait ExtractorTool: Send + Sync {
    async fn run(&self, invocation: &ExtractorInvocation) -> Result<ExtractedInfo, ExtractorError>;
}

pub struct YtDlpTool {
    program: String,
    socket_timeout_secs: u64,
    timeout: Duration,
}

impl YtDlpTool {
    pub fn new(tools: &ToolPaths) -> Self {
        Self {
            program: tools.ytdlp_path.clone(),
            socket_timeout_secs: tools.socket_timeout_secs,
            timeout: Duration::from_secs(tools.extraction_timeout_secs),
        }
    }

    pub fn build_args(&self, invocation: &ExtractorInvocation) -> Vec<String> {
        let mut args: Vec<String> = [
            "--no-playlist",
            "--no-warnings",
            "--no-progress",
            "--dump-json",
            "--no-simulate",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.extend([
            "--socket-timeout".to_string(),
            self.socket_timeout_secs.to_string(),
            "-f".to_string(),
            invocation.format_selector.clone(),
            "-o".to_string(),
            invocation.output_template.to_string_lossy().to_string(),
            "--user-agent".to_string(),
            invocation.user_agent.clone(),
        ]);

        if let Some(target) = &invocation.impersonate {
            args.extend(["--impersonate".to_string(), target.clone()]);
        }
        if let Some(cookie_file) = &invocation.cookie_file {
            args.extend(["--cookies".to_string(), cookie_file.to_string_lossy().to_string()]);
        }
        if let Some(proxy) = &invocation.proxy {
            args.extend(["--proxy".to_string(), proxy.clone()]);
        }
        if let Some(extractor_args) = &invocation.extractor_args {
            args.extend(["--extractor-args".to_string(), extractor_args.clone()]);
        }
        if invocation.audio_only {
            args.extend(
                ["-x", "--audio-format", "mp3", "--audio-quality", "320K"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }

        args.push(invocation.url.clone());
        args
    }
}

#[async_trait]
impl ExtractorTool for YtDlpTool {
    async fn run(&self, invocation: &ExtractorInvocation) -> Result<ExtractedInfo, ExtractorError> {
        let args = self.build_args(invocation);
        let output = run_tool(&self.program, &args, self.timeout)
            .await
            .map_err(|e| ExtractorError::new(ExtractorErrorKind::Other, e.to_string()))?;

        if !output.success {
            let message = output
                .stderr
                .lines()
                .rev()
                .find(|line| line.contains("ERROR"))
                .or_else(|| output.stderr.lines().last())
                .unwrap_or("yt-dlp failed")
                .trim()
                .to_string();
            return Err(ExtractorError::new(classify_failure(&output.stderr), message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last_line = stdout.lines().rev().find(|line| !line.trim().is_empty()).unwrap_or("{}");
        serde_json::from_str(last_line).map_err(|e| {
            ExtractorError::new(ExtractorErrorKind::Other, format!("Invalid yt-dlp JSON: {}", e))
        })
    }
}

/// Prefers AVC so the codec gate rarely has to reject anything.
pub fn format_selector(kind: MediaKind, target_height: Option<u32>) -> String {
    match kind {
        MediaKind::Audio => "ba[acodec^=mp4a]/ba/b".to_string(),
        MediaKind::Video => {
            let h = target_height
                .map(|height| format!("[height<={}]", height))
                .unwrap_or_default();
            format!("b[vcodec^=avc1]{h}/b[vcodec^=h264]{h}/bv*[vcodec^=avc1]{h}+ba[acodec^=mp4a]/b{h}")
        }
    }
}

/// Removes every file carrying the attempt's prefix when dropped, except the kept one.
struct OutputSweep {
    dir: PathBuf,
    prefix: String,
    keep: Option<PathBuf>,
}

impl OutputSweep {
    fn new(dir: &Path, prefix: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            keep: None,
        }
    }

    fn clear(&self) {
        for path in files_with_prefix(&self.dir, &self.prefix) {
            if self.keep.as_deref() != Some(path.as_path()) {
                remove_quietly(&path);
            }
        }
    }

    fn keep(&mut self, path: &Path) {
        self.keep = Some(path.to_path_buf());
    }
}

impl Drop for OutputSweep {
    fn drop(&mut self) {
        self.clear();
    }
}

fn pick_primary_output(files: &[PathBuf], kind: MediaKind) -> Option<PathBuf> {
    let wanted = match kind {
        MediaKind::Video => VIDEO_EXTENSIONS,
        MediaKind::Audio => AUDIO_EXTENSIONS,
    };
    files
        .iter()
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| wanted.contains(&ext.to_lowercase().as_str()))
        })
        .max_by_key(|path| std::fs::metadata(path).map(|m| m.len()).unwrap_or(0))
        .cloned()
}

/// Runs yt-dlp in-process with identity rotation.
pub struct LocalExtractor {
    tool: Arc<dyn ExtractorTool>,
    gate: Arc<CodecGate>,
    output_dir: PathBuf,
    identities: Vec<IdentityProfile>,
    proxy: Option<String>,
}

impl LocalExtractor {
    pub fn new(
        tool: Arc<dyn ExtractorTool>,
        gate: Arc<CodecGate>,
        output_dir: PathBuf,
        identities: Vec<IdentityProfile>,
        proxy: Option<String>,
    ) -> Self {
        let identities = if identities.is_empty() {
            default_identities()
        } else {
            identities
        };
        Self {
            tool,
            gate,
            output_dir,
            identities,
            proxy,
        }
    }

    pub fn has_proxy(&self) -> bool {
        self.proxy.is_some()
    }

    pub async fn extract(
        &self,
        target: &NormalizedUrl,
        kind: MediaKind,
        target_height: Option<u32>,
        use_proxy: bool,
        credentials: &CredentialSnapshot,
    ) -> BackendOutcome {
        let proxy = if use_proxy {
            match &self.proxy {
                Some(proxy) => {
                    log::info!("🌐 [LOCAL] Using proxy {}", mask_proxy(proxy));
                    Some(proxy.clone())
                }
                None => return Err(BackendFailure::Retryable("No proxy configured".to_string())),
            }
        } else {
            None
        };

        let prefix = format!("{}_", short_id());
        let mut sweep = OutputSweep::new(&self.output_dir, &prefix);
        let output_template = self.output_dir.join(format!("{}%(id)s.%(ext)s", prefix));
        let extractor_args = (target.platform == Platform::YouTube)
            .then(|| "youtube:player_client=android,web".to_string());

        let mut last_block: Option<ExtractorError> = None;
        let mut info: Option<ExtractedInfo> = None;

        for (index, identity) in self.identities.iter().enumerate() {
            let mut invocation = ExtractorInvocation {
                url: target.as_str().to_string(),
                format_selector: format_selector(kind, target_height),
                output_template: output_template.clone(),
                cookie_file: credentials.cookie_file.clone(),
                proxy: proxy.clone(),
                user_agent: identity.user_agent.clone(),
                impersonate: Some(identity.impersonate.clone()),
                audio_only: kind == MediaKind::Audio,
                extractor_args: extractor_args.clone(),
            };
            log::info!(
                "🚀 [LOCAL] Identity {}/{} ({}) for {}",
                index + 1,
                self.identities.len(),
                identity.impersonate,
                target.as_str()
            );

            let mut result = self.tool.run(&invocation).await;
            if let Err(e) = &result {
                if e.kind == ExtractorErrorKind::ImpersonationUnavailable {
                    log::warn!("⚠️ [LOCAL] Impersonation {} unavailable, retrying without it", identity.impersonate);
                    sweep.clear();
                    invocation.impersonate = None;
                    result = self.tool.run(&invocation).await;
                }
            }

            match result {
                Ok(extracted) => {
                    info = Some(extracted);
                    break;
                }
                Err(e) if e.kind == ExtractorErrorKind::Blocked => {
                    log::warn!("⚠️ [LOCAL] Blocked with identity {}: {}", index + 1, e.message);
                    sweep.clear();
                    last_block = Some(e);
                }
                Err(e) => {
                    log::error!("❌ [LOCAL] Extraction failed: {}", e.message);
                    return Err(e.into());
                }
            }
        }

        let Some(info) = info else {
            let reason = last_block.map(|e| e.message).unwrap_or_default();
            return Err(BackendFailure::Retryable(format!(
                "Blocked on all {} identities: {}",
                self.identities.len(),
                reason
            )));
        };

        let outputs = files_with_prefix(&self.output_dir, &prefix);
        let Some(primary) = pick_primary_output(&outputs, kind) else {
            return Err(BackendFailure::Retryable("yt-dlp reported success but produced no media file".to_string()));
        };

        let media = match kind {
            MediaKind::Audio => primary,
            MediaKind::Video => match self.gate.ensure_compliant(&primary, CodecPolicy::Strict).await {
                Ok(path) => path,
                Err(AppError::Codec(reason)) => {
                    log::warn!("⚠️ [LOCAL] Codec mismatch: {}", reason);
                    return Err(BackendFailure::Retryable(format!("Codec mismatch: {}", reason)));
                }
                Err(e) => return Err(e.into()),
            },
        };

        sweep.keep(&media);
        drop(sweep);
        log::info!("✅ [LOCAL] Extracted {:?}", media);

        Ok(AcquiredArtifact {
            media: MediaPaths::Single(media),
            thumbnail: None,
            metadata: MediaMetadata {
                title: info.title.unwrap_or_default(),
                uploader: info.uploader.unwrap_or_default(),
                source_url: info.webpage_url.unwrap_or_else(|| target.as_str().to_string()),
                duration_seconds: info.duration.map(|d| d.round() as u64).unwrap_or(0),
                width: info.width.unwrap_or(0),
                height: info.height.unwrap_or(0),
            },
        })
    }
}

/// Chain entry for the local extractor, direct or through the proxy.
pub struct LocalExtractionBackend {
    extractor: Arc<LocalExtractor>,
    use_proxy: bool,
}

impl LocalExtractionBackend {
    pub fn direct(extractor: Arc<LocalExtractor>) -> Self {
        Self {
            extractor,
            use_proxy: false,
        }
    }

    pub fn proxied(extractor: Arc<LocalExtractor>) -> Self {
        Self {
            extractor,
            use_proxy: true,
        }
    }
}

#[async_trait]
impl AcquisitionBackend for LocalExtractionBackend {
    fn id(&self) -> BackendId {
        if self.use_proxy {
            BackendId::LocalProxy
        } else {
            BackendId::LocalDirect
        }
    }

    async fn acquire(&self, ctx: &AttemptContext<'_>) -> BackendOutcome {
        self.extractor
            .extract(
                ctx.target,
                ctx.request.media_kind,
                ctx.request.target_height,
                self.use_proxy,
                ctx.credentials,
            )
            .await
    }
}
