use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CobaltConfig;
use crate::downloader::codec::{CodecGate, CodecPolicy};
use crate::downloader::http_pool::HttpPool;
use crate::downloader::{
    AcquiredArtifact, AcquisitionBackend, AttemptContext, BackendFailure, BackendId, BackendOutcome,
    MediaKind, MediaMetadata, MediaPaths, PendingFiles,
};
use crate::progress::ProgressReporter;
use crate::utils::{remove_quietly, sanitize_filename, short_id};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CobaltRequest<'a> {
    url: &'a str,
    video_quality: &'a str,
    youtube_video_codec: &'static str,
    download_mode: &'static str,
    always_proxy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_bitrate: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CobaltResponse {
    Redirect {
        url: String,
        #[serde(default)]
        filename: Option<String>,
    },
    Tunnel {
        url: String,
        #[serde(default)]
        filename: Option<String>,
    },
    Picker {
        #[serde(default)]
        picker: Vec<PickerItem>,
        #[serde(default)]
        audio: Option<String>,
    },
    LocalProcessing {
        #[serde(default)]
        tunnel: Vec<String>,
    },
    Error {
        error: CobaltErrorBody,
    },
}

#[derive(Debug, Deserialize)]
pub struct PickerItem {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct CobaltErrorBody {
    pub code: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// Self-hosted Cobalt instance.
pub struct CobaltBackend {
    config: CobaltConfig,
    http: Arc<HttpPool>,
    gate: Arc<CodecGate>,
    policy: CodecPolicy,
    output_dir: PathBuf,
}

impl CobaltBackend {
    pub fn new(
        config: CobaltConfig,
        http: Arc<HttpPool>,
        gate: Arc<CodecGate>,
        policy: CodecPolicy,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            http,
            gate,
            policy,
            output_dir,
        }
    }

    async fn request(&self, url: &str, kind: MediaKind) -> Result<CobaltResponse, BackendFailure> {
        let audio = kind == MediaKind::Audio;
        let body = CobaltRequest {
            url,
            video_quality: &self.config.video_quality,
            youtube_video_codec: "h264",
            download_mode: if audio { "audio" } else { "auto" },
            always_proxy: false,
            audio_format: audio.then_some("mp3"),
            audio_bitrate: audio.then_some("320"),
        };

        let mut request = self
            .http
            .get_client()
            .post(&self.config.api_url)
            .header("Accept", "application/json")
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Api-Key {}", key));
        }

        log::info!("🌐 [COBALT] Requesting {} ({})", url, body.download_mode);
        let response = request.send().await.map_err(|e| BackendFailure::Retryable(format!("Cobalt request failed: {}", e)))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| BackendFailure::Retryable(e.to_string()))?;

        // Error payloads come with 4xx codes but still carry a status field
        match serde_json::from_str::<CobaltResponse>(&text) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(BackendFailure::Retryable(format!(
                "Cobalt API returned {}: {}",
                status,
                text.trim()
            ))),
            Err(e) => Err(BackendFailure::Retryable(format!("Unexpected Cobalt response: {}", e))),
        }
    }

    pub async fn download(&self, url: &str, kind: MediaKind, progress: &ProgressReporter) -> BackendOutcome {
        match self.request(url, kind).await? {
            CobaltResponse::Redirect { url: link, filename } => {
                progress.report("📥 Downloading from direct link...");
                self.download_single(url, &link, filename, kind, progress).await
            }
            CobaltResponse::Tunnel { url: link, filename } => {
                progress.report("🌐 Downloading via tunnel...");
                self.download_single(url, &link, filename, kind, progress).await
            }
            CobaltResponse::Picker { picker, audio } => self.download_picker(url, picker, audio, progress).await,
            CobaltResponse::LocalProcessing { .. } => Err(BackendFailure::Retryable(
                "Cobalt requires local processing, which is not supported".to_string(),
            )),
            CobaltResponse::Error { error } => {
                let context = error.context.map(|c| format!(" ({})", c)).unwrap_or_default();
                log::warn!("⚠️ [COBALT] API error {}{}", error.code, context);
                Err(BackendFailure::Retryable(format!("Cobalt error: {}{}", error.code, context)))
            }
        }
    }

    async fn download_single(
        &self,
        source_url: &str,
        link: &str,
        filename: Option<String>,
        kind: MediaKind,
        progress: &ProgressReporter,
    ) -> BackendOutcome {
        let name = filename
            .map(|f| sanitize_filename(&f))
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| match kind {
                MediaKind::Video => format!("video_{}.mp4", short_id()),
                MediaKind::Audio => format!("audio_{}.mp3", short_id()),
            });

        let path = self.http.download_to_file(link, &self.output_dir, &name, progress).await?;

        let path = match kind {
            MediaKind::Audio => path,
            MediaKind::Video => match self.gate.ensure_compliant(&path, self.policy).await {
                Ok(compliant) => compliant,
                Err(e) => {
                    remove_quietly(&path);
                    return Err(e.into());
                }
            },
        };

        log::info!("✅ [COBALT] Downloaded {:?}", path);
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(AcquiredArtifact {
            media: MediaPaths::Single(path),
            thumbnail: None,
            metadata: MediaMetadata {
                title,
                uploader: "Unknown".to_string(),
                source_url: source_url.to_string(),
                ..Default::default()
            },
        })
    }

    async fn download_picker(
        &self,
        source_url: &str,
        items: Vec<PickerItem>,
        audio: Option<String>,
        progress: &ProgressReporter,
    ) -> BackendOutcome {
        if items.is_empty() {
            return Err(BackendFailure::Retryable("Cobalt picker is empty".to_string()));
        }

        let token = short_id();
        let total = items.len();
        let mut files = PendingFiles::new();

        for (index, item) in items.iter().enumerate() {
            let extension = match item.kind.as_deref() {
                Some("video") => "mp4",
                Some("gif") => "gif",
                _ => "jpg",
            };
            let name = format!("picker_{}_{}.{}", token, index, extension);
            match self
                .http
                .download_to_file(&item.url, &self.output_dir, &name, &ProgressReporter::silent())
                .await
            {
                Ok(path) => {
                    files.push(path);
                    progress.report(format!("🖼 Downloaded {}/{} items", files.len(), total));
                }
                Err(e) => log::warn!("⚠️ [COBALT] Picker item {} failed: {}", index, e),
            }
        }

        if files.is_empty() {
            return Err(BackendFailure::Retryable("All picker items failed to download".to_string()));
        }

        if let Some(audio_url) = audio.filter(|a| !a.is_empty()) {
            let name = format!("picker_{}_audio.mp3", token);
            match self
                .http
                .download_to_file(&audio_url, &self.output_dir, &name, &ProgressReporter::silent())
                .await
            {
                Ok(path) => files.push(path),
                Err(e) => log::warn!("⚠️ [COBALT] Picker audio failed: {}", e),
            }
        }

        log::info!("✅ [COBALT] Picker produced {} files", files.len());
        Ok(AcquiredArtifact {
            media: MediaPaths::Set(files.release()),
            thumbnail: None,
            metadata: MediaMetadata {
                source_url: source_url.to_string(),
                uploader: "Unknown".to_string(),
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl AcquisitionBackend for CobaltBackend {
    fn id(&self) -> BackendId {
        BackendId::DownloadApi
    }

    async fn acquire(&self, ctx: &AttemptContext<'_>) -> BackendOutcome {
        self.download(ctx.target.as_str(), ctx.request.media_kind, ctx.progress).await
    }
}
