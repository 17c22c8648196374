use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::config::AppConfig;
use crate::downloader::codec::{CodecGate, CodecPolicy};
use crate::downloader::worker_protocol::{
    HttpWorkerTransport, UpdateOutcome, WorkerFrame, WorkerMetadata, WorkerRequest, WorkerTransport,
};
use crate::downloader::{
    persist_staged, stage_file, AcquiredArtifact, AcquisitionBackend, AttemptContext, BackendId,
    BackendOutcome, MediaKind, MediaMetadata, MediaPaths,
};
use crate::errors::{AppError, Result};
use crate::progress::{ProgressReporter, ProgressTicker, StatusPool, WAITING_MESSAGES};
use crate::utils::{generate_download_id, remove_quietly, sanitize_filename};

/// Delegates extraction to the remote worker and reassembles its frame stream.
pub struct RemoteWorkerBackend {
    transport: Arc<dyn WorkerTransport>,
    gate: Arc<CodecGate>,
    policy: CodecPolicy,
    output_dir: PathBuf,
    ticker_interval: Duration,
    waiting: StatusPool,
}

impl RemoteWorkerBackend {
    pub fn new(
        transport: Arc<dyn WorkerTransport>,
        gate: Arc<CodecGate>,
        policy: CodecPolicy,
        output_dir: PathBuf,
        ticker_interval: Duration,
    ) -> Self {
        Self {
            transport,
            gate,
            policy,
            output_dir,
            ticker_interval,
            waiting: StatusPool::new(WAITING_MESSAGES),
        }
    }

    /// Worker over HTTP, as configured under `worker`.
    pub fn from_config(config: &AppConfig, gate: Arc<CodecGate>) -> Result<Self> {
        Ok(Self::new(
            Arc::new(HttpWorkerTransport::new(&config.worker)?),
            gate,
            CodecPolicy::for_remote(&config.transcoding),
            config.downloads_dir.clone(),
            Duration::from_secs(config.worker.ticker_interval_secs),
        ))
    }

    pub async fn worker_version(&self) -> Result<String> {
        self.transport.get_version().await
    }

    pub async fn update_worker_tool(&self) -> Result<UpdateOutcome> {
        let outcome = self.transport.update_tool().await?;
        log::info!(
            "[REMOTE] Tool update: success={} version={:?}",
            outcome.success,
            outcome.new_version
        );
        Ok(outcome)
    }

    pub async fn acquire_remote(
        &self,
        url: &str,
        kind: MediaKind,
        target_height: Option<u32>,
        cookies_blob: &str,
        progress: &ProgressReporter,
    ) -> Result<AcquiredArtifact> {
        let request = WorkerRequest {
            url: url.to_string(),
            is_audio: kind == MediaKind::Audio,
            target_height: target_height.unwrap_or(0),
            cookies_blob: cookies_blob.to_string(),
        };

        log::info!("🛰 [REMOTE] Requesting {} (audio: {})", url, request.is_audio);
        let _ticker = ProgressTicker::start(progress.clone(), self.waiting.clone(), self.ticker_interval);
        let artifact = self.receive(request).await?;

        if kind == MediaKind::Audio {
            return Ok(artifact);
        }

        let MediaPaths::Single(media) = &artifact.media else {
            return Ok(artifact);
        };
        match self.gate.ensure_compliant(media, self.policy).await {
            Ok(path) => Ok(AcquiredArtifact {
                media: MediaPaths::Single(path),
                ..artifact
            }),
            Err(e) => {
                artifact.remove_files();
                Err(e)
            }
        }
    }

    async fn receive(&self, request: WorkerRequest) -> Result<AcquiredArtifact> {
        let token = generate_download_id();
        let extension = if request.is_audio { ".mp3" } else { ".mp4" };
        let (mut media, media_temp) = stage_file(&self.output_dir, &format!("temp_{}", token), extension)?;
        let (mut thumbnail, thumbnail_temp) = stage_file(&self.output_dir, &format!("temp_{}", token), ".jpg")?;

        let source_url = request.url.clone();
        let mut frames = self.transport.download_media(request).await?;
        let mut metadata: Option<WorkerMetadata> = None;
        let mut media_bytes = 0u64;
        let mut thumbnail_bytes = 0u64;

        while let Some(frame) = frames.next().await {
            match frame? {
                WorkerFrame::Metadata(meta) => {
                    if metadata.is_some() {
                        return Err(AppError::Worker("Duplicate metadata frame".to_string()));
                    }
                    log::info!("[REMOTE] Metadata: {} by {}", meta.title, meta.uploader);
                    metadata = Some(meta);
                }
                WorkerFrame::ThumbnailChunk(bytes) => {
                    thumbnail.write_all(&bytes).await?;
                    thumbnail_bytes += bytes.len() as u64;
                }
                WorkerFrame::MediaChunk(bytes) => {
                    media.write_all(&bytes).await?;
                    media_bytes += bytes.len() as u64;
                }
            }
        }
        media.flush().await?;
        thumbnail.flush().await?;
        drop(media);
        drop(thumbnail);

        if media_bytes == 0 {
            return Err(AppError::Worker("Stream ended without media".to_string()));
        }

        let final_name = metadata
            .as_ref()
            .map(|meta| sanitize_filename(&meta.filename))
            .filter(|name| !name.is_empty());
        let media_path = match final_name {
            Some(name) => persist_staged(media_temp, &self.output_dir.join(name))?,
            None => media_temp.keep().map_err(|e| AppError::Io(e.error))?,
        };

        let thumbnail_path = if thumbnail_bytes > 0 {
            let mut dest = media_path.with_extension("jpg");
            if dest == media_path {
                let stem = media_path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
                dest = media_path.with_file_name(format!("{}_thumb.jpg", stem));
            }
            match persist_staged(thumbnail_temp, &dest) {
                Ok(path) => Some(path),
                Err(e) => {
                    remove_quietly(&media_path);
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::info!("✅ [REMOTE] Received {} bytes into {:?}", media_bytes, media_path);
        let metadata = metadata.unwrap_or_default();
        Ok(AcquiredArtifact {
            media: MediaPaths::Single(media_path),
            thumbnail: thumbnail_path,
            metadata: MediaMetadata {
                title: metadata.title,
                uploader: metadata.uploader,
                source_url: if metadata.webpage_url.is_empty() { source_url } else { metadata.webpage_url },
                duration_seconds: metadata.duration,
                width: metadata.width,
                height: metadata.height,
            },
        })
    }
}

#[async_trait]
impl AcquisitionBackend for RemoteWorkerBackend {
    fn id(&self) -> BackendId {
        BackendId::RemoteWorker
    }

    async fn acquire(&self, ctx: &AttemptContext<'_>) -> BackendOutcome {
        Ok(self
            .acquire_remote(
                ctx.target.as_str(),
                ctx.request.media_kind,
                ctx.request.target_height,
                ctx.credentials.cookies_blob(),
                ctx.progress,
            )
            .await?)
    }
}
