//! TikTok photo posts through a public scraping API.
//!
//! The API hands back image and music URLs. Images are re-encoded to JPEG so
//! every chat client can show them; a partial set is still a success.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SlideshowConfig;
use crate::downloader::http_pool::HttpPool;
use crate::downloader::{
    AcquiredArtifact, AcquisitionBackend, AttemptContext, BackendFailure, BackendId, BackendOutcome,
    MediaMetadata, MediaPaths, PendingFiles,
};
use crate::errors::Result;
use crate::progress::ProgressReporter;
use crate::utils::short_id;

const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Deserialize)]
struct ScraperEnvelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<ScraperPost>,
}

#[derive(Debug, Default, Deserialize)]
struct ScraperPost {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    music: Option<String>,
    #[serde(default)]
    music_info: Option<ScraperMusic>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: Option<ScraperAuthor>,
    #[serde(default)]
    duration: u64,
}

#[derive(Debug, Deserialize)]
struct ScraperMusic {
    #[serde(default)]
    play: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScraperAuthor {
    #[serde(default)]
    unique_id: String,
}

impl ScraperPost {
    fn audio_url(&self) -> Option<&str> {
        self.music
            .as_deref()
            .or_else(|| self.music_info.as_ref().and_then(|m| m.play.as_deref()))
            .filter(|url| !url.is_empty())
    }
}

/// Flattens transparency onto white and encodes as JPEG.
pub fn to_jpeg(bytes: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)?;
    let rgb = flatten_onto_white(&decoded);

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY).encode_image(&rgb)?;
    Ok(encoded)
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u16 * a as u16 + 255 * (255 - a as u16)) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

pub struct SlideshowScraper {
    config: SlideshowConfig,
    http: Arc<HttpPool>,
    output_dir: PathBuf,
}

impl SlideshowScraper {
    pub fn new(config: SlideshowConfig, http: Arc<HttpPool>, output_dir: PathBuf) -> Self {
        Self {
            config,
            http,
            output_dir,
        }
    }

    async fn lookup(&self, url: &str) -> std::result::Result<ScraperPost, BackendFailure> {
        let response = self
            .http
            .get_client()
            .get(&self.config.api_url)
            .query(&[("url", url), ("hd", "1")])
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .send()
            .await
            .map_err(|e| BackendFailure::Retryable(format!("Slideshow API request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BackendFailure::Retryable(format!("Slideshow API returned {}", response.status())));
        }

        let envelope: ScraperEnvelope = response
            .json()
            .await
            .map_err(|e| BackendFailure::Retryable(format!("Invalid slideshow API response: {}", e)))?;

        if envelope.code != 0 {
            return Err(BackendFailure::Retryable(format!("Slideshow API error: {}", envelope.msg)));
        }
        Ok(envelope.data.unwrap_or_default())
    }

    async fn save_image(&self, url: &str, path: &Path) -> Result<()> {
        let (bytes, _) = self.http.fetch_bytes(url).await?;
        let jpeg = to_jpeg(&bytes)?;
        tokio::fs::write(path, jpeg).await?;
        Ok(())
    }

    async fn save_audio(&self, url: &str, path: &Path) -> Result<()> {
        let (bytes, _) = self.http.fetch_bytes(url).await?;
        if bytes.is_empty() {
            return Err(crate::errors::AppError::Download("Empty audio body".to_string()));
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    pub async fn scrape(&self, url: &str, progress: &ProgressReporter) -> BackendOutcome {
        log::info!("🖼 [SLIDESHOW] Looking up {}", url);
        let post = self.lookup(url).await?;

        if post.images.is_empty() {
            return Err(BackendFailure::Fatal("No images found in slideshow".to_string()));
        }

        let token = short_id();
        let total = post.images.len();
        let mut files = PendingFiles::new();

        for (index, image_url) in post.images.iter().enumerate() {
            let path = self.output_dir.join(format!("slide_{}_{:02}.jpg", token, index + 1));
            match self.save_image(image_url, &path).await {
                Ok(()) => {
                    files.push(path);
                    progress.report(format!("🖼 Downloaded {}/{} images", files.len(), total));
                }
                Err(e) => {
                    crate::utils::remove_quietly(&path);
                    log::warn!("⚠️ [SLIDESHOW] Image {} failed: {}", index + 1, e);
                }
            }
        }

        if files.is_empty() {
            return Err(BackendFailure::Retryable("All slideshow images failed to download".to_string()));
        }

        if let Some(audio_url) = post.audio_url() {
            let path = self.output_dir.join(format!("slide_{}_audio.mp3", token));
            match self.save_audio(audio_url, &path).await {
                Ok(()) => files.push(path),
                Err(e) => {
                    crate::utils::remove_quietly(&path);
                    log::warn!("⚠️ [SLIDESHOW] Audio failed: {}", e);
                }
            }
        }

        log::info!("✅ [SLIDESHOW] {} files for {}", files.len(), url);
        Ok(AcquiredArtifact {
            media: MediaPaths::Set(files.release()),
            thumbnail: None,
            metadata: MediaMetadata {
                title: post.title,
                uploader: post.author.map(|a| a.unique_id).unwrap_or_default(),
                source_url: url.to_string(),
                duration_seconds: post.duration,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl AcquisitionBackend for SlideshowScraper {
    fn id(&self) -> BackendId {
        BackendId::SlideshowScraper
    }

    async fn acquire(&self, ctx: &AttemptContext<'_>) -> BackendOutcome {
        self.scrape(ctx.target.as_str(), ctx.progress).await
    }
}
