use std::path::{Path, PathBuf};
use std::time::Duration;
use futures_util::StreamExt;
use reqwest::{Client, ClientBuilder};
use tokio::io::AsyncWriteExt;
use crate::errors::{AppError, Result};
use crate::progress::ProgressReporter;
use crate::utils::short_id;
use super::{persist_staged, stage_file};

/// Shared HTTP client for direct file downloads
pub struct HttpPool {
    client: Client,
}

impl HttpPool {
    pub fn new(max_connections: usize, timeout_seconds: u64) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_seconds);

        let client = ClientBuilder::new()
            .pool_max_idle_per_host(max_connections)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(15))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36")
            .gzip(true)
            .brotli(true)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self { client })
    }

    pub fn get_client(&self) -> &Client {
        &self.client
    }

    /// Streams `url` into `<dir>/<file_name>`, reporting progress in 20% steps.
    ///
    /// Bytes land in a staged `temp_*` file first; nothing named `file_name`
    /// exists unless the whole body arrived and was non-empty.
    pub async fn download_to_file(
        &self,
        url: &str,
        dir: &Path,
        file_name: &str,
        progress: &ProgressReporter,
    ) -> Result<PathBuf> {
        log::info!("🌐 [HTTP] Downloading {} -> {}", url, file_name);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Download(format!("HTTP {} for {}", response.status(), url)));
        }

        let total_size = response.content_length().unwrap_or(0);
        let (mut file, staged) = stage_file(dir, &format!("temp_{}", short_id()), ".part")?;
        let mut steps = ProgressSteps::default();
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if let Some(percent) = steps.update(downloaded, total_size) {
                progress.report(format!("📥 Downloading: {}%", percent));
            }
        }
        file.flush().await?;
        drop(file);

        if downloaded == 0 {
            return Err(AppError::Download(format!("Empty response body from {}", url)));
        }

        let path = persist_staged(staged, &dir.join(file_name))?;
        log::info!("✅ [HTTP] Saved {} bytes to {:?}", downloaded, path);
        Ok(path)
    }

    /// Whole body in memory along with its content type.
    pub async fn fetch_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Download(format!("HTTP {} for {}", response.status(), url)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let bytes = response.bytes().await?;
        Ok((bytes.to_vec(), content_type))
    }
}

/// Tracks the last reported 20% bucket so progress is not spammed.
#[derive(Debug, Default)]
pub struct ProgressSteps {
    last_bucket: Option<u64>,
}

impl ProgressSteps {
    /// Returns the percentage to report when `downloaded` enters a new bucket.
    pub fn update(&mut self, downloaded: u64, total: u64) -> Option<u64> {
        if total == 0 {
            return None;
        }
        let percent = (downloaded.min(total) * 100) / total;
        let bucket = percent / 20;
        if self.last_bucket.map_or(true, |last| bucket > last) {
            self.last_bucket = Some(bucket);
            Some(bucket * 20)
        } else {
            None
        }
    }
}
