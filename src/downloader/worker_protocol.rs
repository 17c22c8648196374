//! Wire format of the remote worker.
//!
//! `POST /v1/download` answers with newline-delimited JSON frames. Chunk
//! payloads are base64. Frames of one kind arrive in order, but metadata and
//! the two chunk streams may interleave arbitrarily.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use url::Url;

use crate::config::WorkerConfig;
use crate::errors::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub url: String,
    pub is_audio: bool,
    /// 0 means "best available".
    pub target_height: u32,
    pub cookies_blob: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerMetadata {
    pub title: String,
    pub uploader: String,
    pub webpage_url: String,
    pub duration: u64,
    pub width: u32,
    pub height: u32,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerFrame {
    Metadata(WorkerMetadata),
    ThumbnailChunk(#[serde(with = "base64_bytes")] Vec<u8>),
    MediaChunk(#[serde(with = "base64_bytes")] Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub success: bool,
    #[serde(default)]
    pub new_version: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WorkerFrame>> + Send>>;

#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn download_media(&self, request: WorkerRequest) -> Result<FrameStream>;
    async fn get_version(&self) -> Result<String>;
    async fn update_tool(&self) -> Result<UpdateOutcome>;
}

struct LineState<S> {
    inner: Pin<Box<S>>,
    buffer: Vec<u8>,
    done: bool,
}

fn parse_frame(line: &[u8]) -> Result<WorkerFrame> {
    serde_json::from_slice(line).map_err(|e| AppError::Worker(format!("malformed frame: {}", e)))
}

/// Splits a byte stream into NDJSON frames. A transport error ends the stream.
pub fn decode_frames<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<AppError> + Send + 'static,
{
    let state = LineState {
        inner: Box::pin(bytes),
        buffer: Vec::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                return Some((parse_frame(&line), state));
            }

            if state.done {
                if state.buffer.iter().all(|b| b.is_ascii_whitespace()) {
                    return None;
                }
                let line = std::mem::take(&mut state.buffer);
                return Some((parse_frame(&line), state));
            }

            match state.inner.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.done = true;
                    state.buffer.clear();
                    return Some((Err(e.into()), state));
                }
                None => state.done = true,
            }
        }
    }))
}

#[derive(Deserialize)]
struct VersionResponse {
    version: String,
}

pub struct HttpWorkerTransport {
    base: Url,
    client: reqwest::Client,
}

impl HttpWorkerTransport {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let base = Url::parse(&config.address)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { base, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(AppError::Worker(format!("worker returned {}: {}", status, body.trim())))
    }
}

#[async_trait]
impl WorkerTransport for HttpWorkerTransport {
    async fn download_media(&self, request: WorkerRequest) -> Result<FrameStream> {
        let response = self
            .client
            .post(self.endpoint("/v1/download")?)
            .json(&request)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(decode_frames(response.bytes_stream()))
    }

    async fn get_version(&self) -> Result<String> {
        let response = self.client.get(self.endpoint("/v1/version")?).send().await?;
        let version: VersionResponse = Self::check(response).await?.json().await?;
        Ok(version.version)
    }

    async fn update_tool(&self) -> Result<UpdateOutcome> {
        let response = self.client.post(self.endpoint("/v1/update")?).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: Vec<std::result::Result<&'static str, AppError>>) -> FrameStream {
        decode_frames(stream::iter(parts))
    }

    #[test]
    fn frames_use_snake_case_tags_and_base64() {
        let frame = WorkerFrame::MediaChunk(b"abc".to_vec());
        assert_eq!(serde_json::to_string(&frame).unwrap(), r#"{"media_chunk":"YWJj"}"#);

        let parsed: WorkerFrame = serde_json::from_str(r#"{"metadata":{"title":"t","filename":"a.mp4"}}"#).unwrap();
        match parsed {
            WorkerFrame::Metadata(meta) => {
                assert_eq!(meta.title, "t");
                assert_eq!(meta.duration, 0);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_reassembled() {
        let frames: Vec<_> = chunks(vec![
            Ok("{\"media_chunk\":\"YW"),
            Ok("Jj\"}\n\n{\"thumbnail_chunk\":\"eA==\"}\n{\"media"),
            Ok("_chunk\":\"eQ==\"}"),
        ])
        .collect()
        .await;

        let frames: Vec<WorkerFrame> = frames.into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(
            frames,
            vec![
                WorkerFrame::MediaChunk(b"abc".to_vec()),
                WorkerFrame::ThumbnailChunk(b"x".to_vec()),
                WorkerFrame::MediaChunk(b"y".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn transport_error_ends_the_stream() {
        let frames: Vec<_> = chunks(vec![
            Ok("{\"media_chunk\":\"YWJj\"}\n{\"media_ch"),
            Err(AppError::Worker("connection reset".into())),
            Ok("unreachable\n"),
        ])
        .collect()
        .await;

        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert!(frames[1].is_err());
    }

    #[tokio::test]
    async fn garbage_line_is_an_error() {
        let frames: Vec<_> = chunks(vec![Ok("not json\n")]).collect().await;
        assert!(matches!(frames[0], Err(AppError::Worker(_))));
    }
}
