pub mod chain;
pub mod codec;
pub mod http_pool;
pub mod strategies;
pub mod worker_protocol;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use thiserror::Error;

use crate::credentials::CredentialSnapshot;
use crate::errors::{AppError, Result};
use crate::normalizer::NormalizedUrl;
use crate::progress::ProgressReporter;
use crate::utils::{remove_quietly, short_id};

pub use chain::{BackendId, FallbackChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionRequest {
    pub url: String,
    pub media_kind: MediaKind,
    pub target_height: Option<u32>,
}

impl AcquisitionRequest {
    pub fn video(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            media_kind: MediaKind::Video,
            target_height: None,
        }
    }

    pub fn audio(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            media_kind: MediaKind::Audio,
            target_height: None,
        }
    }

    pub fn with_height(mut self, height: u32) -> Self {
        self.target_height = Some(height);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    pub uploader: String,
    pub source_url: String,
    pub duration_seconds: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MediaPaths {
    Single(PathBuf),
    /// Slideshow images in order, optionally followed by one audio track.
    Set(Vec<PathBuf>),
}

/// Final result of an acquisition. The caller owns (and eventually deletes) its files.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquiredArtifact {
    pub media: MediaPaths,
    pub thumbnail: Option<PathBuf>,
    pub metadata: MediaMetadata,
}

impl AcquiredArtifact {
    pub fn files(&self) -> Vec<&Path> {
        let mut files: Vec<&Path> = match &self.media {
            MediaPaths::Single(path) => vec![path.as_path()],
            MediaPaths::Set(paths) => paths.iter().map(|p| p.as_path()).collect(),
        };
        if let Some(thumbnail) = &self.thumbnail {
            files.push(thumbnail);
        }
        files
    }

    pub fn remove_files(&self) {
        for file in self.files() {
            remove_quietly(file);
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendFailure {
    /// Network blips, blocks, codec mismatches, stream errors.
    #[error("{0}")]
    Retryable(String),
    /// Structural mismatch such as "no media in post".
    #[error("{0}")]
    Fatal(String),
}

impl BackendFailure {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendFailure::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            BackendFailure::Retryable(message) | BackendFailure::Fatal(message) => message,
        }
    }
}

impl From<AppError> for BackendFailure {
    fn from(error: AppError) -> Self {
        BackendFailure::Retryable(error.to_string())
    }
}

pub type BackendOutcome = std::result::Result<AcquiredArtifact, BackendFailure>;

/// One failed attempt, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptFailure {
    pub index: usize,
    pub backend: BackendId,
    pub fatal: bool,
    pub message: String,
}

/// Everything a backend sees during one attempt.
pub struct AttemptContext<'a> {
    pub request: &'a AcquisitionRequest,
    pub target: &'a NormalizedUrl,
    pub credentials: &'a CredentialSnapshot,
    pub progress: &'a ProgressReporter,
}

#[async_trait]
pub trait AcquisitionBackend: Send + Sync {
    fn id(&self) -> BackendId;

    /// Must leave no files behind unless it returns `Ok`.
    async fn acquire(&self, ctx: &AttemptContext<'_>) -> BackendOutcome;
}

/// Creates `<dir>/<stem><suffix>` exclusively. The file is removed when the
/// returned [`TempPath`] drops unless it is persisted or kept.
pub fn stage_file(dir: &Path, stem: &str, suffix: &str) -> Result<(tokio::fs::File, TempPath)> {
    let staged = tempfile::Builder::new()
        .prefix(stem)
        .suffix(suffix)
        .rand_bytes(0)
        .tempfile_in(dir)?;
    let (file, path) = staged.into_parts();
    Ok((tokio::fs::File::from_std(file), path))
}

/// Moves a staged file to `dest` without replacing anything. When the name
/// is taken the file lands at `<stem>_<token>.<ext>` instead.
pub fn persist_staged(staged: TempPath, dest: &Path) -> Result<PathBuf> {
    let mut staged = staged;
    let mut candidate = dest.to_path_buf();
    for _ in 0..8 {
        match staged.persist_noclobber(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                staged = e.path;
                candidate = with_token(dest, &short_id());
            }
            Err(e) => return Err(AppError::Io(e.error)),
        }
    }
    Err(AppError::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name next to {:?}", dest),
    )))
}

fn with_token(dest: &Path, token: &str) -> PathBuf {
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match dest.extension() {
        Some(ext) => format!("{}_{}.{}", stem, token, ext.to_string_lossy()),
        None => format!("{}_{}", stem, token),
    };
    dest.with_file_name(name)
}

/// Finished files of an attempt that is still running. Dropping the set
/// removes them; [`PendingFiles::release`] hands them over.
#[derive(Debug, Default)]
pub struct PendingFiles {
    paths: Vec<PathBuf>,
}

impl PendingFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn release(mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.paths)
    }
}

impl Drop for PendingFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            remove_quietly(path);
        }
    }
}
