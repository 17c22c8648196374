//! The orchestrator: runs backends in priority order until one succeeds.

use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::credentials::{CookieStore, CredentialProvider, JsonFileCookieStore, NoCookieStore, SystemClock};
use crate::errors::{AppError, Result};
use crate::normalizer::{ContentShape, HttpRedirectResolver, Platform, UrlNormalizer};
use crate::progress::{ProgressReporter, StatusPool, START_MESSAGES};

use super::codec::{CodecGate, CodecPolicy};
use super::http_pool::HttpPool;
use super::strategies::{
    CobaltBackend, LocalExtractionBackend, LocalExtractor, RemoteWorkerBackend, SlideshowScraper, YtDlpTool,
};
use super::{AcquiredArtifact, AcquisitionBackend, AcquisitionRequest, AttemptContext, AttemptFailure, BackendFailure, MediaKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackendId {
    SlideshowScraper,
    LocalDirect,
    LocalProxy,
    DownloadApi,
    RemoteWorker,
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendId::SlideshowScraper => "slideshow-scraper",
            BackendId::LocalDirect => "local-direct",
            BackendId::LocalProxy => "local-proxy",
            BackendId::DownloadApi => "cobalt",
            BackendId::RemoteWorker => "remote-worker",
        };
        f.write_str(name)
    }
}

/// Priority order for a request, before unavailable backends are dropped.
pub fn plan_chain(platform: Platform, kind: MediaKind, shape: ContentShape) -> Vec<BackendId> {
    use BackendId::*;

    // Audio from a slideshow is its soundtrack, not the images.
    if shape == ContentShape::Slideshow && kind == MediaKind::Video {
        return vec![SlideshowScraper, DownloadApi, RemoteWorker];
    }
    match (kind, platform) {
        (MediaKind::Audio, _) => vec![RemoteWorker, DownloadApi],
        (MediaKind::Video, Platform::YouTube) => vec![RemoteWorker, DownloadApi],
        (MediaKind::Video, _) => vec![LocalDirect, LocalProxy, DownloadApi, RemoteWorker],
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct FallbackChain {
    normalizer: UrlNormalizer,
    credentials: Arc<CredentialProvider>,
    backends: HashMap<BackendId, Arc<dyn AcquisitionBackend>>,
    deadline: Duration,
    start_messages: StatusPool,
}

impl FallbackChain {
    pub fn new(normalizer: UrlNormalizer, credentials: Arc<CredentialProvider>) -> Self {
        Self {
            normalizer,
            credentials,
            backends: HashMap::new(),
            deadline: Duration::from_secs(900),
            start_messages: StatusPool::new(START_MESSAGES),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn AcquisitionBackend>) -> Self {
        self.backends.insert(backend.id(), backend);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_start_messages(mut self, messages: StatusPool) -> Self {
        self.start_messages = messages;
        self
    }

    /// Wires every enabled backend from configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.ensure_dirs()?;

        let resolver = HttpRedirectResolver::new(Duration::from_secs(config.redirect_timeout_secs))?;
        let store: Arc<dyn CookieStore> = match &config.cookies.store_path {
            Some(path) => Arc::new(JsonFileCookieStore::new(path)),
            None => Arc::new(NoCookieStore),
        };
        let credentials = Arc::new(CredentialProvider::new(
            config.cookies.content.clone(),
            store,
            Arc::new(SystemClock),
            config.cookie_file_path(),
        ));

        let gate = Arc::new(CodecGate::from_tools(&config.tools));
        let remote_policy = CodecPolicy::for_remote(&config.transcoding);
        let http = Arc::new(HttpPool::new(10, config.cobalt.timeout_secs.max(config.slideshow.timeout_secs))?);
        let downloads = config.downloads_dir.clone();

        let mut chain = FallbackChain::new(UrlNormalizer::new(Box::new(resolver)), credentials)
            .with_deadline(Duration::from_secs(config.acquisition_deadline_secs));

        let extractor = Arc::new(LocalExtractor::new(
            Arc::new(YtDlpTool::new(&config.tools)),
            gate.clone(),
            downloads.clone(),
            config.identities.clone(),
            config.proxy.clone(),
        ));
        chain = chain.with_backend(Arc::new(LocalExtractionBackend::direct(extractor.clone())));
        if extractor.has_proxy() {
            chain = chain.with_backend(Arc::new(LocalExtractionBackend::proxied(extractor)));
        }

        if config.cobalt.enabled {
            chain = chain.with_backend(Arc::new(CobaltBackend::new(
                config.cobalt.clone(),
                http.clone(),
                gate.clone(),
                remote_policy,
                downloads.clone(),
            )));
        }
        if config.slideshow.enabled {
            chain = chain.with_backend(Arc::new(SlideshowScraper::new(
                config.slideshow.clone(),
                http,
                downloads,
            )));
        }
        if config.worker.enabled {
            chain = chain.with_backend(Arc::new(RemoteWorkerBackend::from_config(config, gate)?));
        }

        log::info!("[CHAIN] Registered backends: {:?}", chain.registered());
        Ok(chain)
    }

    pub fn registered(&self) -> Vec<BackendId> {
        let mut ids: Vec<BackendId> = self.backends.keys().copied().collect();
        ids.sort_by_key(|id| *id as u8);
        ids
    }

    /// Normalizes the URL once, then tries each planned backend in turn.
    pub async fn acquire(&self, request: &AcquisitionRequest, progress: &ProgressReporter) -> Result<AcquiredArtifact> {
        progress.report(self.start_messages.pick());

        let target = self.normalizer.normalize(&request.url).await?;
        let credentials = match self.credentials.refresh().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("❌ [COOKIES] Refresh failed, using last snapshot: {}", e);
                self.credentials.current().await
            }
        };

        let plan: Vec<(BackendId, Arc<dyn AcquisitionBackend>)> =
            plan_chain(target.platform, request.media_kind, target.shape)
                .into_iter()
                .filter_map(|id| self.backends.get(&id).map(|backend| (id, backend.clone())))
                .collect();

        if plan.is_empty() {
            return Err(AppError::AllBackendsExhausted {
                attempts: Vec::new(),
                last_error: format!("No backend available for {} {:?}", target.platform, request.media_kind),
            });
        }

        let started = Instant::now();
        let total = plan.len();
        let mut attempts: Vec<AttemptFailure> = Vec::new();

        for (index, (id, backend)) in plan.into_iter().enumerate() {
            let remaining = self.deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                attempts.push(AttemptFailure {
                    index,
                    backend: id,
                    fatal: false,
                    message: "deadline exceeded".to_string(),
                });
                break;
            }

            log::info!("🚀 [CHAIN] Attempt {}/{} with {} for {}", index + 1, total, id, target.as_str());
            let ctx = AttemptContext {
                request,
                target: &target,
                credentials: &credentials,
                progress,
            };

            let attempt = AssertUnwindSafe(backend.acquire(&ctx)).catch_unwind();
            let (failure, out_of_time) = match tokio::time::timeout(remaining, attempt).await {
                Ok(Ok(Ok(artifact))) => {
                    log::info!("✅ [CHAIN] Attempt {}/{} with {} succeeded", index + 1, total, id);
                    return Ok(artifact);
                }
                Ok(Ok(Err(failure))) => (failure, false),
                Ok(Err(payload)) => (
                    BackendFailure::Retryable(format!("backend panicked: {}", panic_message(&*payload))),
                    false,
                ),
                Err(_) => (BackendFailure::Retryable("deadline exceeded".to_string()), true),
            };

            log::warn!(
                "⚠️ [CHAIN] Attempt {}/{} with {} failed ({}): {}",
                index + 1,
                total,
                id,
                if failure.is_fatal() { "fatal" } else { "retryable" },
                failure.message()
            );
            attempts.push(AttemptFailure {
                index,
                backend: id,
                fatal: failure.is_fatal(),
                message: failure.message().to_string(),
            });
            if out_of_time {
                break;
            }
        }

        let last_error = attempts.last().map(|a| a.message.clone()).unwrap_or_default();
        log::error!("❌ [CHAIN] All backends failed for {}: {}", target.as_str(), last_error);
        Err(AppError::AllBackendsExhausted { attempts, last_error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Clock;
    use crate::downloader::{BackendOutcome, MediaMetadata, MediaPaths};
    use crate::normalizer::RedirectResolver;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use url::Url;

    struct NoRedirects;

    #[async_trait]
    impl RedirectResolver for NoRedirects {
        async fn resolve(&self, _url: &Url) -> Option<Url> {
            None
        }
    }

    enum Behavior {
        Succeed,
        Retry,
        Fatal,
        Panic,
        Hang,
    }

    struct StubBackend {
        id: BackendId,
        behavior: Behavior,
        calls: Arc<Mutex<Vec<BackendId>>>,
    }

    #[async_trait]
    impl AcquisitionBackend for StubBackend {
        fn id(&self) -> BackendId {
            self.id
        }

        async fn acquire(&self, _ctx: &AttemptContext<'_>) -> BackendOutcome {
            self.calls.lock().unwrap().push(self.id);
            match self.behavior {
                Behavior::Succeed => Ok(AcquiredArtifact {
                    media: MediaPaths::Single(PathBuf::from(format!("{}.mp4", self.id))),
                    thumbnail: None,
                    metadata: MediaMetadata::default(),
                }),
                Behavior::Retry => Err(BackendFailure::Retryable(format!("{} blocked", self.id))),
                Behavior::Fatal => Err(BackendFailure::Fatal(format!("{} found nothing", self.id))),
                Behavior::Panic => panic!("{} exploded", self.id),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(BackendFailure::Retryable("unreachable".into()))
                }
            }
        }
    }

    fn chain(setup: Vec<(BackendId, Behavior)>) -> (FallbackChain, Arc<Mutex<Vec<BackendId>>>) {
        let dir = std::env::temp_dir().join(format!("chain-test-{}", crate::utils::short_id()));
        let credentials = Arc::new(CredentialProvider::new(
            None,
            Arc::new(NoCookieStore),
            Arc::new(SystemClock) as Arc<dyn Clock>,
            dir.join("cookies.txt"),
        ));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut chain = FallbackChain::new(UrlNormalizer::new(Box::new(NoRedirects)), credentials)
            .with_start_messages(StatusPool::new(&["go"]));
        for (id, behavior) in setup {
            chain = chain.with_backend(Arc::new(StubBackend {
                id,
                behavior,
                calls: calls.clone(),
            }));
        }
        (chain, calls)
    }

    #[test]
    fn plans_follow_platform_and_shape() {
        use BackendId::*;
        assert_eq!(
            plan_chain(Platform::TikTok, MediaKind::Video, ContentShape::Slideshow),
            vec![SlideshowScraper, DownloadApi, RemoteWorker]
        );
        assert_eq!(
            plan_chain(Platform::TikTok, MediaKind::Video, ContentShape::Single),
            vec![LocalDirect, LocalProxy, DownloadApi, RemoteWorker]
        );
        assert_eq!(plan_chain(Platform::YouTube, MediaKind::Video, ContentShape::Single), vec![RemoteWorker, DownloadApi]);
        assert_eq!(plan_chain(Platform::Instagram, MediaKind::Audio, ContentShape::Single), vec![RemoteWorker, DownloadApi]);
    }

    #[test]
    fn audio_from_a_slideshow_skips_the_scraper() {
        assert_eq!(
            plan_chain(Platform::TikTok, MediaKind::Audio, ContentShape::Slideshow),
            vec![BackendId::RemoteWorker, BackendId::DownloadApi]
        );
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let (chain, calls) = chain(vec![
            (BackendId::LocalDirect, Behavior::Retry),
            (BackendId::DownloadApi, Behavior::Succeed),
            (BackendId::RemoteWorker, Behavior::Succeed),
        ]);
        let (progress, mut rx) = ProgressReporter::channel();

        let artifact = chain
            .acquire(&AcquisitionRequest::video("https://www.tiktok.com/@u/video/1"), &progress)
            .await
            .unwrap();

        assert_eq!(artifact.media, MediaPaths::Single(PathBuf::from("cobalt.mp4")));
        // LocalProxy is planned but not registered
        assert_eq!(*calls.lock().unwrap(), vec![BackendId::LocalDirect, BackendId::DownloadApi]);
        assert_eq!(rx.recv().await.unwrap(), "go");
    }

    #[tokio::test]
    async fn fatal_and_panics_still_advance() {
        let (chain, calls) = chain(vec![
            (BackendId::LocalDirect, Behavior::Fatal),
            (BackendId::LocalProxy, Behavior::Panic),
            (BackendId::DownloadApi, Behavior::Retry),
            (BackendId::RemoteWorker, Behavior::Retry),
        ]);

        let err = chain
            .acquire(&AcquisitionRequest::video("https://vimeo.com/1"), &ProgressReporter::silent())
            .await
            .unwrap_err();

        assert_eq!(calls.lock().unwrap().len(), 4);
        match err {
            AppError::AllBackendsExhausted { attempts, last_error } => {
                assert_eq!(attempts.len(), 4);
                assert!(attempts[0].fatal);
                assert!(attempts[1].message.contains("exploded"));
                assert_eq!(attempts[3].backend, BackendId::RemoteWorker);
                assert_eq!(last_error, "remote-worker blocked");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_the_chain() {
        let (chain, calls) = chain(vec![
            (BackendId::RemoteWorker, Behavior::Hang),
            (BackendId::DownloadApi, Behavior::Succeed),
        ]);
        let chain = chain.with_deadline(Duration::from_secs(60));

        let err = chain
            .acquire(&AcquisitionRequest::audio("https://www.youtube.com/watch?v=abc"), &ProgressReporter::silent())
            .await
            .unwrap_err();

        assert_eq!(*calls.lock().unwrap(), vec![BackendId::RemoteWorker]);
        assert!(matches!(err, AppError::AllBackendsExhausted { ref last_error, .. } if last_error == "deadline exceeded"));
    }

    #[tokio::test]
    async fn invalid_url_fails_before_any_backend() {
        let (chain, calls) = chain(vec![(BackendId::LocalDirect, Behavior::Succeed)]);
        let err = chain
            .acquire(&AcquisitionRequest::video("not a url at all"), &ProgressReporter::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidUrl(_)));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_plan_is_exhausted() {
        let (chain, _) = chain(vec![(BackendId::LocalDirect, Behavior::Succeed)]);
        let err = chain
            .acquire(&AcquisitionRequest::audio("https://vimeo.com/1"), &ProgressReporter::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AllBackendsExhausted { ref attempts, .. } if attempts.is_empty()));
    }
}
