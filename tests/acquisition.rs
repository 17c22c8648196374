use async_trait::async_trait;
use axum::{http::StatusCode, routing::get, Json, Router};
use serde_json::json;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use url::Url;

use media_fetcher::config::{default_identities, SlideshowConfig};
use media_fetcher::credentials::{CredentialProvider, NoCookieStore, SystemClock};
use media_fetcher::downloader::codec::{CodecGate, MediaProber, Transcoder};
use media_fetcher::downloader::http_pool::HttpPool;
use media_fetcher::downloader::strategies::local_extractor::{
    ExtractedInfo, ExtractorError, ExtractorErrorKind, ExtractorInvocation, ExtractorTool,
};
use media_fetcher::downloader::strategies::{LocalExtractionBackend, LocalExtractor, SlideshowScraper};
use media_fetcher::downloader::{
    AcquiredArtifact, AcquisitionBackend, AttemptContext, BackendFailure, BackendId, BackendOutcome, MediaMetadata,
    MediaPaths,
};
use media_fetcher::normalizer::{RedirectResolver, UrlNormalizer};
use media_fetcher::{AcquisitionRequest, FallbackChain, ProgressReporter};

struct NoRedirects;

#[async_trait]
impl RedirectResolver for NoRedirects {
    async fn resolve(&self, _url: &Url) -> Option<Url> {
        None
    }
}

struct FixedProber(&'static str);

#[async_trait]
impl MediaProber for FixedProber {
    async fn video_codec(&self, _path: &Path) -> media_fetcher::Result<Option<String>> {
        Ok(Some(self.0.to_string()))
    }
}

struct NoTranscoder;

#[async_trait]
impl Transcoder for NoTranscoder {
    async fn transcode_to_h264(&self, _input: &Path, _output: &Path) -> media_fetcher::Result<()> {
        panic!("local extraction never transcodes");
    }
}

/// Stands in for yt-dlp: follows a script and writes into the output template.
struct FakeYtDlp {
    script: Mutex<VecDeque<Option<ExtractorErrorKind>>>,
    runs: Mutex<usize>,
}

impl FakeYtDlp {
    fn new(script: Vec<Option<ExtractorErrorKind>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            runs: Mutex::new(0),
        })
    }

    fn runs(&self) -> usize {
        *self.runs.lock().unwrap()
    }
}

#[async_trait]
impl ExtractorTool for FakeYtDlp {
    async fn run(&self, invocation: &ExtractorInvocation) -> Result<ExtractedInfo, ExtractorError> {
        *self.runs.lock().unwrap() += 1;
        let template = invocation.output_template.to_string_lossy().to_string();
        let write = |ext: &str, size: usize| {
            std::fs::write(template.replace("%(id)s", "7301").replace("%(ext)s", ext), vec![0u8; size]).unwrap();
        };
        write("mp4.part", 16);

        match self.script.lock().unwrap().pop_front().flatten() {
            Some(kind) => Err(ExtractorError::new(kind, "ERROR: HTTP Error 403: Forbidden")),
            None => {
                write("mp4", 4096);
                Ok(ExtractedInfo {
                    id: Some("7301".into()),
                    title: Some("dance".into()),
                    ..Default::default()
                })
            }
        }
    }
}

/// Records that it ran and succeeds or fails on demand.
struct StubBackend {
    id: BackendId,
    succeed: bool,
    calls: Arc<Mutex<Vec<BackendId>>>,
}

#[async_trait]
impl AcquisitionBackend for StubBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    async fn acquire(&self, _ctx: &AttemptContext<'_>) -> BackendOutcome {
        self.calls.lock().unwrap().push(self.id);
        if self.succeed {
            Ok(AcquiredArtifact {
                media: MediaPaths::Single(PathBuf::from("stub.mp4")),
                thumbnail: None,
                metadata: MediaMetadata::default(),
            })
        } else {
            Err(BackendFailure::Retryable("stub failure".into()))
        }
    }
}

fn base_chain(data_dir: &Path) -> FallbackChain {
    let credentials = Arc::new(CredentialProvider::new(
        None,
        Arc::new(NoCookieStore),
        Arc::new(SystemClock),
        data_dir.join("cookies.txt"),
    ));
    FallbackChain::new(UrlNormalizer::new(Box::new(NoRedirects)), credentials)
}

fn local_backend(tool: Arc<FakeYtDlp>, downloads: &Path, codec: &'static str) -> Arc<LocalExtractionBackend> {
    let gate = Arc::new(CodecGate::new(Arc::new(FixedProber(codec)), Arc::new(NoTranscoder)));
    let extractor = LocalExtractor::new(tool, gate, downloads.to_path_buf(), default_identities(), None);
    Arc::new(LocalExtractionBackend::direct(Arc::new(extractor)))
}

fn stub(id: BackendId, succeed: bool, calls: &Arc<Mutex<Vec<BackendId>>>) -> Arc<StubBackend> {
    Arc::new(StubBackend {
        id,
        succeed,
        calls: calls.clone(),
    })
}

fn dir_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
    files.sort();
    files
}

#[tokio::test]
async fn tiktok_video_is_served_by_local_extraction_alone() {
    let downloads = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let tool = FakeYtDlp::new(vec![None]);

    let chain = base_chain(data.path())
        .with_backend(local_backend(tool.clone(), downloads.path(), "h264"))
        .with_backend(stub(BackendId::DownloadApi, true, &calls))
        .with_backend(stub(BackendId::RemoteWorker, true, &calls));

    let artifact = chain
        .acquire(
            &AcquisitionRequest::video("https://www.tiktok.com/@dancer/video/7301?is_from_webapp=1"),
            &ProgressReporter::silent(),
        )
        .await
        .unwrap();

    assert_eq!(tool.runs(), 1);
    assert!(calls.lock().unwrap().is_empty());
    let MediaPaths::Single(path) = &artifact.media else { panic!("expected a single file") };
    assert_eq!(dir_files(downloads.path()), vec![path.clone()]);
    assert_eq!(artifact.metadata.title, "dance");
}

#[tokio::test]
async fn identity_rotation_recovers_from_blocks() {
    let downloads = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let tool = FakeYtDlp::new(vec![Some(ExtractorErrorKind::Blocked), Some(ExtractorErrorKind::Blocked), None]);

    let chain = base_chain(data.path())
        .with_backend(local_backend(tool.clone(), downloads.path(), "h264"))
        .with_backend(stub(BackendId::DownloadApi, true, &calls));

    let artifact = chain
        .acquire(&AcquisitionRequest::video("https://vimeo.com/76979871"), &ProgressReporter::silent())
        .await
        .unwrap();

    assert_eq!(tool.runs(), 3);
    assert!(calls.lock().unwrap().is_empty());
    let MediaPaths::Single(path) = &artifact.media else { panic!("expected a single file") };
    assert_eq!(dir_files(downloads.path()), vec![path.clone()]);
}

#[tokio::test]
async fn codec_mismatch_falls_through_to_the_next_backend() {
    let downloads = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let tool = FakeYtDlp::new(vec![None]);

    let chain = base_chain(data.path())
        .with_backend(local_backend(tool, downloads.path(), "hevc"))
        .with_backend(stub(BackendId::DownloadApi, false, &calls))
        .with_backend(stub(BackendId::RemoteWorker, true, &calls));

    let artifact = chain
        .acquire(&AcquisitionRequest::video("https://www.instagram.com/reel/abc/"), &ProgressReporter::silent())
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![BackendId::DownloadApi, BackendId::RemoteWorker]);
    assert_eq!(artifact.media, MediaPaths::Single(PathBuf::from("stub.mp4")));
    assert!(dir_files(downloads.path()).is_empty());
}

fn png() -> Vec<u8> {
    let image = image::RgbImage::from_pixel(8, 8, image::Rgb([10, 200, 30]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

async fn serve_slideshow() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let api_base = base.clone();

    let router = Router::new()
        .route(
            "/api/",
            get(move || {
                let base = api_base.clone();
                async move {
                    Json(json!({
                        "code": 0,
                        "msg": "success",
                        "data": {
                            "images": [format!("{}/img/1", base), format!("{}/img/2", base), format!("{}/img/3", base)],
                            "music": format!("{}/music", base),
                            "title": "three pics",
                            "author": {"unique_id": "poster"}
                        }
                    }))
                }
            }),
        )
        .route("/img/:n", get(|| async { png() }))
        .route("/music", get(|| async { vec![5u8; 512] }))
        .fallback(|| async { StatusCode::NOT_FOUND });

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    base
}

#[tokio::test]
async fn tiktok_slideshow_yields_images_then_audio() {
    let downloads = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let base = serve_slideshow().await;

    let scraper = SlideshowScraper::new(
        SlideshowConfig {
            api_url: format!("{}/api/", base),
            ..SlideshowConfig::default()
        },
        Arc::new(HttpPool::new(4, 10).unwrap()),
        downloads.path().to_path_buf(),
    );
    let chain = base_chain(data.path())
        .with_backend(Arc::new(scraper))
        .with_backend(stub(BackendId::DownloadApi, true, &calls))
        .with_backend(stub(BackendId::LocalDirect, true, &calls));

    let (progress, mut updates) = ProgressReporter::channel();
    let artifact = chain
        .acquire(&AcquisitionRequest::video("https://www.tiktok.com/@poster/photo/7350?lang=en"), &progress)
        .await
        .unwrap();

    assert!(calls.lock().unwrap().is_empty());
    let MediaPaths::Set(paths) = &artifact.media else { panic!("expected a file set") };
    let extensions: Vec<String> = paths
        .iter()
        .map(|p| p.extension().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(extensions, vec!["jpg", "jpg", "jpg", "mp3"]);
    assert_eq!(artifact.metadata.uploader, "poster");
    assert_eq!(dir_files(downloads.path()).len(), 4);

    drop(progress);
    let mut statuses = Vec::new();
    while let Some(status) = updates.recv().await {
        statuses.push(status);
    }
    assert!(statuses.len() >= 2, "start message and image progress expected: {:?}", statuses);
}
