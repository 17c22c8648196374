use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use media_fetcher::downloader::codec::CodecGate;
use media_fetcher::downloader::strategies::RemoteWorkerBackend;
use media_fetcher::{AcquisitionRequest, AppConfig, FallbackChain, ProgressReporter};

#[derive(Parser, Debug)]
#[clap(name = "media-fetcher", version, about = "Fetch chat-ready media from a content URL")]
struct Cli {
    /// JSON config file (defaults to the user config dir)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire media for a URL and print the artifact as JSON
    Fetch {
        url: String,

        /// Extract audio instead of video
        #[clap(long, default_value = "false")]
        audio: bool,

        /// Maximum video height
        #[clap(long)]
        height: Option<u32>,
    },
    /// Print the remote worker's extractor version
    WorkerVersion,
    /// Ask the remote worker to update its extractor
    WorkerUpdate,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(Some(path)),
        None => AppConfig::load(),
    };
    config.context("Failed to load configuration")
}

fn remote_worker(config: &AppConfig) -> anyhow::Result<RemoteWorkerBackend> {
    let gate = Arc::new(CodecGate::from_tools(&config.tools));
    RemoteWorkerBackend::from_config(config, gate).context("Failed to set up the remote worker client")
}

fn spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

async fn fetch(config: AppConfig, url: String, audio: bool, height: Option<u32>) -> anyhow::Result<()> {
    let chain = FallbackChain::from_config(&config)?;

    let mut request = if audio {
        AcquisitionRequest::audio(url)
    } else {
        AcquisitionRequest::video(url)
    };
    if let Some(height) = height {
        request = request.with_height(height);
    }

    let bar = spinner();
    let (progress, mut updates) = ProgressReporter::channel();
    let status_bar = bar.clone();
    let printer = tokio::spawn(async move {
        while let Some(status) = updates.recv().await {
            status_bar.set_message(status);
        }
    });

    let result = chain.acquire(&request, &progress).await;
    drop(progress);
    let _ = printer.await;
    bar.finish_and_clear();

    match result {
        Ok(artifact) => {
            println!("{}", serde_json::to_string_pretty(&artifact)?);
            Ok(())
        }
        Err(e) => {
            log::error!("❌ Acquisition failed ({:?}): {}", e.hint(), e);
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    info!("Configuration loaded (downloads: {:?})", config.downloads_dir);

    match cli.command {
        Command::Fetch { url, audio, height } => fetch(config, url, audio, height).await,
        Command::WorkerVersion => {
            let worker = remote_worker(&config)?;
            println!("{}", worker.worker_version().await?);
            Ok(())
        }
        Command::WorkerUpdate => {
            let worker = remote_worker(&config)?;
            let outcome = worker.update_worker_tool().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
    }
}
