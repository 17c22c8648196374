pub mod config;
pub mod credentials;
pub mod downloader;
pub mod errors;
pub mod normalizer;
pub mod progress;
pub mod utils;

pub use config::AppConfig;
pub use downloader::{AcquiredArtifact, AcquisitionRequest, FallbackChain, MediaKind};
pub use errors::{AppError, Result};
pub use progress::ProgressReporter;
