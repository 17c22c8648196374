pub mod cobalt;
pub mod local_extractor;
pub mod remote_worker;
pub mod slideshow;

// Re-export backends for easy access
pub use cobalt::CobaltBackend;
pub use local_extractor::{LocalExtractionBackend, LocalExtractor, YtDlpTool};
pub use remote_worker::RemoteWorkerBackend;
pub use slideshow::SlideshowScraper;
