use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::errors::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub downloads_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Outbound proxy used by the local extractor's proxied attempt.
    pub proxy: Option<String>,
    pub cookies: CookieConfig,
    pub cobalt: CobaltConfig,
    pub slideshow: SlideshowConfig,
    pub worker: WorkerConfig,
    pub tools: ToolPaths,
    pub transcoding: TranscodingConfig,
    pub identities: Vec<IdentityProfile>,
    pub redirect_timeout_secs: u64,
    pub acquisition_deadline_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CookieConfig {
    /// Netscape cookie jar text shipped with the deployment.
    pub content: Option<String>,
    /// JSON file holding operator overrides, newest record wins.
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CobaltConfig {
    pub enabled: bool,
    pub api_url: String,
    pub api_key: Option<String>,
    pub video_quality: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SlideshowConfig {
    pub enabled: bool,
    pub api_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub address: String,
    pub timeout_secs: u64,
    pub ticker_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ToolPaths {
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub socket_timeout_secs: u64,
    pub extraction_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TranscodingConfig {
    pub enabled: bool,
}

/// Browser user agent paired with a yt-dlp impersonation target.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IdentityProfile {
    pub user_agent: String,
    pub impersonate: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let base = PathBuf::from(".");
        Self {
            downloads_dir: base.join("downloads"),
            data_dir: base.join("data"),
            proxy: None,
            cookies: CookieConfig::default(),
            cobalt: CobaltConfig::default(),
            slideshow: SlideshowConfig::default(),
            worker: WorkerConfig::default(),
            tools: ToolPaths::default(),
            transcoding: TranscodingConfig::default(),
            identities: default_identities(),
            redirect_timeout_secs: 8,
            acquisition_deadline_secs: 900,
        }
    }
}

impl Default for CobaltConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: "http://localhost:9000/".to_string(),
            api_key: None,
            video_quality: "1080".to_string(),
            timeout_secs: 300,
        }
    }
}

impl Default for SlideshowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: "https://www.tikwm.com/api/".to_string(),
            timeout_secs: 15,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "http://127.0.0.1:50057".to_string(),
            timeout_secs: 900,
            ticker_interval_secs: 4,
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            socket_timeout_secs: 20,
            extraction_timeout_secs: 300,
        }
    }
}

pub fn default_identities() -> Vec<IdentityProfile> {
    vec![
        IdentityProfile {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
            impersonate: "chrome".to_string(),
        },
        IdentityProfile {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15".to_string(),
            impersonate: "safari".to_string(),
        },
        IdentityProfile {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0".to_string(),
            impersonate: "edge".to_string(),
        },
    ]
}

impl AppConfig {
    /// Defaults, then the JSON config file, then `MEDIA_FETCHER__*` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::get_config_path().as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Json)
                    .required(false),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MEDIA_FETCHER")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = builder.build()?.try_deserialize()?;

        if let Ok(content) = std::env::var("COOKIES_CONTENT") {
            if !content.trim().is_empty() {
                config.cookies.content = Some(content);
            }
        }

        Ok(config)
    }

    fn get_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("media-fetcher").join("config.json"))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.downloads_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn cookie_file_path(&self) -> PathBuf {
        self.data_dir.join("cookies.txt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"proxy": "socks5://127.0.0.1:1080", "worker": {{"address": "http://worker:9"}}}}"#
        )
        .unwrap();

        let config = AppConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
        assert_eq!(config.worker.address, "http://worker:9");
        assert_eq!(config.worker.ticker_interval_secs, 4);
        assert_eq!(config.identities.len(), 3);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load_from(Some(Path::new("/nonexistent/config.json"))).unwrap();
        assert!(config.cobalt.enabled);
        assert_eq!(config.acquisition_deadline_secs, 900);
    }
}
