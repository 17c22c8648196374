//! URL normalization: short-link resolution, query cleanup and platform classification.
//!
//! Runs once per acquisition; every backend receives the same [`NormalizedUrl`].

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    YouTube,
    TikTok,
    Instagram,
    Reddit,
    Twitter,
    Facebook,
    Generic,
    Unknown,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::YouTube => "youtube",
            Platform::TikTok => "tiktok",
            Platform::Instagram => "instagram",
            Platform::Reddit => "reddit",
            Platform::Twitter => "twitter",
            Platform::Facebook => "facebook",
            Platform::Generic => "generic",
            Platform::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentShape {
    Single,
    Slideshow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedUrl {
    pub url: Url,
    pub platform: Platform,
    pub shape: ContentShape,
}

impl NormalizedUrl {
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

const PLATFORM_HOSTS: &[(&str, Platform)] = &[
    ("youtube.com", Platform::YouTube),
    ("youtu.be", Platform::YouTube),
    ("tiktok.com", Platform::TikTok),
    ("instagram.com", Platform::Instagram),
    ("instagr.am", Platform::Instagram),
    ("reddit.com", Platform::Reddit),
    ("redd.it", Platform::Reddit),
    ("twitter.com", Platform::Twitter),
    ("x.com", Platform::Twitter),
    ("t.co", Platform::Twitter),
    ("facebook.com", Platform::Facebook),
    ("fb.watch", Platform::Facebook),
];

const SHORT_LINK_HOSTS: &[&str] = &[
    "vm.tiktok.com",
    "vt.tiktok.com",
    "youtu.be",
    "t.co",
    "redd.it",
    "fb.watch",
    "instagr.am",
];

/// Query parameters dropped from URLs on hosts we know nothing about.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "igsh", "igshid", "si", "feature", "ref"];

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{}", domain))
}

pub fn classify_platform(url: &Url) -> Platform {
    if !matches!(url.scheme(), "http" | "https") {
        return Platform::Unknown;
    }
    let Some(host) = url.host_str() else {
        return Platform::Unknown;
    };
    let host = host.to_lowercase();

    PLATFORM_HOSTS
        .iter()
        .find(|(domain, _)| host_matches(&host, domain))
        .map(|(_, platform)| *platform)
        .unwrap_or(Platform::Generic)
}

pub fn is_short_link(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    if SHORT_LINK_HOSTS.iter().any(|short| host == *short) {
        return true;
    }
    // www.tiktok.com/t/<code> is a share link as well
    host_matches(&host, "tiktok.com") && url.path().starts_with("/t/")
}

/// Query keys the extractor needs for each platform. `None` keeps all but tracking params.
fn preserved_params(platform: Platform) -> Option<&'static [&'static str]> {
    match platform {
        Platform::YouTube => Some(&["v", "t"]),
        Platform::Facebook => Some(&["v", "story_fbid", "id"]),
        Platform::Instagram => Some(&["img_index"]),
        Platform::TikTok | Platform::Reddit | Platform::Twitter => Some(&[]),
        Platform::Generic | Platform::Unknown => None,
    }
}

pub fn strip_query(url: &mut Url, platform: Platform) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| match preserved_params(platform) {
            Some(allowed) => allowed.contains(&key.as_ref()),
            None => !key.starts_with("utm_") && !TRACKING_PARAMS.contains(&key.as_ref()),
        })
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
}

static TIKTOK_PHOTO: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^/@[^/]+/photo/\d+").ok());

pub fn detect_shape(url: &Url, platform: Platform) -> ContentShape {
    let regex = match platform {
        Platform::TikTok => (*TIKTOK_PHOTO).as_ref(),
        _ => return ContentShape::Single,
    };

    match regex {
        Some(regex) if regex.is_match(url.path()) => ContentShape::Slideshow,
        _ => ContentShape::Single,
    }
}

/// Follows share links to their final location.
#[async_trait]
pub trait RedirectResolver: Send + Sync {
    /// `None` when the link could not be resolved; callers keep the original.
    async fn resolve(&self, url: &Url) -> Option<Url>;
}

pub struct HttpRedirectResolver {
    client: reqwest::Client,
}

impl HttpRedirectResolver {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::limited(10))
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RedirectResolver for HttpRedirectResolver {
    async fn resolve(&self, url: &Url) -> Option<Url> {
        let head = match self.client.head(url.clone()).send().await {
            Ok(response) => Some(response.url().clone()),
            Err(e) => {
                log::warn!("⚠️ [URL] HEAD {} failed: {}", url, e);
                None
            }
        };

        if let Some(resolved) = &head {
            if !is_short_link(resolved) {
                return head;
            }
        }

        // Some short-link services only redirect on GET
        match self.client.get(url.clone()).send().await {
            Ok(response) => Some(response.url().clone()),
            Err(e) => {
                log::warn!("⚠️ [URL] GET {} failed: {}", url, e);
                head
            }
        }
    }
}

pub struct UrlNormalizer {
    resolver: Box<dyn RedirectResolver>,
}

impl UrlNormalizer {
    pub fn new(resolver: Box<dyn RedirectResolver>) -> Self {
        Self { resolver }
    }

    pub async fn normalize(&self, raw_url: &str) -> Result<NormalizedUrl> {
        let trimmed = raw_url.trim();
        let mut url = Url::parse(trimmed)
            .or_else(|_| Url::parse(&format!("https://{}", trimmed)))
            .map_err(|e| AppError::InvalidUrl(format!("{}: {}", trimmed, e)))?;

        if is_short_link(&url) {
            match self.resolver.resolve(&url).await {
                Some(resolved) => {
                    log::info!("[URL] Resolved {} -> {}", url, resolved);
                    url = resolved;
                }
                None => log::warn!("⚠️ [URL] Could not resolve {}, using it as-is", url),
            }
        }

        let platform = classify_platform(&url);
        strip_query(&mut url, platform);
        url.set_fragment(None);
        let shape = detect_shape(&url, platform);

        log::info!("[URL] {} classified as {} / {:?}", url, platform, shape);
        Ok(NormalizedUrl { url, platform, shape })
    }
}
