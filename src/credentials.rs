//! Cookie credentials for the extractors.
//!
//! The provider re-reads configuration and the store on every acquisition and
//! materializes the result as a cookie file through write-then-rename, so
//! concurrent refreshes never expose a half-written jar.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::Result;
use crate::utils::generate_download_id;

/// Read side of the persisted operator override.
#[async_trait]
pub trait CookieStore: Send + Sync {
    /// Content of the most recently updated cookie record, if any.
    async fn latest_cookie_blob(&self) -> Result<Option<String>>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Store used when no override store is configured.
pub struct NoCookieStore;

#[async_trait]
impl CookieStore for NoCookieStore {
    async fn latest_cookie_blob(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieRecord {
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// JSON array of [`CookieRecord`]s written by the administrative side.
pub struct JsonFileCookieStore {
    path: PathBuf,
}

impl JsonFileCookieStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CookieStore for JsonFileCookieStore {
    async fn latest_cookie_blob(&self) -> Result<Option<String>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let records: Vec<CookieRecord> = serde_json::from_str(&raw)?;
        Ok(records
            .into_iter()
            .max_by_key(|record| record.updated_at)
            .map(|record| record.content))
    }
}

/// Cookie state captured for a single acquisition.
#[derive(Debug, Clone, Default)]
pub struct CredentialSnapshot {
    pub content: Option<String>,
    pub cookie_file: Option<PathBuf>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl CredentialSnapshot {
    pub fn cookies_blob(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

pub struct CredentialProvider {
    configured: Option<String>,
    store: Arc<dyn CookieStore>,
    clock: Arc<dyn Clock>,
    cookie_path: PathBuf,
    current: RwLock<CredentialSnapshot>,
}

impl CredentialProvider {
    pub fn new(
        configured: Option<String>,
        store: Arc<dyn CookieStore>,
        clock: Arc<dyn Clock>,
        cookie_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            configured: configured.filter(|c| !c.trim().is_empty()),
            store,
            clock,
            cookie_path: cookie_path.into(),
            current: RwLock::new(CredentialSnapshot::default()),
        }
    }

    /// Re-reads the sources and rewrites the cookie file.
    pub async fn refresh(&self) -> Result<CredentialSnapshot> {
        let mut content = self.configured.clone();

        match self.store.latest_cookie_blob().await {
            Ok(Some(stored)) if !stored.trim().is_empty() => content = Some(stored),
            Ok(_) => {}
            Err(e) => log::error!("❌ [COOKIES] Error loading cookies from store: {}", e),
        }

        let cookie_file = match &content {
            Some(text) => {
                write_atomically(&self.cookie_path, text).await?;
                Some(self.cookie_path.clone())
            }
            None => None,
        };

        let snapshot = CredentialSnapshot {
            content,
            cookie_file,
            refreshed_at: Some(self.clock.now()),
        };
        log::debug!(
            "[COOKIES] Refreshed (cookies present: {})",
            snapshot.cookie_file.is_some()
        );

        *self.current.write().await = snapshot.clone();
        Ok(snapshot)
    }

    /// Snapshot from the last refresh.
    pub async fn current(&self) -> CredentialSnapshot {
        self.current.read().await.clone()
    }
}

async fn write_atomically(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = path.with_extension(format!("{}.tmp", generate_download_id()));
    tokio::fs::write(&temp, content).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}
