//! Per-page access token cache
//!
//! `TokenStore` is the source of truth for whether a page is currently
//! publishable. Expiry is checked lazily on every [`TokenStore::get`], so
//! correctness never depends on a background sweep. Every mutation is written
//! through to a flat JSON document mapping page id to `{token, expires_at}`;
//! a document that cannot be read or parsed is discarded in full on load.
//!
//! All access goes through one async mutex, which serializes reads and writes
//! for every page id.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, TokenStoreError};

/// A live access credential for one page
pub struct Credential {
    pub page_id: String,
    token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("page_id", &self.page_id)
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct TokenStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, StoredToken>>,
}

impl TokenStore {
    /// Open a store persisted at `path`, starting empty when the file is
    /// missing, unreadable or corrupt.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut entries = load_entries(&path);

        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, stored| stored.expires_at > now);
        if entries.len() < before {
            debug!("Dropped {} expired token(s) on load", before - entries.len());
        }

        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fetch the credential for `page_id` if it has not expired
    pub async fn get(&self, page_id: &str) -> Option<Credential> {
        self.get_at(page_id, Utc::now()).await
    }

    /// Expiry-checked lookup against an explicit clock. An expired entry is
    /// purged and the purge persisted.
    pub async fn get_at(&self, page_id: &str, now: DateTime<Utc>) -> Option<Credential> {
        let mut entries = self.entries.lock().await;

        let expired = match entries.get(page_id) {
            None => return None,
            Some(stored) => stored.expires_at <= now,
        };

        if expired {
            entries.remove(page_id);
            info!(page_id, "Access token expired, purged from cache");
            if let Err(e) = self.persist(&entries).await {
                warn!(page_id, "Failed to persist token purge: {}", e);
            }
            return None;
        }

        entries.get(page_id).map(|stored| Credential {
            page_id: page_id.to_string(),
            token: SecretString::from(stored.token.clone()),
            expires_at: stored.expires_at,
        })
    }

    /// Cache `token` for `page_id`, valid for `ttl` from now
    pub async fn set(&self, page_id: &str, token: &str, ttl: Duration) -> Result<DateTime<Utc>> {
        let expires_at = Utc::now() + ttl;
        let mut entries = self.entries.lock().await;
        entries.insert(
            page_id.to_string(),
            StoredToken {
                token: token.to_string(),
                expires_at,
            },
        );
        self.persist(&entries).await?;
        debug!(page_id, %expires_at, "Cached access token");
        Ok(expires_at)
    }

    /// Forget the credential for `page_id`. Returns whether one was cached.
    pub async fn invalidate(&self, page_id: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(page_id).is_some();
        if removed {
            self.persist(&entries).await?;
            info!(page_id, "Access token invalidated");
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.persist(&entries).await
    }

    /// Page ids with a live credential and their expiry, without secrets
    pub async fn list(&self) -> Vec<(String, DateTime<Utc>)> {
        let now = Utc::now();
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(_, stored)| stored.expires_at > now)
            .map(|(page_id, stored)| (page_id.clone(), stored.expires_at))
            .collect()
    }

    async fn persist(&self, entries: &BTreeMap<String, StoredToken>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let data = serde_json::to_vec_pretty(entries).map_err(TokenStoreError::Serialize)?;
        write_atomically(path, &data)
            .await
            .map_err(|source| TokenStoreError::Persist {
                path: path.display().to_string(),
                source,
            })?;
        Ok(())
    }
}

fn load_entries(path: &Path) -> BTreeMap<String, StoredToken> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(
                "Token cache {} is unreadable, starting empty: {}",
                path.display(),
                e
            );
            return BTreeMap::new();
        }
    };

    match serde_json::from_slice(&data) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                "Token cache {} is corrupt, discarding it: {}",
                path.display(),
                e
            );
            BTreeMap::new()
        }
    }
}

/// Write to a sibling temp file and rename over the target so a crash never
/// leaves a half-written cache behind.
async fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, data).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tokio::fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_then_get() {
        let store = TokenStore::in_memory();
        store.set("page-a", "tok-a", Duration::hours(1)).await.unwrap();

        let credential = store.get("page-a").await.unwrap();
        assert_eq!(credential.page_id, "page-a");
        assert_eq!(credential.token(), "tok-a");
        assert!(credential.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_missing_page_is_absent() {
        let store = TokenStore::in_memory();
        assert!(store.get("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_get_after_ttl_is_absent() {
        let store = TokenStore::in_memory();
        let ttl = Duration::seconds(30);
        let expires_at = store.set("page-a", "tok", ttl).await.unwrap();

        let just_before = expires_at - Duration::milliseconds(1);
        assert!(store.get_at("page-a", just_before).await.is_some());

        let just_after = expires_at + Duration::milliseconds(1);
        assert!(store.get_at("page-a", just_after).await.is_none());

        // Purged, so it stays absent even for an earlier clock
        assert!(store.get_at("page-a", just_before).await.is_none());
    }

    #[tokio::test]
    async fn test_expiry_instant_itself_is_expired() {
        let store = TokenStore::in_memory();
        let expires_at = store.set("page-a", "tok", Duration::minutes(5)).await.unwrap();
        assert!(store.get_at("page-a", expires_at).await.is_none());
    }

    #[tokio::test]
    async fn test_short_ttl_expires_in_real_time() {
        let store = TokenStore::in_memory();
        store
            .set("page-a", "tok", Duration::milliseconds(20))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        assert!(store.get("page-a").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let store = TokenStore::in_memory();
        store.set("a", "1", Duration::hours(1)).await.unwrap();
        store.set("b", "2", Duration::hours(1)).await.unwrap();

        assert!(store.invalidate("a").await.unwrap());
        assert!(!store.invalidate("a").await.unwrap());
        assert!(store.get("a").await.is_none());
        assert!(store.get("b").await.is_some());

        store.clear().await.unwrap();
        assert!(store.get("b").await.is_none());
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache").join("tokens.json");

        {
            let store = TokenStore::open(&path);
            store.set("page-a", "tok-a", Duration::hours(1)).await.unwrap();
            store.set("page-b", "tok-b", Duration::hours(1)).await.unwrap();
            store.invalidate("page-b").await.unwrap();
        }

        let reopened = TokenStore::open(&path);
        assert_eq!(reopened.get("page-a").await.unwrap().token(), "tok-a");
        assert!(reopened.get("page-b").await.is_none());
    }

    #[tokio::test]
    async fn test_persisted_document_is_flat_map() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tokens.json");

        let store = TokenStore::open(&path);
        store.set("page-a", "tok-a", Duration::hours(1)).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["page-a"]["token"], "tok-a");
        assert!(raw["page-a"]["expires_at"].is_string());
    }

    #[tokio::test]
    async fn test_corrupt_cache_discarded_wholesale() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tokens.json");
        std::fs::write(&path, b"{\"page-a\": {\"token\": \"tok\", \"expires_at\": 17").unwrap();

        let store = TokenStore::open(&path);
        assert!(store.get("page-a").await.is_none());
        assert!(store.list().await.is_empty());

        // Next mutation replaces the corrupt document
        store.set("page-b", "tok-b", Duration::hours(1)).await.unwrap();
        let reopened = TokenStore::open(&path);
        assert!(reopened.get("page-b").await.is_some());
    }

    #[tokio::test]
    async fn test_expired_entries_dropped_on_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tokens.json");
        let past = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let future = (Utc::now() + Duration::hours(1)).to_rfc3339();
        std::fs::write(
            &path,
            format!(
                r#"{{"old": {{"token": "x", "expires_at": "{}"}}, "new": {{"token": "y", "expires_at": "{}"}}}}"#,
                past, future
            ),
        )
        .unwrap();

        let store = TokenStore::open(&path);
        let listed: Vec<String> = store.list().await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(listed, vec!["new".to_string()]);
    }

    #[test]
    fn test_debug_redacts_token() {
        let credential = Credential {
            page_id: "p".to_string(),
            token: SecretString::from("super-secret".to_string()),
            expires_at: Utc::now(),
        };
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cache_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tokens.json");
        let store = TokenStore::open(&path);
        store.set("page-a", "tok", Duration::hours(1)).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
