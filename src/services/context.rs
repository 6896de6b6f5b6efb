//! Customer context lookup
//!
//! A [`ContextStore`] answers "what do we know about this customer" with a
//! tagged [`ContextLookup`]. The production store reads through a best-effort
//! cache: cache failures are logged and fall through to the profile source,
//! and an entry that no longer parses is evicted on read.

use crate::config::ContextSection;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Key prefix for cached context entries
pub const CONTEXT_PREFIX: &str = "context:";

/// Result of a context lookup
#[derive(Debug, Clone, PartialEq)]
pub enum ContextLookup {
    Found(Value),
    NotFound,
    /// The lookup itself failed; worth retrying
    Error(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
    #[error("Failed to encode cache entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Profile request failed: {0}")]
    Request(String),
    #[error("Profile service returned status {0}")]
    Status(u16),
    #[error("Invalid profile body: {0}")]
    InvalidBody(String),
}

/// Raw key-value cache with per-entry expiry
#[async_trait]
pub trait ContextCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// System of record for customer profiles
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// `Ok(None)` when the customer is unknown
    async fn fetch(&self, customer_key: &str) -> Result<Option<Value>, ProfileError>;
}

#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn lookup(&self, customer_key: &str) -> ContextLookup;

    /// Merge fields into the cached context, creating it when absent
    async fn update(&self, customer_key: &str, updates: Value) -> Result<(), CacheError>;

    async fn invalidate(&self, customer_key: &str) -> Result<(), CacheError>;
}

/// In-process cache
#[derive(Debug, Default)]
pub struct MemoryContextCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ContextCache for MemoryContextCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > now => return Ok(Some(value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        // Keys that are never read again would otherwise stay forever
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Profiles served from a fixed map
#[derive(Debug, Clone, Default)]
pub struct StaticProfileSource {
    profiles: HashMap<String, Value>,
}

impl StaticProfileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile<K: Into<String>>(mut self, customer_key: K, profile: Value) -> Self {
        self.profiles.insert(customer_key.into(), profile);
        self
    }
}

#[async_trait]
impl ProfileSource for StaticProfileSource {
    async fn fetch(&self, customer_key: &str) -> Result<Option<Value>, ProfileError> {
        Ok(self.profiles.get(customer_key).cloned())
    }
}

/// Profiles fetched from `GET {base_url}/customers/{key}`
#[derive(Debug, Clone)]
pub struct HttpProfileSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProfileSource {
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn profile_url(&self, customer_key: &str) -> Result<url::Url, ProfileError> {
        let mut url = url::Url::parse(&self.base_url)
            .map_err(|e| ProfileError::Request(format!("Invalid base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ProfileError::Request("Base URL cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(["customers", customer_key]);
        Ok(url)
    }
}

#[async_trait]
impl ProfileSource for HttpProfileSource {
    async fn fetch(&self, customer_key: &str) -> Result<Option<Value>, ProfileError> {
        let url = self.profile_url(customer_key)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProfileError::Request(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ProfileError::Status(status.as_u16()));
        }

        response
            .json::<Value>()
            .await
            .map(Some)
            .map_err(|e| ProfileError::InvalidBody(e.to_string()))
    }
}

/// Read-through store over a cache and a profile source
pub struct CachedContextStore<C: ContextCache, P: ProfileSource> {
    cache: C,
    source: P,
    ttl: Duration,
}

impl<C: ContextCache, P: ProfileSource> CachedContextStore<C, P> {
    pub fn new(cache: C, source: P, ttl: Duration) -> Self {
        Self { cache, source, ttl }
    }

    pub fn from_config(cache: C, source: P, config: &ContextSection) -> Self {
        Self::new(cache, source, Duration::from_secs(config.cache_ttl_secs))
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    fn cache_key(customer_key: &str) -> String {
        format!("{CONTEXT_PREFIX}{customer_key}")
    }

    /// Cached entry, `None` on a miss, a cache failure or a corrupt entry
    async fn cached(&self, key: &str) -> Option<Value> {
        let raw = match self.cache.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Context cache read failed, falling back to source");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Evicting corrupt context cache entry");
                if let Err(e) = self.cache.delete(key).await {
                    warn!(key = %key, error = %e, "Failed to evict corrupt entry");
                }
                None
            }
        }
    }

    async fn store(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.cache.set(key, raw, self.ttl).await
    }
}

#[async_trait]
impl<C: ContextCache, P: ProfileSource> ContextStore for CachedContextStore<C, P> {
    async fn lookup(&self, customer_key: &str) -> ContextLookup {
        let key = Self::cache_key(customer_key);

        if let Some(context) = self.cached(&key).await {
            debug!(key = %key, "Context cache hit");
            return ContextLookup::Found(context);
        }

        match self.source.fetch(customer_key).await {
            Ok(Some(profile)) => {
                if let Err(e) = self.store(&key, &profile).await {
                    warn!(key = %key, error = %e, "Failed to cache customer context");
                }
                ContextLookup::Found(profile)
            }
            Ok(None) => ContextLookup::NotFound,
            Err(e) => ContextLookup::Error(e.to_string()),
        }
    }

    async fn update(&self, customer_key: &str, updates: Value) -> Result<(), CacheError> {
        let key = Self::cache_key(customer_key);
        // On a miss the profile is the base, so the update never shadows it
        let base = match self.cached(&key).await {
            Some(existing) => Some(existing),
            None => self.source.fetch(customer_key).await.ok().flatten(),
        };
        let merged = match (base, updates) {
            (Some(Value::Object(mut existing)), Value::Object(updates)) => {
                existing.extend(updates);
                Value::Object(existing)
            }
            (_, updates) => updates,
        };
        self.store(&key, &merged).await
    }

    async fn invalidate(&self, customer_key: &str) -> Result<(), CacheError> {
        self.cache.delete(&Self::cache_key(customer_key)).await
    }
}
