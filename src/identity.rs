//! Principal to tenant resolution.
//!
//! Session validation and the tenant directory are external collaborators.
//! `TenantResolver` sits in front of them with a `TenantCache`, so the slow
//! directory lookup runs once per principal per TTL.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config;
use crate::error::{PipelineError, Result};

/// An authenticated identity as returned by session validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: String,
    pub email: String,
    pub active: bool,
}

/// The tenant-scoped identity every pipeline call runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    pub tenant_id: String,
    pub user_id: String,
    pub email: String,
}

impl TenantScope {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            email: String::new(),
        }
    }
}

/// Request credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub session_token: String,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            session_token: token.into(),
        }
    }
}

#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// Fails with `PipelineError::Unauthenticated` for unknown credentials.
    async fn validate(&self, credentials: &Credentials) -> Result<Principal>;
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn tenant_for(&self, principal_id: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
struct CachedTenant {
    tenant_id: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Lock-free principal -> tenant cache. Writes race last-write-wins and
/// entries simply expire; nothing invalidates them explicitly.
#[derive(Debug)]
pub struct TenantCache {
    entries: DashMap<String, CachedTenant>,
    ttl: Duration,
    stats: CacheStats,
}

impl TenantCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, principal_id: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(principal_id) {
            if entry.expires_at > now {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.tenant_id.clone());
            }
        }
        self.entries
            .remove_if(principal_id, |_, entry| entry.expires_at <= now);
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, principal_id: &str, tenant_id: &str) {
        self.entries.insert(
            principal_id.to_string(),
            CachedTenant {
                tenant_id: tenant_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[derive(Clone)]
pub struct TenantResolver {
    validator: Arc<dyn SessionValidator>,
    directory: Arc<dyn TenantDirectory>,
    cache: Arc<TenantCache>,
}

impl TenantResolver {
    pub fn new(
        validator: Arc<dyn SessionValidator>,
        directory: Arc<dyn TenantDirectory>,
        ttl: Duration,
    ) -> Self {
        Self {
            validator,
            directory,
            cache: Arc::new(TenantCache::new(ttl)),
        }
    }

    pub fn from_config(
        validator: Arc<dyn SessionValidator>,
        directory: Arc<dyn TenantDirectory>,
        cfg: &config::Identity,
    ) -> Self {
        Self::new(validator, directory, cfg.cache_ttl())
    }

    pub fn cache(&self) -> &TenantCache {
        &self.cache
    }

    #[instrument(skip_all)]
    pub async fn resolve(&self, credentials: &Credentials) -> Result<TenantScope> {
        let principal = self.validator.validate(credentials).await?;
        if !principal.active {
            warn!(principal_id = %principal.principal_id, "inactive principal rejected");
            return Err(PipelineError::Unauthenticated(format!(
                "principal {} is inactive",
                principal.principal_id
            )));
        }

        let tenant_id = match self.cache.get(&principal.principal_id) {
            Some(tenant_id) => tenant_id,
            None => {
                debug!(principal_id = %principal.principal_id, "tenant cache miss");
                let tenant_id = self
                    .directory
                    .tenant_for(&principal.principal_id)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::Unauthenticated(format!(
                            "principal {} belongs to no tenant",
                            principal.principal_id
                        ))
                    })?;
                self.cache.insert(&principal.principal_id, &tenant_id);
                tenant_id
            }
        };

        Ok(TenantScope {
            tenant_id,
            user_id: principal.principal_id,
            email: principal.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        tokio::time::pause();
        let cache = TenantCache::new(Duration::from_secs(60));
        cache.insert("p1", "t1");
        assert_eq!(cache.get("p1").as_deref(), Some("t1"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("p1"), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[tokio::test]
    async fn last_write_wins() {
        let cache = TenantCache::new(TenantCache::DEFAULT_TTL);
        cache.insert("p1", "t1");
        cache.insert("p1", "t2");
        assert_eq!(cache.get("p1").as_deref(), Some("t2"));
        assert_eq!(cache.len(), 1);
    }
}
