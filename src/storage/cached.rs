use crate::models::{
    Account, AccountSummary, NewPageView, PageView, RecordedPageView, Session, SessionResolution,
    Site, Visitor, VisitorResolution,
};
use crate::storage::{Storage, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Storage wrapper that remembers which sites exist.
///
/// Only positive lookups are cached: sites are never deleted by the
/// ingestion path, while a freshly provisioned site must be accepted on its
/// first beacon.
pub struct CachedStorage {
    /// Underlying storage implementation
    inner: Arc<dyn Storage>,
    /// Site ids known to exist
    known_sites: Cache<String, ()>,
}

impl CachedStorage {
    pub fn new(inner: Arc<dyn Storage>, max_entries: u64, ttl_secs: u64) -> Self {
        let known_sites = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self { inner, known_sites }
    }

    /// Drop a site from the cache
    pub async fn forget_site(&self, site_id: &str) {
        self.known_sites.invalidate(site_id).await;
    }
}

#[async_trait]
impl Storage for CachedStorage {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn site_exists(&self, site_id: &str) -> Result<bool> {
        if self.known_sites.contains_key(site_id) {
            return Ok(true);
        }

        let exists = self.inner.site_exists(site_id).await?;
        if exists {
            self.known_sites.insert(site_id.to_string(), ()).await;
        }

        Ok(exists)
    }

    async fn get_site(&self, site_id: &str) -> Result<Option<Site>> {
        self.inner.get_site(site_id).await
    }

    async fn resolve_visitor(
        &self,
        site_id: &str,
        fingerprint_hash: &str,
        now: i64,
    ) -> StorageResult<VisitorResolution> {
        self.inner.resolve_visitor(site_id, fingerprint_hash, now).await
    }

    async fn resolve_session(
        &self,
        site_id: &str,
        visitor_id: &str,
        now: i64,
        window_secs: i64,
    ) -> StorageResult<SessionResolution> {
        self.inner
            .resolve_session(site_id, visitor_id, now, window_secs)
            .await
    }

    async fn record_page_view(
        &self,
        event: &NewPageView,
        window_secs: i64,
    ) -> StorageResult<RecordedPageView> {
        self.inner.record_page_view(event, window_secs).await
    }

    async fn end_session(&self, session_id: &str, ended_at: i64) -> Result<bool> {
        self.inner.end_session(session_id, ended_at).await
    }

    async fn get_visitor(&self, visitor_id: &str) -> Result<Option<Visitor>> {
        self.inner.get_visitor(visitor_id).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.inner.get_session(session_id).await
    }

    async fn list_page_views(&self, session_id: &str) -> Result<Vec<PageView>> {
        self.inner.list_page_views(session_id).await
    }

    async fn count_visitors(&self, site_id: &str) -> Result<i64> {
        self.inner.count_visitors(site_id).await
    }

    async fn count_sessions(&self, site_id: &str) -> Result<i64> {
        self.inner.count_sessions(site_id).await
    }

    async fn count_page_views(&self, site_id: &str) -> Result<i64> {
        self.inner.count_page_views(site_id).await
    }

    async fn create_account(&self, name: &str) -> Result<Account> {
        self.inner.create_account(name).await
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        self.inner.get_account(account_id).await
    }

    async fn find_account_by_name(&self, name: &str) -> Result<Option<Account>> {
        self.inner.find_account_by_name(name).await
    }

    async fn list_accounts(&self) -> Result<Vec<AccountSummary>> {
        self.inner.list_accounts().await
    }

    async fn create_site(
        &self,
        site_id: &str,
        account_id: &str,
        name: &str,
        domain: &str,
    ) -> StorageResult<Site> {
        let site = self
            .inner
            .create_site(site_id, account_id, name, domain)
            .await?;

        self.known_sites.insert(site.id.clone(), ()).await;

        Ok(site)
    }

    async fn list_sites(&self, account_id: Option<&str>) -> Result<Vec<Site>> {
        self.inner.list_sites(account_id).await
    }
}
