use crate::models::{
    Account, AccountSummary, NewPageView, PageView, RecordedPageView, Session, SessionResolution,
    Site, Visitor, VisitorResolution,
};
use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record already exists")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Other(err.into())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Initialize the storage (create tables and indexes)
    async fn init(&self) -> Result<()>;

    /// Round-trip to the database
    async fn ping(&self) -> Result<()>;

    async fn site_exists(&self, site_id: &str) -> Result<bool>;

    async fn get_site(&self, site_id: &str) -> Result<Option<Site>>;

    /// Find or create the visitor for (site, fingerprint hash).
    ///
    /// Concurrent callers with the same key always observe the same visitor.
    async fn resolve_visitor(
        &self,
        site_id: &str,
        fingerprint_hash: &str,
        now: i64,
    ) -> StorageResult<VisitorResolution>;

    /// Reuse the visitor's active session (advancing its last activity) or
    /// start a new one.
    async fn resolve_session(
        &self,
        site_id: &str,
        visitor_id: &str,
        now: i64,
        window_secs: i64,
    ) -> StorageResult<SessionResolution>;

    /// Resolve visitor and session and append the page view, all in one
    /// transaction
    async fn record_page_view(
        &self,
        event: &NewPageView,
        window_secs: i64,
    ) -> StorageResult<RecordedPageView>;

    /// Explicitly end an open session. Returns false if it was already ended
    /// or does not exist.
    async fn end_session(&self, session_id: &str, ended_at: i64) -> Result<bool>;

    async fn get_visitor(&self, visitor_id: &str) -> Result<Option<Visitor>>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Page views of a session, oldest first
    async fn list_page_views(&self, session_id: &str) -> Result<Vec<PageView>>;

    async fn count_visitors(&self, site_id: &str) -> Result<i64>;

    async fn count_sessions(&self, site_id: &str) -> Result<i64>;

    async fn count_page_views(&self, site_id: &str) -> Result<i64>;

    async fn create_account(&self, name: &str) -> Result<Account>;

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>>;

    async fn find_account_by_name(&self, name: &str) -> Result<Option<Account>>;

    /// All accounts with their site counts, newest first
    async fn list_accounts(&self) -> Result<Vec<AccountSummary>>;

    /// Insert a site. Fails with `Conflict` if the id is taken.
    async fn create_site(
        &self,
        site_id: &str,
        account_id: &str,
        name: &str,
        domain: &str,
    ) -> StorageResult<Site>;

    /// Sites, newest first, optionally restricted to one account
    async fn list_sites(&self, account_id: Option<&str>) -> Result<Vec<Site>>;
}
