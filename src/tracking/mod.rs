//! Page view ingestion: validate a beacon, resolve visitor and session, and
//! persist the page view.

pub mod fingerprint;
pub mod ip_extractor;
pub mod site_validator;
pub mod user_agent;

use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::models::{NewPageView, RecordedPageView, TrackRequest};
use crate::storage::{Storage, StorageError};

pub use fingerprint::{hash_fingerprint, FINGERPRINT_HASH_LENGTH};
pub use ip_extractor::extract_client_ip;
pub use site_validator::SiteValidator;
pub use user_agent::parse_user_agent;

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("{0}")]
    MalformedRequest(String),
    #[error("Invalid site_id format")]
    InvalidSiteFormat,
    #[error("Site not found")]
    SiteNotFound,
    #[error("Failed to record page view")]
    Persistence(#[source] StorageError),
    #[error("Request timed out")]
    Timeout,
}

/// Transport facts that accompany a beacon
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub client_ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

#[derive(Clone)]
pub struct Tracker {
    storage: Arc<dyn Storage>,
    validator: SiteValidator,
    session_window_secs: i64,
}

impl Tracker {
    pub fn new(storage: Arc<dyn Storage>, session_window_secs: i64) -> Self {
        Self {
            validator: SiteValidator::new(Arc::clone(&storage)),
            storage,
            session_window_secs,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub async fn track(
        &self,
        request: TrackRequest,
        meta: RequestMeta,
    ) -> Result<RecordedPageView, TrackError> {
        self.track_at(request, meta, Utc::now().timestamp()).await
    }

    /// Record one page view as if it arrived at `now` (unix seconds)
    pub async fn track_at(
        &self,
        request: TrackRequest,
        meta: RequestMeta,
        now: i64,
    ) -> Result<RecordedPageView, TrackError> {
        // A blank but present site id is a format problem, not a missing field
        let site_id = request
            .site_id
            .filter(|v| !v.is_empty())
            .ok_or_else(|| missing("site_id"))?;
        let page_url = required(request.page_url, "page_url")?;
        let fingerprint = required(request.fingerprint, "fingerprint")?;

        let site_id = self.validator.validate(&site_id).await?;

        let user_agent = non_empty(meta.user_agent);
        let event = NewPageView {
            site_id: site_id.as_str().to_string(),
            fingerprint_hash: hash_fingerprint(&site_id, &fingerprint),
            page_url,
            page_title: non_empty(request.page_title),
            referrer: non_empty(request.referrer),
            browser: parse_user_agent(user_agent.as_deref()),
            user_agent,
            ip_address: meta.client_ip.map(|ip| ip.to_string()),
            screen_width: request.screen_width.filter(|w| *w > 0),
            screen_height: request.screen_height.filter(|h| *h > 0),
            page_load_time: request.load_time.filter(|ms| *ms >= 0),
            viewed_at: now,
        };

        let recorded = self
            .storage
            .record_page_view(&event, self.session_window_secs)
            .await
            .map_err(|err| {
                tracing::error!(site_id = %site_id, error = ?err, "failed to record page view");
                TrackError::Persistence(err)
            })?;

        tracing::debug!(
            site_id = %site_id,
            visitor_id = %recorded.visitor_id,
            session_id = %recorded.session_id,
            new_visitor = recorded.new_visitor,
            new_session = recorded.new_session,
            "page view recorded"
        );

        Ok(recorded)
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, TrackError> {
    non_empty(value).ok_or_else(|| missing(field))
}

fn missing(field: &str) -> TrackError {
    TrackError::MalformedRequest(format!("Missing required field: {field}"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
