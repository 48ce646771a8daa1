use std::sync::Arc;

use super::TrackError;
use crate::models::SiteId;
use crate::storage::Storage;

/// Checks that a beacon's site id is well formed and registered.
///
/// The format check runs first so malformed ids never reach the database.
#[derive(Clone)]
pub struct SiteValidator {
    storage: Arc<dyn Storage>,
}

impl SiteValidator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn validate(&self, raw: &str) -> Result<SiteId, TrackError> {
        let site_id = SiteId::parse(raw).map_err(|err| {
            tracing::debug!(error = %err, "rejecting beacon with malformed site id");
            TrackError::InvalidSiteFormat
        })?;

        let exists = self
            .storage
            .site_exists(site_id.as_str())
            .await
            .map_err(|err| TrackError::Persistence(err.into()))?;

        if !exists {
            tracing::debug!(site_id = %site_id, "rejecting beacon for unknown site");
            return Err(TrackError::SiteNotFound);
        }

        Ok(site_id)
    }
}
