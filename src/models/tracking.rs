use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Incoming beacon payload, either a JSON body or pixel query parameters.
///
/// Every field is optional at the wire level so that missing required
/// fields surface as a malformed-request error rather than a framework
/// rejection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackRequest {
    pub site_id: Option<String>,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    pub referrer: Option<String>,
    pub screen_width: Option<i64>,
    pub screen_height: Option<i64>,
    pub fingerprint: Option<String>,
    /// Page load time in milliseconds
    pub load_time: Option<i64>,
}

/// Device classification. Tablets and other categories count as desktop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
        }
    }
}

/// Facts extracted from a User-Agent header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrowserInfo {
    pub browser_name: Option<String>,
    pub browser_version: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub device_type: Option<DeviceType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Visitor {
    pub id: String,
    pub site_id: String,
    pub fingerprint_hash: String,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub total_visits: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub visitor_id: String,
    pub site_id: String,
    pub started_at: i64,
    pub last_activity_at: i64,
    pub ended_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PageView {
    pub id: String,
    pub site_id: String,
    pub visitor_id: String,
    pub session_id: String,
    pub page_url: String,
    pub page_title: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub country_code: Option<String>,
    pub browser_name: Option<String>,
    pub browser_version: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub device_type: Option<String>,
    pub screen_width: Option<i64>,
    pub screen_height: Option<i64>,
    pub viewed_at: i64,
    pub page_load_time: Option<i64>,
}

/// A validated event, ready for the storage unit of work
#[derive(Debug, Clone)]
pub struct NewPageView {
    pub site_id: String,
    pub fingerprint_hash: String,
    pub page_url: String,
    pub page_title: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub browser: BrowserInfo,
    pub screen_width: Option<i64>,
    pub screen_height: Option<i64>,
    pub page_load_time: Option<i64>,
    pub viewed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitorResolution {
    pub visitor_id: String,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResolution {
    pub session_id: String,
    pub created: bool,
}

/// Identifiers produced by one recorded event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedPageView {
    pub page_view_id: String,
    pub visitor_id: String,
    pub session_id: String,
    pub new_visitor: bool,
    pub new_session: bool,
}
