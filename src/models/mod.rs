pub mod site;
pub mod site_id;
pub mod tracking;

pub use site::{Account, AccountSummary, Site};
pub use site_id::{SiteId, SiteIdError, SITE_ID_ALPHABET, SITE_ID_LENGTH};
pub use tracking::{
    BrowserInfo, DeviceType, NewPageView, PageView, RecordedPageView, Session, SessionResolution,
    TrackRequest, Visitor, VisitorResolution,
};
