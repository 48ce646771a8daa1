use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Account listing row used by the admin CLI
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AccountSummary {
    pub id: String,
    pub name: String,
    pub site_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Site {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub domain: String,
    pub created_at: i64,
    pub updated_at: i64,
}
