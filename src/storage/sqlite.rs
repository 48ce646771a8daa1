use crate::models::{
    Account, AccountSummary, NewPageView, PageView, RecordedPageView, Session, SessionResolution,
    Site, Visitor, VisitorResolution,
};
use crate::storage::{Storage, StorageError, StorageResult};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// SQLite takes the write lock up front so concurrent writers queue on the
/// busy timeout instead of failing a read-to-write lock upgrade.
const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        tracing::debug!("sqlite pool created");
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

async fn find_visitor_id(
    conn: &mut SqliteConnection,
    site_id: &str,
    fingerprint_hash: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        r#"
        SELECT id FROM visitors
        WHERE site_id = ? AND fingerprint_hash = ?
        "#,
    )
    .bind(site_id)
    .bind(fingerprint_hash)
    .fetch_optional(&mut *conn)
    .await
}

async fn resolve_visitor(
    conn: &mut SqliteConnection,
    site_id: &str,
    fingerprint_hash: &str,
    now: i64,
) -> StorageResult<VisitorResolution> {
    if let Some(visitor_id) = find_visitor_id(conn, site_id, fingerprint_hash).await? {
        return Ok(VisitorResolution {
            visitor_id,
            created: false,
        });
    }

    let visitor_id = Uuid::new_v4().to_string();
    let result = sqlx::query(
        r#"
        INSERT INTO visitors (id, site_id, fingerprint_hash, first_seen_at, last_seen_at, total_visits)
        VALUES (?, ?, ?, ?, ?, 0)
        ON CONFLICT(site_id, fingerprint_hash) DO NOTHING
        "#,
    )
    .bind(&visitor_id)
    .bind(site_id)
    .bind(fingerprint_hash)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(VisitorResolution {
            visitor_id,
            created: true,
        });
    }

    // Another writer created the visitor between our read and insert. Under
    // BEGIN IMMEDIATE writers are serialized, so this only runs for autocommit
    // callers; the Postgres race in tests/concurrent_tracking_integration.rs
    // exercises the same branch.
    let visitor_id = find_visitor_id(conn, site_id, fingerprint_hash)
        .await?
        .ok_or_else(|| anyhow!("visitor missing after insert conflict"))?;

    Ok(VisitorResolution {
        visitor_id,
        created: false,
    })
}

/// Advance the open, in-window session of a visitor and return its id
async fn touch_active_session(
    conn: &mut SqliteConnection,
    site_id: &str,
    visitor_id: &str,
    now: i64,
    window_secs: i64,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        r#"
        UPDATE sessions
        SET last_activity_at = MAX(last_activity_at, ?)
        WHERE visitor_id = ?
          AND site_id = ?
          AND ended_at IS NULL
          AND last_activity_at >= ?
        RETURNING id
        "#,
    )
    .bind(now)
    .bind(visitor_id)
    .bind(site_id)
    .bind(now - window_secs)
    .fetch_optional(&mut *conn)
    .await
}

async fn resolve_session(
    conn: &mut SqliteConnection,
    site_id: &str,
    visitor_id: &str,
    now: i64,
    window_secs: i64,
) -> StorageResult<SessionResolution> {
    if let Some(session_id) =
        touch_active_session(conn, site_id, visitor_id, now, window_secs).await?
    {
        return Ok(SessionResolution {
            session_id,
            created: false,
        });
    }

    // Close the lapsed session so the open-session index admits a new one
    sqlx::query(
        r#"
        UPDATE sessions
        SET ended_at = last_activity_at
        WHERE visitor_id = ?
          AND ended_at IS NULL
          AND last_activity_at < ?
        "#,
    )
    .bind(visitor_id)
    .bind(now - window_secs)
    .execute(&mut *conn)
    .await?;

    let session_id = Uuid::new_v4().to_string();
    let result = sqlx::query(
        r#"
        INSERT INTO sessions (id, visitor_id, site_id, started_at, last_activity_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(&session_id)
    .bind(visitor_id)
    .bind(site_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(SessionResolution {
            session_id,
            created: true,
        });
    }

    let session_id = touch_active_session(conn, site_id, visitor_id, now, window_secs)
        .await?
        .ok_or_else(|| anyhow!("open session missing after insert conflict"))?;

    Ok(SessionResolution {
        session_id,
        created: false,
    })
}

/// Monotone last-seen bump; the visit counter only moves when a session starts
async fn touch_visitor(
    conn: &mut SqliteConnection,
    visitor_id: &str,
    now: i64,
    new_session: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE visitors
        SET last_seen_at = MAX(last_seen_at, ?),
            total_visits = total_visits + ?
        WHERE id = ?
        "#,
    )
    .bind(now)
    .bind(i64::from(new_session))
    .bind(visitor_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_page_view(
    conn: &mut SqliteConnection,
    event: &NewPageView,
    visitor_id: &str,
    session_id: &str,
) -> Result<String, sqlx::Error> {
    let page_view_id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO page_views (
            id, site_id, visitor_id, session_id, page_url, page_title, referrer,
            user_agent, ip_address, country_code, browser_name, browser_version,
            os_name, os_version, device_type, screen_width, screen_height,
            viewed_at, page_load_time
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&page_view_id)
    .bind(&event.site_id)
    .bind(visitor_id)
    .bind(session_id)
    .bind(&event.page_url)
    .bind(&event.page_title)
    .bind(&event.referrer)
    .bind(&event.user_agent)
    .bind(&event.ip_address)
    .bind(&event.browser.browser_name)
    .bind(&event.browser.browser_version)
    .bind(&event.browser.os_name)
    .bind(&event.browser.os_version)
    .bind(event.browser.device_type.map(|d| d.as_str()))
    .bind(event.screen_width)
    .bind(event.screen_height)
    .bind(event.viewed_at)
    .bind(event.page_load_time)
    .execute(&mut *conn)
    .await?;

    Ok(page_view_id)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                domain TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sites_account ON sites(account_id)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS visitors (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                fingerprint_hash TEXT NOT NULL,
                first_seen_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                total_visits INTEGER NOT NULL DEFAULT 0,
                UNIQUE (site_id, fingerprint_hash)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                visitor_id TEXT NOT NULL REFERENCES visitors(id) ON DELETE CASCADE,
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                started_at INTEGER NOT NULL,
                last_activity_at INTEGER NOT NULL,
                ended_at INTEGER
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        // At most one open session per visitor
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_visitor
            ON sessions(visitor_id) WHERE ended_at IS NULL
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_site ON sessions(site_id)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS page_views (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                visitor_id TEXT NOT NULL REFERENCES visitors(id) ON DELETE CASCADE,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                page_url TEXT NOT NULL,
                page_title TEXT,
                referrer TEXT,
                user_agent TEXT,
                ip_address TEXT,
                country_code TEXT,
                browser_name TEXT,
                browser_version TEXT,
                os_name TEXT,
                os_version TEXT,
                device_type TEXT,
                screen_width INTEGER,
                screen_height INTEGER,
                viewed_at INTEGER NOT NULL,
                page_load_time INTEGER
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_page_views_site_viewed ON page_views(site_id, viewed_at)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_page_views_session ON page_views(session_id)")
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool.as_ref()).await?;
        Ok(())
    }

    async fn site_exists(&self, site_id: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS(SELECT 1 FROM sites WHERE id = ?)",
        )
        .bind(site_id)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(exists > 0)
    }

    async fn get_site(&self, site_id: &str) -> Result<Option<Site>> {
        let site = sqlx::query_as::<_, Site>(
            r#"
            SELECT id, account_id, name, domain, created_at, updated_at
            FROM sites
            WHERE id = ?
            "#,
        )
        .bind(site_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(site)
    }

    async fn resolve_visitor(
        &self,
        site_id: &str,
        fingerprint_hash: &str,
        now: i64,
    ) -> StorageResult<VisitorResolution> {
        let mut conn = self.pool.acquire().await?;
        resolve_visitor(&mut conn, site_id, fingerprint_hash, now).await
    }

    async fn resolve_session(
        &self,
        site_id: &str,
        visitor_id: &str,
        now: i64,
        window_secs: i64,
    ) -> StorageResult<SessionResolution> {
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;
        let session = resolve_session(&mut tx, site_id, visitor_id, now, window_secs).await?;
        tx.commit().await?;
        Ok(session)
    }

    async fn record_page_view(
        &self,
        event: &NewPageView,
        window_secs: i64,
    ) -> StorageResult<RecordedPageView> {
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;

        let visitor =
            resolve_visitor(&mut tx, &event.site_id, &event.fingerprint_hash, event.viewed_at)
                .await?;
        let session = resolve_session(
            &mut tx,
            &event.site_id,
            &visitor.visitor_id,
            event.viewed_at,
            window_secs,
        )
        .await?;
        touch_visitor(&mut tx, &visitor.visitor_id, event.viewed_at, session.created).await?;
        let page_view_id =
            insert_page_view(&mut tx, event, &visitor.visitor_id, &session.session_id).await?;

        tx.commit().await?;

        Ok(RecordedPageView {
            page_view_id,
            visitor_id: visitor.visitor_id,
            session_id: session.session_id,
            new_visitor: visitor.created,
            new_session: session.created,
        })
    }

    async fn end_session(&self, session_id: &str, ended_at: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET ended_at = ?
            WHERE id = ? AND ended_at IS NULL
            "#,
        )
        .bind(ended_at)
        .bind(session_id)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_visitor(&self, visitor_id: &str) -> Result<Option<Visitor>> {
        let visitor = sqlx::query_as::<_, Visitor>(
            r#"
            SELECT id, site_id, fingerprint_hash, first_seen_at, last_seen_at, total_visits
            FROM visitors
            WHERE id = ?
            "#,
        )
        .bind(visitor_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(visitor)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, visitor_id, site_id, started_at, last_activity_at, ended_at
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(session)
    }

    async fn list_page_views(&self, session_id: &str) -> Result<Vec<PageView>> {
        let views = sqlx::query_as::<_, PageView>(
            r#"
            SELECT id, site_id, visitor_id, session_id, page_url, page_title, referrer,
                   user_agent, ip_address, country_code, browser_name, browser_version,
                   os_name, os_version, device_type, screen_width, screen_height,
                   viewed_at, page_load_time
            FROM page_views
            WHERE session_id = ?
            ORDER BY viewed_at ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(views)
    }

    async fn count_visitors(&self, site_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM visitors WHERE site_id = ?")
            .bind(site_id)
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(count)
    }

    async fn count_sessions(&self, site_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions WHERE site_id = ?")
            .bind(site_id)
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(count)
    }

    async fn count_page_views(&self, site_id: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM page_views WHERE site_id = ?")
                .bind(site_id)
                .fetch_one(self.pool.as_ref())
                .await?;
        Ok(count)
    }

    async fn create_account(&self, name: &str) -> Result<Account> {
        let now = chrono::Utc::now().timestamp();
        let account_id = Uuid::new_v4().to_string();

        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (id, name, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, name, created_at, updated_at
            "#,
        )
        .bind(&account_id)
        .bind(name)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(account)
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, name, created_at, updated_at FROM accounts WHERE id = ?",
        )
        .bind(account_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(account)
    }

    async fn find_account_by_name(&self, name: &str) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, name, created_at, updated_at
            FROM accounts
            WHERE name = ?
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(account)
    }

    async fn list_accounts(&self) -> Result<Vec<AccountSummary>> {
        let accounts = sqlx::query_as::<_, AccountSummary>(
            r#"
            SELECT a.id, a.name, COUNT(s.id) AS site_count
            FROM accounts a
            LEFT JOIN sites s ON a.id = s.account_id
            GROUP BY a.id, a.name, a.created_at
            ORDER BY a.created_at DESC
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(accounts)
    }

    async fn create_site(
        &self,
        site_id: &str,
        account_id: &str,
        name: &str,
        domain: &str,
    ) -> StorageResult<Site> {
        let now = chrono::Utc::now().timestamp();

        let site = sqlx::query_as::<_, Site>(
            r#"
            INSERT INTO sites (id, account_id, name, domain, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            RETURNING id, account_id, name, domain, created_at, updated_at
            "#,
        )
        .bind(site_id)
        .bind(account_id)
        .bind(name)
        .bind(domain)
        .bind(now)
        .bind(now)
        .fetch_optional(self.pool.as_ref())
        .await?;

        site.ok_or(StorageError::Conflict)
    }

    async fn list_sites(&self, account_id: Option<&str>) -> Result<Vec<Site>> {
        let sites = sqlx::query_as::<_, Site>(
            r#"
            SELECT id, account_id, name, domain, created_at, updated_at
            FROM sites
            WHERE ? IS NULL OR account_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(account_id)
        .bind(account_id)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(sites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BrowserInfo;

    const SITE_ID: &str = "RollbackSite0123456789abcdefghij";
    const WINDOW: i64 = 1800;
    const T0: i64 = 1_700_000_000;

    async fn setup() -> SqliteStorage {
        let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
        storage.init().await.unwrap();
        let account = storage.create_account("Rollback Co").await.unwrap();
        storage
            .create_site(SITE_ID, &account.id, "Rollback", "rollback.test")
            .await
            .unwrap();
        storage
    }

    async fn fail_page_view_inserts(storage: &SqliteStorage) {
        sqlx::query(
            r#"
            CREATE TRIGGER reject_page_views BEFORE INSERT ON page_views
            BEGIN
                SELECT RAISE(ABORT, 'page view rejected');
            END
            "#,
        )
        .execute(storage.pool.as_ref())
        .await
        .unwrap();
    }

    fn event(viewed_at: i64) -> NewPageView {
        NewPageView {
            site_id: SITE_ID.to_string(),
            fingerprint_hash: "hash-a".to_string(),
            page_url: "https://rollback.test/".to_string(),
            page_title: None,
            referrer: None,
            user_agent: None,
            ip_address: None,
            browser: BrowserInfo::default(),
            screen_width: None,
            screen_height: None,
            page_load_time: None,
            viewed_at,
        }
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_no_visitor_or_session() {
        let storage = setup().await;
        fail_page_view_inserts(&storage).await;

        assert!(storage.record_page_view(&event(T0), WINDOW).await.is_err());

        assert_eq!(storage.count_visitors(SITE_ID).await.unwrap(), 0);
        assert_eq!(storage.count_sessions(SITE_ID).await.unwrap(), 0);
        assert_eq!(storage.count_page_views(SITE_ID).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_insert_keeps_existing_rows_untouched() {
        let storage = setup().await;
        let first = storage.record_page_view(&event(T0), WINDOW).await.unwrap();
        fail_page_view_inserts(&storage).await;

        // Past the window, so the failed event would have closed S1 and opened S2
        assert!(storage
            .record_page_view(&event(T0 + WINDOW + 60), WINDOW)
            .await
            .is_err());

        assert_eq!(storage.count_visitors(SITE_ID).await.unwrap(), 1);
        assert_eq!(storage.count_sessions(SITE_ID).await.unwrap(), 1);
        assert_eq!(storage.count_page_views(SITE_ID).await.unwrap(), 1);

        let session = storage.get_session(&first.session_id).await.unwrap().unwrap();
        assert_eq!(session.ended_at, None);
        assert_eq!(session.last_activity_at, T0);

        let visitor = storage.get_visitor(&first.visitor_id).await.unwrap().unwrap();
        assert_eq!(visitor.total_visits, 1);
        assert_eq!(visitor.last_seen_at, T0);
    }
}
