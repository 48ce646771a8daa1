use crate::models::{
    Account, AccountSummary, NewPageView, PageView, RecordedPageView, Session, SessionResolution,
    Site, Visitor, VisitorResolution,
};
use crate::storage::{Storage, StorageError, StorageResult};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

pub struct PostgresStorage {
    pool: Arc<PgPool>,
}

impl PostgresStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

async fn find_visitor_id(
    conn: &mut PgConnection,
    site_id: &str,
    fingerprint_hash: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        r#"
        SELECT id FROM visitors
        WHERE site_id = $1 AND fingerprint_hash = $2
        "#,
    )
    .bind(site_id)
    .bind(fingerprint_hash)
    .fetch_optional(&mut *conn)
    .await
}

async fn resolve_visitor(
    conn: &mut PgConnection,
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

    // Blocks on a concurrent uncommitted insert of the same key, then skips
    let inserted = sqlx::query_scalar::<_, String>(
        r#"
        INSERT INTO visitors (id, site_id, fingerprint_hash, first_seen_at, last_seen_at, total_visits)
        VALUES ($1, $2, $3, $4, $4, 0)
        ON CONFLICT (site_id, fingerprint_hash) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(site_id)
    .bind(fingerprint_hash)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(visitor_id) = inserted {
        return Ok(VisitorResolution {
            visitor_id,
            created: true,
        });
    }

    let visitor_id = find_visitor_id(conn, site_id, fingerprint_hash)
        .await?
        .ok_or_else(|| anyhow!("visitor missing after insert conflict"))?;

    Ok(VisitorResolution {
        visitor_id,
        created: false,
    })
}

async fn touch_active_session(
    conn: &mut PgConnection,
    site_id: &str,
    visitor_id: &str,
    now: i64,
    window_secs: i64,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        r#"
        UPDATE sessions
        SET last_activity_at = GREATEST(last_activity_at, $1)
        WHERE visitor_id = $2
          AND site_id = $3
          AND ended_at IS NULL
          AND last_activity_at >= $4
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
    conn: &mut PgConnection,
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

    sqlx::query(
        r#"
        UPDATE sessions
        SET ended_at = last_activity_at
        WHERE visitor_id = $1
          AND ended_at IS NULL
          AND last_activity_at < $2
        "#,
    )
    .bind(visitor_id)
    .bind(now - window_secs)
    .execute(&mut *conn)
    .await?;

    let inserted = sqlx::query_scalar::<_, String>(
        r#"
        INSERT INTO sessions (id, visitor_id, site_id, started_at, last_activity_at)
        VALUES ($1, $2, $3, $4, $4)
        ON CONFLICT DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(visitor_id)
    .bind(site_id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(session_id) = inserted {
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

async fn touch_visitor(
    conn: &mut PgConnection,
    visitor_id: &str,
    now: i64,
    new_session: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE visitors
        SET last_seen_at = GREATEST(last_seen_at, $1),
            total_visits = total_visits + $2
        WHERE id = $3
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
    conn: &mut PgConnection,
    event: &NewPageView,
    visitor_id: &str,
    session_id: &str,
) -> Result<String, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        r#"
        INSERT INTO page_views (
            id, site_id, visitor_id, session_id, page_url, page_title, referrer,
            user_agent, ip_address, country_code, browser_name, browser_version,
            os_name, os_version, device_type, screen_width, screen_height,
            viewed_at, page_load_time
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, $10, $11, $12, $13, $14, $15, $16, $17, $18
        )
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4().to_string())
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
    .fetch_one(&mut *conn)
    .await
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
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
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
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
                first_seen_at BIGINT NOT NULL,
                last_seen_at BIGINT NOT NULL,
                total_visits BIGINT NOT NULL DEFAULT 0,
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
                started_at BIGINT NOT NULL,
                last_activity_at BIGINT NOT NULL,
                ended_at BIGINT
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

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
                screen_width BIGINT,
                screen_height BIGINT,
                viewed_at BIGINT NOT NULL,
                page_load_time BIGINT
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
        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM sites WHERE id = $1)")
                .bind(site_id)
                .fetch_one(self.pool.as_ref())
                .await?;

        Ok(exists)
    }

    async fn get_site(&self, site_id: &str) -> Result<Option<Site>> {
        let site = sqlx::query_as::<_, Site>(
            r#"
            SELECT id, account_id, name, domain, created_at, updated_at
            FROM sites
            WHERE id = $1
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
        let mut tx = self.pool.begin().await?;
        let session = resolve_session(&mut tx, site_id, visitor_id, now, window_secs).await?;
        tx.commit().await?;
        Ok(session)
    }

    async fn record_page_view(
        &self,
        event: &NewPageView,
        window_secs: i64,
    ) -> StorageResult<RecordedPageView> {
        let mut tx = self.pool.begin().await?;

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
            SET ended_at = $1
            WHERE id = $2 AND ended_at IS NULL
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
            WHERE id = $1
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
            WHERE id = $1
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
            WHERE session_id = $1
            ORDER BY viewed_at ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(views)
    }

    async fn count_visitors(&self, site_id: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM visitors WHERE site_id = $1")
                .bind(site_id)
                .fetch_one(self.pool.as_ref())
                .await?;
        Ok(count)
    }

    async fn count_sessions(&self, site_id: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions WHERE site_id = $1")
                .bind(site_id)
                .fetch_one(self.pool.as_ref())
                .await?;
        Ok(count)
    }

    async fn count_page_views(&self, site_id: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM page_views WHERE site_id = $1")
                .bind(site_id)
                .fetch_one(self.pool.as_ref())
                .await?;
        Ok(count)
    }

    async fn create_account(&self, name: &str) -> Result<Account> {
        let now = chrono::Utc::now().timestamp();

        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (id, name, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            RETURNING id, name, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(account)
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, name, created_at, updated_at FROM accounts WHERE id = $1",
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
            WHERE name = $1
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
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (id) DO NOTHING
            RETURNING id, account_id, name, domain, created_at, updated_at
            "#,
        )
        .bind(site_id)
        .bind(account_id)
        .bind(name)
        .bind(domain)
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
            WHERE $1::TEXT IS NULL OR account_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(account_id)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(sites)
    }
}
