//! End-to-end tracking pipeline tests
//!
//! Tests can be filtered by database backend using the DATABASE_BACKEND environment variable:
//! - `DATABASE_BACKEND=sqlite cargo test` - Run only SQLite tests
//! - `DATABASE_BACKEND=postgres cargo test` - Run only PostgreSQL tests
//! - By default, both backends are tested (PostgreSQL only when DATABASE_URL points at one)

use std::sync::Arc;
use trackveil::models::{SiteId, TrackRequest};
use trackveil::storage::{PostgresStorage, SqliteStorage, Storage};
use trackveil::tracking::{hash_fingerprint, RequestMeta, TrackError, Tracker};

const SESSION_WINDOW: i64 = 30 * 60;
const T0: i64 = 1_700_000_000;

fn should_test_backend(backend: &str) -> bool {
    match std::env::var("DATABASE_BACKEND") {
        Ok(val) => val.to_lowercase() == backend.to_lowercase(),
        Err(_) => true,
    }
}

async fn create_sqlite_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

async fn create_postgres_storage() -> Option<Arc<dyn Storage>> {
    let db_url = std::env::var("DATABASE_URL").ok()?;
    let storage = PostgresStorage::new(&db_url, 5).await.ok()?;
    storage.init().await.ok()?;
    Some(Arc::new(storage))
}

/// Register a fresh site so runs against a persistent database stay isolated
async fn register_site(storage: &Arc<dyn Storage>) -> SiteId {
    let site_id = SiteId::generate();
    let account = storage
        .create_account(&format!("account-{}", site_id))
        .await
        .unwrap();
    storage
        .create_site(site_id.as_str(), &account.id, "Example", "example.com")
        .await
        .unwrap();
    site_id
}

fn beacon(site_id: &str, page_url: &str, fingerprint: &str) -> TrackRequest {
    TrackRequest {
        site_id: Some(site_id.to_string()),
        page_url: Some(page_url.to_string()),
        fingerprint: Some(fingerprint.to_string()),
        ..Default::default()
    }
}

async fn run_worked_example(storage: Arc<dyn Storage>) {
    let site_id = register_site(&storage).await;
    let tracker = Tracker::new(Arc::clone(&storage), SESSION_WINDOW);

    // First sight of the browser
    let p1 = tracker
        .track_at(
            beacon(site_id.as_str(), "https://example.com/", "abc123"),
            RequestMeta::default(),
            T0,
        )
        .await
        .unwrap();
    assert!(p1.new_visitor);
    assert!(p1.new_session);

    let visitor = storage.get_visitor(&p1.visitor_id).await.unwrap().unwrap();
    assert_eq!(visitor.fingerprint_hash, hash_fingerprint(&site_id, "abc123"));
    assert_eq!(visitor.first_seen_at, T0);

    // Five minutes later, same session
    let p2 = tracker
        .track_at(
            beacon(site_id.as_str(), "https://example.com/pricing", "abc123"),
            RequestMeta::default(),
            T0 + 5 * 60,
        )
        .await
        .unwrap();
    assert_eq!(p2.visitor_id, p1.visitor_id);
    assert_eq!(p2.session_id, p1.session_id);
    assert_ne!(p2.page_view_id, p1.page_view_id);
    assert!(!p2.new_session);

    let s1 = storage.get_session(&p1.session_id).await.unwrap().unwrap();
    assert_eq!(s1.started_at, T0);
    assert_eq!(s1.last_activity_at, T0 + 5 * 60);

    // Forty minutes after that, a new session for the same visitor
    let p3 = tracker
        .track_at(
            beacon(site_id.as_str(), "https://example.com/", "abc123"),
            RequestMeta::default(),
            T0 + 45 * 60,
        )
        .await
        .unwrap();
    assert_eq!(p3.visitor_id, p1.visitor_id);
    assert_ne!(p3.session_id, p1.session_id);
    assert!(p3.new_session);

    let s1 = storage.get_session(&p1.session_id).await.unwrap().unwrap();
    assert_eq!(s1.ended_at, Some(T0 + 5 * 60));

    assert_eq!(storage.count_visitors(site_id.as_str()).await.unwrap(), 1);
    assert_eq!(storage.count_sessions(site_id.as_str()).await.unwrap(), 2);
    assert_eq!(storage.count_page_views(site_id.as_str()).await.unwrap(), 3);

    let visitor = storage.get_visitor(&p1.visitor_id).await.unwrap().unwrap();
    assert_eq!(visitor.total_visits, 2);
    assert_eq!(visitor.last_seen_at, T0 + 45 * 60);

    let first_session_views = storage.list_page_views(&p1.session_id).await.unwrap();
    let urls: Vec<&str> = first_session_views
        .iter()
        .map(|v| v.page_url.as_str())
        .collect();
    assert_eq!(urls, vec!["https://example.com/", "https://example.com/pricing"]);
}

async fn run_rejections_write_nothing(storage: Arc<dyn Storage>) {
    let site_id = register_site(&storage).await;
    let tracker = Tracker::new(Arc::clone(&storage), SESSION_WINDOW);

    let truncated = &site_id.as_str()[..31];
    let err = tracker
        .track_at(
            beacon(truncated, "https://example.com/", "abc123"),
            RequestMeta::default(),
            T0,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TrackError::InvalidSiteFormat));

    let unknown = SiteId::generate();
    let err = tracker
        .track_at(
            beacon(unknown.as_str(), "https://example.com/", "abc123"),
            RequestMeta::default(),
            T0,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TrackError::SiteNotFound));

    assert_eq!(storage.count_visitors(site_id.as_str()).await.unwrap(), 0);
    assert_eq!(storage.count_visitors(unknown.as_str()).await.unwrap(), 0);
    assert_eq!(storage.count_page_views(unknown.as_str()).await.unwrap(), 0);
}

async fn run_fingerprints_scoped_per_site(storage: Arc<dyn Storage>) {
    let site_a = register_site(&storage).await;
    let site_b = register_site(&storage).await;
    let tracker = Tracker::new(Arc::clone(&storage), SESSION_WINDOW);

    let on_a = tracker
        .track_at(
            beacon(site_a.as_str(), "https://a.example/", "shared"),
            RequestMeta::default(),
            T0,
        )
        .await
        .unwrap();
    let on_b = tracker
        .track_at(
            beacon(site_b.as_str(), "https://b.example/", "shared"),
            RequestMeta::default(),
            T0,
        )
        .await
        .unwrap();

    assert!(on_a.new_visitor);
    assert!(on_b.new_visitor);
    assert_ne!(on_a.visitor_id, on_b.visitor_id);
}

#[tokio::test]
async fn test_worked_example_sqlite() {
    if !should_test_backend("sqlite") {
        return;
    }
    run_worked_example(create_sqlite_storage().await).await;
}

#[tokio::test]
async fn test_rejections_write_nothing_sqlite() {
    if !should_test_backend("sqlite") {
        return;
    }
    run_rejections_write_nothing(create_sqlite_storage().await).await;
}

#[tokio::test]
async fn test_fingerprints_scoped_per_site_sqlite() {
    if !should_test_backend("sqlite") {
        return;
    }
    run_fingerprints_scoped_per_site(create_sqlite_storage().await).await;
}

#[tokio::test]
async fn test_worked_example_postgres() {
    if !should_test_backend("postgres") {
        return;
    }
    let Some(storage) = create_postgres_storage().await else {
        println!("SKIPPED: PostgreSQL not available");
        return;
    };
    run_worked_example(storage).await;
}

#[tokio::test]
async fn test_rejections_write_nothing_postgres() {
    if !should_test_backend("postgres") {
        return;
    }
    let Some(storage) = create_postgres_storage().await else {
        println!("SKIPPED: PostgreSQL not available");
        return;
    };
    run_rejections_write_nothing(storage).await;
}

#[tokio::test]
async fn test_fingerprints_scoped_per_site_postgres() {
    if !should_test_backend("postgres") {
        return;
    }
    let Some(storage) = create_postgres_storage().await else {
        println!("SKIPPED: PostgreSQL not available");
        return;
    };
    run_fingerprints_scoped_per_site(storage).await;
}
