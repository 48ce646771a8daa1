use crate::models::{BrowserInfo, NewPageView};
use crate::storage::{SqliteStorage, Storage};
use std::sync::Arc;

const SITE_ID: &str = "PipelineSite0123456789abcdefghij";
const WINDOW: i64 = 1800;
const T0: i64 = 1_700_000_000;

async fn setup_sqlite() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    let account = storage.create_account("Pipeline Co").await.unwrap();
    storage
        .create_site(SITE_ID, &account.id, "Pipeline", "pipeline.test")
        .await
        .unwrap();
    Arc::new(storage)
}

fn event(fingerprint_hash: &str, viewed_at: i64) -> NewPageView {
    NewPageView {
        site_id: SITE_ID.to_string(),
        fingerprint_hash: fingerprint_hash.to_string(),
        page_url: "https://pipeline.test/".to_string(),
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
async fn test_resolve_visitor_is_idempotent() {
    let storage = setup_sqlite().await;

    let first = storage.resolve_visitor(SITE_ID, "hash-a", T0).await.unwrap();
    let second = storage
        .resolve_visitor(SITE_ID, "hash-a", T0 + 60)
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.visitor_id, second.visitor_id);
    assert_eq!(storage.count_visitors(SITE_ID).await.unwrap(), 1);

    let visitor = storage
        .get_visitor(&first.visitor_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(visitor.first_seen_at, T0);
    assert_eq!(visitor.total_visits, 0);
}

#[tokio::test]
async fn test_distinct_fingerprints_are_distinct_visitors() {
    let storage = setup_sqlite().await;

    let a = storage.resolve_visitor(SITE_ID, "hash-a", T0).await.unwrap();
    let b = storage.resolve_visitor(SITE_ID, "hash-b", T0).await.unwrap();

    assert_ne!(a.visitor_id, b.visitor_id);
    assert_eq!(storage.count_visitors(SITE_ID).await.unwrap(), 2);
}

#[tokio::test]
async fn test_session_reused_within_window() {
    let storage = setup_sqlite().await;
    let visitor = storage.resolve_visitor(SITE_ID, "hash-a", T0).await.unwrap();

    let first = storage
        .resolve_session(SITE_ID, &visitor.visitor_id, T0, WINDOW)
        .await
        .unwrap();
    let second = storage
        .resolve_session(SITE_ID, &visitor.visitor_id, T0 + WINDOW, WINDOW)
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.session_id, second.session_id);

    let session = storage
        .get_session(&first.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.started_at, T0);
    assert_eq!(session.last_activity_at, T0 + WINDOW);
}

#[tokio::test]
async fn test_lapsed_session_is_closed_and_replaced() {
    let storage = setup_sqlite().await;
    let visitor = storage.resolve_visitor(SITE_ID, "hash-a", T0).await.unwrap();

    let first = storage
        .resolve_session(SITE_ID, &visitor.visitor_id, T0, WINDOW)
        .await
        .unwrap();
    let second = storage
        .resolve_session(SITE_ID, &visitor.visitor_id, T0 + WINDOW + 1, WINDOW)
        .await
        .unwrap();

    assert!(second.created);
    assert_ne!(first.session_id, second.session_id);

    let stale = storage
        .get_session(&first.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stale.ended_at, Some(T0));
    assert_eq!(storage.count_sessions(SITE_ID).await.unwrap(), 2);
}

#[tokio::test]
async fn test_last_activity_never_moves_backward() {
    let storage = setup_sqlite().await;
    let visitor = storage.resolve_visitor(SITE_ID, "hash-a", T0).await.unwrap();

    let first = storage
        .resolve_session(SITE_ID, &visitor.visitor_id, T0 + 600, WINDOW)
        .await
        .unwrap();
    // A delayed beacon stamped earlier than the last one
    let late = storage
        .resolve_session(SITE_ID, &visitor.visitor_id, T0 + 300, WINDOW)
        .await
        .unwrap();

    assert_eq!(first.session_id, late.session_id);
    let session = storage
        .get_session(&first.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.last_activity_at, T0 + 600);
}

#[tokio::test]
async fn test_ended_session_is_not_reused() {
    let storage = setup_sqlite().await;
    let visitor = storage.resolve_visitor(SITE_ID, "hash-a", T0).await.unwrap();

    let first = storage
        .resolve_session(SITE_ID, &visitor.visitor_id, T0, WINDOW)
        .await
        .unwrap();
    assert!(storage.end_session(&first.session_id, T0 + 10).await.unwrap());
    assert!(!storage.end_session(&first.session_id, T0 + 20).await.unwrap());

    let second = storage
        .resolve_session(SITE_ID, &visitor.visitor_id, T0 + 60, WINDOW)
        .await
        .unwrap();

    assert!(second.created);
    assert_ne!(first.session_id, second.session_id);
}

#[tokio::test]
async fn test_record_page_view_counters() {
    let storage = setup_sqlite().await;

    let p1 = storage.record_page_view(&event("hash-a", T0), WINDOW).await.unwrap();
    let p2 = storage
        .record_page_view(&event("hash-a", T0 + 300), WINDOW)
        .await
        .unwrap();
    let p3 = storage
        .record_page_view(&event("hash-a", T0 + 300 + 2400), WINDOW)
        .await
        .unwrap();

    assert!(p1.new_visitor && p1.new_session);
    assert!(!p2.new_visitor && !p2.new_session);
    assert!(!p3.new_visitor && p3.new_session);
    assert_eq!(p1.session_id, p2.session_id);
    assert_ne!(p2.session_id, p3.session_id);

    let visitor = storage
        .get_visitor(&p1.visitor_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(visitor.total_visits, 2);
    assert_eq!(visitor.first_seen_at, T0);
    assert_eq!(visitor.last_seen_at, T0 + 2700);

    assert_eq!(storage.count_page_views(SITE_ID).await.unwrap(), 3);
    assert_eq!(storage.list_page_views(&p1.session_id).await.unwrap().len(), 2);
    assert_eq!(storage.list_page_views(&p3.session_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_page_view_optional_fields_stored_as_null() {
    let storage = setup_sqlite().await;

    let recorded = storage.record_page_view(&event("hash-a", T0), WINDOW).await.unwrap();
    let views = storage.list_page_views(&recorded.session_id).await.unwrap();

    assert_eq!(views.len(), 1);
    let view = &views[0];
    assert_eq!(view.id, recorded.page_view_id);
    assert_eq!(view.visitor_id, recorded.visitor_id);
    assert_eq!(view.page_url, "https://pipeline.test/");
    assert_eq!(view.viewed_at, T0);
    assert!(view.page_title.is_none());
    assert!(view.referrer.is_none());
    assert!(view.user_agent.is_none());
    assert!(view.ip_address.is_none());
    assert!(view.country_code.is_none());
    assert!(view.device_type.is_none());
    assert!(view.screen_width.is_none());
    assert!(view.page_load_time.is_none());
}

#[tokio::test]
async fn test_sites_listing_and_conflict() {
    let storage = setup_sqlite().await;
    let other = storage.create_account("Other Co").await.unwrap();

    let err = storage
        .create_site(SITE_ID, &other.id, "Dup", "dup.test")
        .await
        .unwrap_err();
    assert!(matches!(err, crate::storage::StorageError::Conflict));

    assert_eq!(storage.list_sites(None).await.unwrap().len(), 1);
    assert!(storage.list_sites(Some(&other.id)).await.unwrap().is_empty());

    let accounts = storage.list_accounts().await.unwrap();
    let pipeline = accounts.iter().find(|a| a.name == "Pipeline Co").unwrap();
    assert_eq!(pipeline.site_count, 1);

    let found = storage.find_account_by_name("Other Co").await.unwrap().unwrap();
    assert_eq!(found.id, other.id);
    assert!(storage.get_site(SITE_ID).await.unwrap().is_some());
}
