//! End-to-end tests for the sync engine against a mock HTTP server
//!
//! These tests wire the real Flickr client and image fetcher to a local
//! mockito server and verify:
//! - One search per empty pin, none once photos are stored
//! - Error statuses leave the pin empty
//! - Image bytes are fetched once and survive a restart

use log::info;
use mockito::{Matcher, Server, ServerGuard};
use std::path::Path;
use std::sync::{Arc, Once};
use tempfile::tempdir;
use url::Url;

use pinphotos::engine::{EngineError, ImageOutcome, PinState, SyncEngine};
use pinphotos::fetch::HttpImageFetcher;
use pinphotos::flickr::{FixedPage, FlickrClient, SearchError};
use pinphotos::selection::SelectionSet;
use pinphotos::store::PhotoStore;

// Initialize the logger only once
static INIT: Once = Once::new();

fn init_logger() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .is_test(true)
            .init();
    });
}

fn search_body(server: &ServerGuard) -> String {
    format!(
        r#"{{"photos": {{"page": 4, "photo": [
            {{"id": "b", "title": "Second", "url_m": "{url}/img/b.jpg"}},
            {{"id": "a", "title": "First", "url_m": "{url}/img/a.jpg"}},
            {{"id": "c", "title": "Third", "url_m": "{url}/img/c.jpg"}}
        ]}}, "stat": "ok"}}"#,
        url = server.url()
    )
}

fn engine_for(server: &ServerGuard, dir: &Path) -> Arc<SyncEngine> {
    let store = PhotoStore::open(&dir.join("pins.yaml"), &dir.join("images")).unwrap();
    let base = Url::parse(&format!("{}/services/rest/", server.url())).unwrap();
    let search = FlickrClient::new(base, "test-key".to_string(), Box::new(FixedPage(4)));
    Arc::new(SyncEngine::new(
        store,
        Arc::new(search),
        Arc::new(HttpImageFetcher::new()),
        0.0001,
    ))
}

#[tokio::test]
async fn test_display_searches_once_and_caches() {
    init_logger();
    let dir = tempdir().unwrap();
    let mut server = Server::new_async().await;
    let body = search_body(&server);

    let search = server
        .mock("GET", "/services/rest/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("lat".into(), "45.5".into()),
            Matcher::UrlEncoded("lon".into(), "-73.6".into()),
            Matcher::UrlEncoded("page".into(), "4".into()),
        ]))
        .with_status(200)
        .with_body(body)
        .expect(1)
        .create_async()
        .await;

    let engine = engine_for(&server, dir.path());
    let pin = engine.add_pin(45.5, -73.6).unwrap();

    let view = engine.photos_for_display(pin.id).unwrap();
    assert!(view.photos.is_empty());
    let changes = view.pending.unwrap().await.unwrap().unwrap();
    info!("Initial change set: {changes:?}");

    // b, a, c in response order sit at sorted positions 1, 0, 2
    assert_eq!(changes.inserted, vec![1, 0, 2]);

    let view = engine.photos_for_display(pin.id).unwrap();
    assert!(view.pending.is_none());
    let ids: Vec<_> = view.photos.iter().map(|p| p.id.clone().unwrap()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    search.assert_async().await;
}

#[tokio::test]
async fn test_server_error_leaves_pin_empty() {
    init_logger();
    let dir = tempdir().unwrap();
    let mut server = Server::new_async().await;

    let _search = server
        .mock("GET", "/services/rest/")
        .match_query(Matcher::Any)
        .with_status(500)
        .create_async()
        .await;

    let engine = engine_for(&server, dir.path());
    let pin = engine.add_pin(45.5, -73.6).unwrap();

    let result = engine.photos_for_display(pin.id).unwrap().pending.unwrap().await.unwrap();

    match result {
        Err(EngineError::Search(SearchError::Request(status))) => assert_eq!(status.as_u16(), 500),
        other => panic!("expected a request error, got {other:?}"),
    }
    assert_eq!(engine.photos(pin.id).unwrap().len(), 0);
    assert_eq!(engine.pin_state(pin.id).unwrap(), PinState::Empty);
}

#[tokio::test]
async fn test_images_fetched_once_and_survive_restart() {
    init_logger();
    let dir = tempdir().unwrap();
    let mut server = Server::new_async().await;
    let body = search_body(&server);

    let _search = server
        .mock("GET", "/services/rest/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;
    let image = server
        .mock("GET", "/img/a.jpg")
        .with_status(200)
        .with_body("jpeg-a")
        .expect(1)
        .create_async()
        .await;

    let key = {
        let engine = engine_for(&server, dir.path());
        let pin = engine.add_pin(10.0, 20.0).unwrap();
        engine.refresh(pin.id).await.unwrap();
        let key = engine.photos(pin.id).unwrap()[0].key;

        match engine.ensure_image(key).await.unwrap() {
            ImageOutcome::Fetched { changes, .. } => assert_eq!(changes.updated, vec![0]),
            other => panic!("expected a fetch, got {other:?}"),
        }
        key
    };

    let engine = engine_for(&server, dir.path());
    let outcome = engine.ensure_image(key).await.unwrap();

    assert_eq!(outcome.bytes(), Some(&b"jpeg-a"[..]));
    assert!(matches!(outcome, ImageOutcome::Cached(_)));
    image.assert_async().await;
}

#[tokio::test]
async fn test_delete_selected_then_delete_all() {
    init_logger();
    let dir = tempdir().unwrap();
    let mut server = Server::new_async().await;
    let body = search_body(&server);

    let search = server
        .mock("GET", "/services/rest/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(body)
        .expect(2)
        .create_async()
        .await;

    let engine = engine_for(&server, dir.path());
    let pin = engine.add_pin(1.0, 2.0).unwrap();
    engine.refresh(pin.id).await.unwrap();

    let mut selection = SelectionSet::new();
    selection.toggle(0);
    selection.toggle(2);
    let changes = engine.delete_selected(pin.id, &mut selection).await.unwrap();

    assert_eq!(changes.deleted, vec![0, 2]);
    let remaining = engine.photos(pin.id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id.as_deref(), Some("b"));

    let changes = engine.delete_all(pin.id).await.unwrap();
    assert_eq!(changes.deleted, vec![0]);
    assert_eq!(changes.inserted.len(), 3);
    assert_eq!(engine.photos(pin.id).unwrap().len(), 3);

    search.assert_async().await;
}
