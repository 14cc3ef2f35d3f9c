mod common;

use actix_web::{test, web, App};
use common::{config, named, record, wait_until, FakeCatalog};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

use igdb_sync::api::auth::Auth;
use igdb_sync::api::routes::configure_routes;
use igdb_sync::api::AppState;
use igdb_sync::database_ops::igdb::{EntityKind, SyncService};
use igdb_sync::database_ops::store::MemoryCatalogStore;

const SECRET: &str = "operator-secret";

fn state(fake: Arc<FakeCatalog>, store: Arc<MemoryCatalogStore>) -> web::Data<AppState> {
    web::Data::new(AppState {
        service: Arc::new(SyncService::new(fake, store, config(50))),
        db: None,
        started_at: Instant::now(),
    })
}

fn trigger(body: &str) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/api/v1/igdb/sync")
        .insert_header(("Authorization", format!("Bearer {SECRET}")))
        .insert_header(("Content-Type", "application/json"))
        .set_payload(body.to_string())
}

#[actix_web::test]
async fn trigger_requires_the_operator_token() {
    let fake = FakeCatalog::new();
    let app = test::init_service(
        App::new()
            .app_data(state(fake.clone(), Arc::new(MemoryCatalogStore::new())))
            .wrap(Auth::new(SECRET))
            .configure(configure_routes),
    )
    .await;

    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/api/v1/igdb/sync").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 401);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/api/v1/igdb/sync")
            .insert_header(("Authorization", "Bearer wrong"))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 401);
    assert_eq!(fake.auth_calls(), 0);
}

#[actix_web::test]
async fn health_is_public_and_reports_the_memory_store() {
    let app = test::init_service(
        App::new()
            .app_data(state(FakeCatalog::new(), Arc::new(MemoryCatalogStore::new())))
            .wrap(Auth::new(SECRET))
            .configure(configure_routes),
    )
    .await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["database"], json!("memory"));
    assert_eq!(body["data"]["sync_running"], json!(false));
}

#[actix_web::test]
async fn trigger_starts_a_run_and_rejects_a_second_one() {
    let fake = FakeCatalog::new();
    let mut r = record(42, 1_700_000_000);
    r.platforms = vec![6];
    fake.set_records(vec![r]);
    fake.entity(EntityKind::Platform, named(6, "PC"));
    let gate = Arc::new(Semaphore::new(0));
    fake.gate_pages(gate.clone());
    let store = Arc::new(MemoryCatalogStore::new());
    let data = state(fake.clone(), store.clone());
    let app = test::init_service(
        App::new()
            .app_data(data.clone())
            .wrap(Auth::new(SECRET))
            .configure(configure_routes),
    )
    .await;

    let resp = test::call_service(
        &app,
        trigger(r#"{"start": "2020-01-01", "search_type": "updated_at"}"#).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 202);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["data"]["status"], json!("started"));
    assert_eq!(body["data"]["search_type"], json!("updated_at"));

    let resp = test::call_service(&app, trigger("").to_request()).await;
    assert_eq!(resp.status(), 409);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/v1/igdb/sync/status")
            .insert_header(("Authorization", format!("Bearer {SECRET}")))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["data"]["running"], json!(true));

    gate.add_permits(10);
    let service = data.service.clone();
    wait_until(|| !service.is_running()).await;
    assert_eq!(store.game_count(), 1);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/v1/igdb/sync/status")
            .insert_header(("Authorization", format!("Bearer {SECRET}")))
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["data"]["running"], json!(false));
    assert_eq!(body["data"]["state"]["state"], json!("done"));
    assert_eq!(body["data"]["last_report"]["upserted"], json!(1));
    assert_eq!(body["data"]["last_report"]["status"], json!("succeeded"));
}

#[actix_web::test]
async fn malformed_trigger_bodies_are_rejected() {
    let fake = FakeCatalog::new();
    let app = test::init_service(
        App::new()
            .app_data(state(fake.clone(), Arc::new(MemoryCatalogStore::new())))
            .wrap(Auth::new(SECRET))
            .configure(configure_routes),
    )
    .await;

    for body in [
        "{not json",
        r#"{"search_type": "first_release_date"}"#,
        r#"{"start": "last tuesday"}"#,
    ] {
        let resp = test::call_service(&app, trigger(body).to_request()).await;
        assert_eq!(resp.status(), 400, "{body}");
    }
    assert_eq!(fake.auth_calls(), 0);
}

#[actix_web::test]
async fn rejected_credentials_map_to_bad_gateway() {
    let fake = FakeCatalog::new();
    fake.reject_auth();
    let app = test::init_service(
        App::new()
            .app_data(state(fake.clone(), Arc::new(MemoryCatalogStore::new())))
            .wrap(Auth::new(SECRET))
            .configure(configure_routes),
    )
    .await;

    let resp = test::call_service(&app, trigger("").to_request()).await;

    assert_eq!(resp.status(), 502);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], json!(false));
    assert!(body["error"].as_str().unwrap().contains("authentication failed"));
}
