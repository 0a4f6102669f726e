use std::time::Duration;

use axum::{
    extract::Path,
    routing::{get, post},
    Json, Router,
};
use reqwest::StatusCode;
use serde_json::{json, Value};
use uuid::Uuid;

use aetos_api::app::{build_app, Orchestrator};
use aetos_infra::{OrchestratorConfig, RelayConfig};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    _orchestrator: Orchestrator,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with_scraper("http://127.0.0.1:9".to_string()).await
    }

    async fn spawn_with_scraper(scraper_url: String) -> Self {
        let config = OrchestratorConfig {
            scraper_url,
            scraper_api_key: "test-key".to_string(),
            relay: RelayConfig::default().with_poll_interval(Duration::from_millis(10)),
            scrape_schedule: None,
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator::start(&config)
            .await
            .expect("failed to start orchestrator");

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(orchestrator.services());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            _orchestrator: orchestrator,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A scraper stand-in that accepts every scrape request and reports every
/// job as completed.
async fn spawn_scraper_stub(job_id: Uuid) -> String {
    let app = Router::new()
        .route(
            "/scrape",
            post(move |Json(body): Json<Value>| async move {
                Json(json!({
                    "job_id": job_id,
                    "status": "pending",
                    "message": format!("scraping {}", body["search"].as_str().unwrap_or_default()),
                }))
            }),
        )
        .route(
            "/scrape/:id",
            get(|Path(id): Path<Uuid>| async move {
                Json(json!({ "job_id": id, "status": "completed", "result": { "matches": [] } }))
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn job_complete_body(job_id: Uuid, product_ids: &[i64]) -> Value {
    let matches: Vec<Value> = product_ids
        .iter()
        .map(|id| {
            json!({
                "listing": {
                    "url": format!("https://marketplace.example/item/{id}"),
                    "title": format!("Rolex Submariner ref {id}"),
                    "price": 7500.0,
                },
                "product": { "id": id, "brand": "Rolex", "model": "Submariner" },
                "confidence": 92.5,
                "potential_profit": 1800.0,
            })
        })
        .collect();
    json!({ "job_id": job_id, "brand": "Rolex", "matches": matches })
}

async fn ingest(client: &reqwest::Client, base_url: &str, product_ids: &[i64]) -> Value {
    let res = client
        .post(format!("{}/webhooks/scraper/job-complete", base_url))
        .json(&job_complete_body(Uuid::now_v7(), product_ids))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    res.json().await.unwrap()
}

async fn first_listing_id(client: &reqwest::Client, base_url: &str, product_id: i64) -> String {
    let res = client
        .get(format!("{}/admin/listings?product_id={}", base_url, product_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    body["listings"][0]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_store_and_backlog() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "memory");
    assert!(body["outbox_backlog"].is_u64());
}

#[tokio::test]
async fn job_complete_webhook_is_idempotent() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let body = job_complete_body(Uuid::now_v7(), &[230, 231]);

    let first: Value = client
        .post(format!("{}/webhooks/scraper/job-complete", srv.base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first, json!({ "accepted": true, "created": 2, "skipped": 0 }));

    let res = client
        .post(format!("{}/webhooks/scraper/job-complete", srv.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let second: Value = res.json().await.unwrap();
    assert_eq!(second, json!({ "accepted": true, "created": 0, "skipped": 2 }));

    let page: Value = client
        .get(format!("{}/admin/listings", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 2);
}

#[tokio::test]
async fn admin_transition_records_history() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    ingest(&client, &srv.base_url, &[230]).await;
    let id = first_listing_id(&client, &srv.base_url, 230).await;

    let res = client
        .post(format!("{}/admin/listings/{}/transition", srv.base_url, id))
        .json(&json!({ "to_state": "MESSAGING", "reason": "auto-contact" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["listing"]["state"], "MESSAGING");
    assert_eq!(body["listing"]["version"], 2);
    assert_eq!(body["transition"]["reason"], "auto-contact");
    assert_eq!(body["transition"]["triggered_by"], "admin_api");

    let history: Value = client
        .get(format!("{}/admin/listings/{}/history", srv.base_url, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["current_state"], "MESSAGING");
    let entries = history["history"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["from_state"], Value::Null);
    assert_eq!(entries[0]["to_state"], "FOUND");
    assert_eq!(entries[1]["from_state"], "FOUND");
    assert_eq!(entries[1]["to_state"], "MESSAGING");
}

#[tokio::test]
async fn admin_transition_requires_reason() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    ingest(&client, &srv.base_url, &[301]).await;
    let id = first_listing_id(&client, &srv.base_url, 301).await;

    let res = client
        .post(format!("{}/admin/listings/{}/transition", srv.base_url, id))
        .json(&json!({ "to_state": "MESSAGING", "reason": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "missing_reason");
    assert_eq!(body["current_state"], "FOUND");
}

#[tokio::test]
async fn invalid_transition_reports_current_state() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    ingest(&client, &srv.base_url, &[302]).await;
    let id = first_listing_id(&client, &srv.base_url, 302).await;

    let res = client
        .post(format!("{}/admin/listings/{}/transition", srv.base_url, id))
        .json(&json!({ "to_state": "SOLD", "reason": "skip ahead" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_transition");
    assert_eq!(body["current_state"], "FOUND");

    let listing: Value = client
        .get(format!("{}/admin/listings/{}", srv.base_url, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["state"], "FOUND");
    assert_eq!(listing["version"], 1);
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/admin/listings/{}/transition", srv.base_url, Uuid::now_v7()))
        .json(&json!({ "to_state": "MESSAGING", "reason": "contact" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client
        .get(format!("{}/admin/listings/not-a-uuid", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(format!("{}/admin/listings?state=shipped", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_state");
}

#[tokio::test]
async fn search_filters_and_paginates() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    ingest(&client, &srv.base_url, &[401, 402, 403]).await;
    let id = first_listing_id(&client, &srv.base_url, 402).await;

    let res = client
        .post(format!("{}/admin/listings/{}/transition", srv.base_url, id))
        .json(&json!({ "to_state": "CANCELLED", "reason": "seller unresponsive" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let found: Value = client
        .get(format!("{}/admin/listings?state=found&brand=rolex", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found["total"], 2);

    let page: Value = client
        .get(format!("{}/admin/listings?limit=1&offset=1", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 3);
    assert_eq!(page["limit"], 1);
    assert_eq!(page["offset"], 1);
    assert_eq!(page["listings"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn messaging_entry_is_dispatched_and_parked() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    ingest(&client, &srv.base_url, &[230]).await;
    let id = first_listing_id(&client, &srv.base_url, 230).await;

    client
        .post(format!("{}/admin/listings/{}/transition", srv.base_url, id))
        .json(&json!({ "to_state": "MESSAGING", "reason": "auto-contact" }))
        .send()
        .await
        .unwrap();

    // Relay and dispatch run in the background; poll until the step is recorded.
    let mut records = Vec::new();
    for _ in 0..100 {
        let body: Value = client
            .get(format!("{}/admin/dispatch", srv.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        records = body["records"].as_array().cloned().unwrap_or_default();
        if !records.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(records.len(), 1, "dispatch step was not recorded in time");
    assert_eq!(records[0]["listing_id"], id);
    assert_eq!(records[0]["coordinator"], "chatterbot");
    assert_eq!(records[0]["resolution"], "pending");

    let listing: Value = client
        .get(format!("{}/admin/listings/{}", srv.base_url, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["state"], "MESSAGING");
}

#[tokio::test]
async fn scrape_trigger_calls_scraper() {
    let job_id = Uuid::now_v7();
    let scraper_url = spawn_scraper_stub(job_id).await;
    let srv = TestServer::spawn_with_scraper(scraper_url).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/admin/scrape/trigger", srv.base_url))
        .json(&json!({ "brand": "Omega" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["job_id"], job_id.to_string());
    assert_eq!(body["status"], "pending");
    assert_eq!(body["message"], "scraping Omega");

    assert_eq!(body["brand"], "Omega");
    assert_eq!(body["search_term"], "Omega");
    assert_eq!(body["source"], "manual");

    // Blank brand with nothing in the rotation.
    let res = client
        .post(format!("{}/admin/scrape/trigger", srv.base_url))
        .json(&json!({ "brand": " " }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "rotation_empty");
}

#[tokio::test]
async fn scrape_trigger_without_brand_uses_the_rotation() {
    let scraper_url = spawn_scraper_stub(Uuid::now_v7()).await;
    let srv = TestServer::spawn_with_scraper(scraper_url).await;
    let client = reqwest::Client::new();

    for (brand, term) in [("Tudor", Some("Tudor Black Bay")), ("Seiko", None)] {
        let res = client
            .post(format!("{}/admin/rotation", srv.base_url))
            .json(&json!({ "brand": brand, "search_term": term }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    let mut picked = Vec::new();
    for _ in 0..3 {
        let res = client
            .post(format!("{}/admin/scrape/trigger", srv.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["source"], "rotation");
        picked.push(body["message"].as_str().unwrap().to_string());
    }
    assert_eq!(
        picked,
        ["scraping Tudor Black Bay", "scraping Seiko", "scraping Tudor Black Bay"]
    );

    let rotation: Value = client
        .get(format!("{}/admin/rotation", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = rotation["entries"].as_array().unwrap();
    assert_eq!(entries[0]["last_searched"], true);
    assert_eq!(entries[1]["last_searched"], false);
}

#[tokio::test]
async fn scrape_status_is_served_under_the_status_path() {
    let job_id = Uuid::now_v7();
    let scraper_url = spawn_scraper_stub(job_id).await;
    let srv = TestServer::spawn_with_scraper(scraper_url).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/admin/scrape/{}/status", srv.base_url, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["job_id"], job_id.to_string());

    let res = client
        .get(format!("{}/admin/scrape/not-a-job/status", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn scrape_trigger_reports_unreachable_scraper() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/admin/scrape/trigger", srv.base_url))
        .json(&json!({ "brand": "Omega", "search": "Speedmaster" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "scraper_error");
}
