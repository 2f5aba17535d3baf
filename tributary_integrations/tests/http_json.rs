#![cfg(feature = "http_json")]

use futures_util::TryStreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tributary_core::destinations::embedder::HashingEmbedder;
use tributary_core::destinations::memory::{MemoryGraphStore, MemoryVectorStore};
use tributary_core::storage::memory::MemoryStateDb;
use tributary_core::transform::engine::StageRegistry;
use tributary_core::{
    Checkpoint, Connection, ConnectorRegistry, Credentials, Destinations, JobStatus,
    RawRecord, Result, RetryPolicy, SourceConnector, StaticCredentials, SyncConfig,
    SyncOrchestrator, TenantId, TriggerKind,
};
use tributary_integrations::connectors::http_json::{HttpJsonConnector, HttpJsonSettings};
use tributary_integrations::register_builtin_connectors;
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(server: &MockServer) -> serde_json::Value {
    json!({
        "base_url": server.uri(),
        "page_size": 2,
        "resources": [{
            "entity_type": "ticket",
            "path": "/tickets",
            "updated_at_field": "updated_at",
            "fields": [
                { "name": "title", "kind": "string", "required": true },
                { "name": "updated_at", "kind": "timestamp" }
            ]
        }]
    })
}

fn connector(server: &MockServer) -> HttpJsonConnector {
    HttpJsonConnector::new(
        HttpJsonSettings::parse(&settings(server)).unwrap(),
        Credentials::default().with("token", "secret"),
    )
    .unwrap()
}

async fn extract(c: &HttpJsonConnector, since: Option<Checkpoint>) -> Result<Vec<RawRecord>> {
    c.extract(since).await?.try_collect().await
}

fn ticket(id: u64, title: &str, updated_at: &str) -> serde_json::Value {
    json!({ "id": id, "title": title, "updated_at": updated_at })
}

async fn mount_two_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/tickets"))
        .and(query_param("cursor", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [ticket(3, "Three", "2024-05-01T10:00:00Z")],
            "next_cursor": null
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tickets"))
        .and(query_param_is_missing("cursor"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                ticket(1, "One", "2024-05-03T08:00:00Z"),
                ticket(2, "Two", "2024-05-02T09:30:00Z")
            ],
            "next_cursor": "p2"
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn follows_cursors_and_checkpoints_after_the_last_page() {
    let server = MockServer::start().await;
    mount_two_pages(&server).await;

    let records = extract(&connector(&server), None).await.unwrap();
    let ids: Vec<&str> = records.iter().map(|r| r.entity_id.as_str()).collect();
    assert_eq!(ids, ["1", "2", "3"]);
    assert!(records[..2].iter().all(|r| r.checkpoint.is_none()));

    // The newest item was on page one; the mark still only lands at the end.
    let checkpoint = records[2].checkpoint.clone().unwrap();
    assert_eq!(
        checkpoint.value,
        json!({ "ticket": "2024-05-03T08:00:00.000000Z" })
    );
}

#[tokio::test]
async fn empty_closing_page_still_yields_the_checkpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tickets"))
        .and(query_param("cursor", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [],
            "next_cursor": null
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tickets"))
        .and(query_param_is_missing("cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                ticket(1, "One", "2024-05-03T08:00:00Z"),
                ticket(2, "Two", "2024-05-02T09:30:00Z")
            ],
            "next_cursor": "p2"
        })))
        .mount(&server)
        .await;

    let records = extract(&connector(&server), None).await.unwrap();
    let ids: Vec<&str> = records.iter().map(|r| r.entity_id.as_str()).collect();
    assert_eq!(ids, ["1", "2"]);
    assert!(records[0].checkpoint.is_none());
    assert_eq!(
        records[1].checkpoint.as_ref().unwrap().value,
        json!({ "ticket": "2024-05-03T08:00:00.000000Z" })
    );
}

#[tokio::test]
async fn incremental_extract_sends_updated_since() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tickets"))
        .and(query_param("updated_since", "2024-05-03T08:00:00.000000Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [ticket(9, "Nine", "2024-06-01T00:00:00Z")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let since = Checkpoint::new(json!({ "ticket": "2024-05-03T08:00:00.000000Z" }));
    let records = extract(&connector(&server), Some(since)).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].checkpoint.as_ref().unwrap().value,
        json!({ "ticket": "2024-06-01T00:00:00.000000Z" })
    );
}

#[tokio::test]
async fn http_failures_map_onto_the_error_taxonomy() {
    let cases = [
        (ResponseTemplate::new(401), "auth_expired"),
        (
            ResponseTemplate::new(429).insert_header("retry-after", "3"),
            "rate_limited",
        ),
        (ResponseTemplate::new(503), "transient_network"),
        (ResponseTemplate::new(404), "permanent_source"),
        (
            ResponseTemplate::new(200).set_body_json(json!({ "data": [] })),
            "permanent_source",
        ),
    ];
    for (response, kind) in cases {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(response)
            .mount(&server)
            .await;
        let err = extract(&connector(&server), None).await.unwrap_err();
        assert_eq!(err.kind(), kind, "{err}");
        if kind == "rate_limited" {
            assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        }
    }
}

#[tokio::test]
async fn items_without_ids_are_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "title": "no id" },
            ticket(5, "Five", "2024-01-01T00:00:00Z")
        ])))
        .mount(&server)
        .await;
    let records = extract(&connector(&server), None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key().to_string(), "ticket/5");
}

#[tokio::test]
async fn transient_outage_is_retried_by_the_pipeline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_two_pages(&server).await;

    let connectors = Arc::new(ConnectorRegistry::new());
    register_builtin_connectors(&connectors).await.unwrap();
    let state = Arc::new(MemoryStateDb::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let credentials = Arc::new(StaticCredentials::new());
    let orchestrator = SyncOrchestrator::new(
        SyncConfig {
            connector_retry: RetryPolicy::immediate(3),
            ..SyncConfig::default()
        },
        state.clone(),
        state,
        connectors,
        credentials.clone(),
        Destinations {
            vectors: vectors.clone(),
            graph: Arc::new(MemoryGraphStore::new()),
            embedder: Arc::new(HashingEmbedder::new(16).unwrap()),
        },
        StageRegistry::new(),
    )
    .unwrap();

    let tenant = TenantId::new();
    let conn = Connection::new(tenant, "tickets", "http_json", settings(&server)).unwrap();
    let conn = orchestrator.register_connection(conn).await.unwrap();
    credentials
        .insert(tenant, conn.id, Credentials::default().with("token", "secret"))
        .await;

    let job_id = orchestrator
        .submit_job(conn.id, TriggerKind::Manual)
        .await
        .unwrap();
    let job = orchestrator.wait_for_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(job.stats.inserted, 3);
    assert_eq!(
        vectors.ids(tenant, &conn.id.to_string()).await,
        ["ticket/1", "ticket/2", "ticket/3"]
    );
}

