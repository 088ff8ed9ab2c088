use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use searchop::searchop::cluster::client::{HttpError, SearchAdminClient};
use searchop::searchop::cluster::types::HealthStatus;
use searchop::searchop::cluster::ClusterAdminApi;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const TOKEN: &str = "s3cret";

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some("Bearer s3cret")
}

async fn health(headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing credentials", "status": 401 })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "cluster_name": "logs",
            "status": "yellow",
            "timed_out": false,
            "number_of_nodes": 5,
            "number_of_data_nodes": 3,
            "active_primary_shards": 10,
            "active_shards": 18,
            "relocating_shards": 0,
            "initializing_shards": 1,
            "unassigned_shards": 1
        })),
    )
}

async fn nodes(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    if params.get("format").map(String::as_str) != Some("json")
        || params.get("h").map(String::as_str) != Some("name,node.role,ip")
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": { "type": "illegal_argument_exception", "reason": "bad columns" },
                "status": 400
            })),
        );
    }
    (
        StatusCode::OK,
        Json(json!([
            { "name": "es-master-0", "node.role": "m", "ip": "10.0.0.1" },
            { "name": "es-ingest", "node.role": "i", "ip": "10.0.0.7" }
        ])),
    )
}

fn client(endpoint: &str, token: Option<&str>) -> SearchAdminClient {
    SearchAdminClient::new(
        endpoint,
        token.map(str::to_string),
        Duration::from_secs(5),
    )
    .expect("client")
}

#[tokio::test]
async fn health_is_read_with_the_bearer_token() {
    let endpoint = serve(Router::new().route("/_cluster/health", get(health))).await;
    let admin = client(&endpoint, Some(TOKEN));

    let health = admin.cluster_health().await.expect("health");

    assert_eq!(health.cluster_name, "logs");
    assert_eq!(health.status, HealthStatus::Yellow);
    assert_eq!(health.unassigned_shards, 1);
    assert_eq!(admin.cluster_node_count().await.expect("count"), 5);
}

#[tokio::test]
async fn missing_token_surfaces_the_error_message() {
    let endpoint = serve(Router::new().route("/_cluster/health", get(health))).await;
    let admin = client(&endpoint, Some("   "));

    let err = admin.cluster_node_count().await.expect_err("unauthorized");
    let http = err.downcast_ref::<HttpError>().expect("http error");

    assert_eq!(http.status.as_u16(), 401);
    assert_eq!(http.message, "missing credentials");
}

#[tokio::test]
async fn node_membership_is_matched_by_exact_name() {
    let endpoint = serve(Router::new().route("/_cat/nodes", get(nodes))).await;
    let admin = client(&endpoint, None);

    assert!(admin.is_node_in_cluster("es-ingest").await.expect("membership"));
    assert!(!admin.is_node_in_cluster("es-ingest-1").await.expect("membership"));
    let listed = admin.nodes().await.expect("nodes");
    assert_eq!(listed[0].node_role.as_deref(), Some("m"));
}

#[tokio::test]
async fn structured_errors_keep_type_and_reason() {
    let router = Router::new().route(
        "/_cluster/health",
        get(|| async {
            (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": { "type": "resource_not_found_exception", "reason": "no such endpoint" },
                    "status": 404
                })),
            )
        }),
    );
    let endpoint = serve(router).await;
    let admin = client(&endpoint, None);

    let err = admin.health().await.expect_err("not found");
    let http = err.downcast_ref::<HttpError>().expect("http error");

    assert_eq!(http.status.as_u16(), 404);
    assert_eq!(
        http.message,
        "resource_not_found_exception: no such endpoint"
    );
}

async fn flaky_health(State(calls): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "busy" })));
    }
    (
        StatusCode::OK,
        Json(json!({ "cluster_name": "logs", "status": "green", "number_of_nodes": 3 })),
    )
}

#[tokio::test]
async fn unavailable_responses_are_retried_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/_cluster/health", get(flaky_health))
        .with_state(calls.clone());
    let endpoint = serve(router).await;
    let admin = client(&endpoint, None);

    let health = admin.health().await.expect("second attempt succeeds");

    assert_eq!(health.status, HealthStatus::Green);
    assert_eq!(health.number_of_data_nodes, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn endpoint_paths_are_preserved() {
    let router = Router::new().route("/search/_cluster/health", get(health));
    let endpoint = serve(router).await;
    let admin = client(&format!("{endpoint}/search/"), Some(TOKEN));

    assert_eq!(admin.cluster_node_count().await.expect("count"), 5);
}
