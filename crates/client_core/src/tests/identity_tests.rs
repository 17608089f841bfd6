use super::*;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use shared::protocol::PeerSummary;
use tokio::net::TcpListener;

#[derive(Clone)]
struct LookupServerState {
    hits: Arc<Mutex<u32>>,
    known: Arc<Mutex<HashMap<String, i64>>>,
}

#[derive(Deserialize)]
struct LookupQuery {
    external_id: String,
}

async fn lookup(
    State(state): State<LookupServerState>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<PeerSummary>, StatusCode> {
    *state.hits.lock().await += 1;
    // Keep the request in flight long enough for callers to overlap.
    tokio::time::sleep(Duration::from_millis(100)).await;
    match state.known.lock().await.get(&query.external_id) {
        Some(internal) => Ok(Json(PeerSummary {
            external_id: query.external_id.clone(),
            internal_id: UserId(*internal),
            display_name: "resolved".to_string(),
            last_message_time: None,
        })),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn spawn_lookup_server() -> anyhow::Result<(IdentityResolver, LookupServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = LookupServerState {
        hits: Arc::new(Mutex::new(0)),
        known: Arc::new(Mutex::new(HashMap::from([("idp|alice".to_string(), 7)]))),
    };
    let app = Router::new()
        .route("/users/lookup", get(lookup))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let api = Arc::new(ApiClient::new(format!("http://{addr}"), "test-token"));
    Ok((IdentityResolver::new(api), state))
}

#[tokio::test]
async fn resolve_memoizes_for_the_process_lifetime() {
    let (resolver, state) = spawn_lookup_server().await.expect("spawn server");

    assert_eq!(resolver.resolve("idp|alice").await.expect("resolve"), UserId(7));
    assert_eq!(resolver.resolve("idp|alice").await.expect("resolve"), UserId(7));

    assert_eq!(*state.hits.lock().await, 1);
}

#[tokio::test]
async fn concurrent_resolves_for_one_key_share_a_single_lookup() {
    let (resolver, state) = spawn_lookup_server().await.expect("spawn server");

    let (first, second) = tokio::join!(
        resolver.resolve("idp|alice"),
        resolver.resolve("idp|alice"),
    );

    assert_eq!(first.expect("first"), UserId(7));
    assert_eq!(second.expect("second"), UserId(7));
    assert_eq!(*state.hits.lock().await, 1);
}

#[tokio::test]
async fn unknown_external_id_fails_with_identity_not_found() {
    let (resolver, _state) = spawn_lookup_server().await.expect("spawn server");

    let err = resolver
        .resolve("idp|nobody")
        .await
        .expect_err("must fail");
    match err.downcast_ref::<ClientError>() {
        Some(ClientError::IdentityNotFound(external)) => assert_eq!(external, "idp|nobody"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn failed_resolution_is_not_cached() {
    let (resolver, state) = spawn_lookup_server().await.expect("spawn server");

    resolver
        .resolve("idp|bob")
        .await
        .expect_err("unknown at first");
    state.known.lock().await.insert("idp|bob".to_string(), 11);

    assert_eq!(resolver.resolve("idp|bob").await.expect("resolve"), UserId(11));
    assert_eq!(*state.hits.lock().await, 2);
}
