use super::*;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use shared::{
    domain::GroupId,
    protocol::GroupSummary,
};
use tokio::net::TcpListener;

#[derive(Clone)]
struct DirectoryServerState {
    peers: Arc<Mutex<Vec<PeerSummary>>>,
    roster: Arc<Mutex<Vec<PeerSummary>>>,
    groups: Arc<Mutex<Vec<GroupSummary>>>,
    fail_groups: Arc<Mutex<bool>>,
}

fn peer(internal: i64, name: &str, last: Option<&str>) -> PeerSummary {
    PeerSummary {
        external_id: format!("idp|{internal}"),
        internal_id: UserId(internal),
        display_name: name.to_string(),
        last_message_time: last.map(|t| t.parse().expect("timestamp")),
    }
}

fn group(id: i64, name: &str, last: Option<&str>) -> GroupSummary {
    GroupSummary {
        group_id: GroupId(id),
        name: name.to_string(),
        last_message_time: last.map(|t| t.parse().expect("timestamp")),
    }
}

async fn list_peers(State(state): State<DirectoryServerState>) -> Json<Vec<PeerSummary>> {
    Json(state.peers.lock().await.clone())
}

async fn list_roster(State(state): State<DirectoryServerState>) -> Json<Vec<PeerSummary>> {
    Json(state.roster.lock().await.clone())
}

async fn list_groups(
    State(state): State<DirectoryServerState>,
) -> Result<Json<Vec<GroupSummary>>, StatusCode> {
    if *state.fail_groups.lock().await {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(state.groups.lock().await.clone()))
}

async fn spawn_directory_server() -> anyhow::Result<(ApiClient, DirectoryServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = DirectoryServerState {
        peers: Arc::new(Mutex::new(vec![peer(
            5,
            "Priya",
            Some("2024-01-01T10:00:00Z"),
        )])),
        roster: Arc::new(Mutex::new(vec![
            peer(5, "Priya", None),
            peer(9, "Dana", None),
        ])),
        groups: Arc::new(Mutex::new(vec![group(
            4,
            "Growth",
            Some("2024-01-02T09:00:00Z"),
        )])),
        fail_groups: Arc::new(Mutex::new(false)),
    };
    let app = Router::new()
        .route("/users/:id/peers", get(list_peers))
        .route("/users/roster", get(list_roster))
        .route("/users/:id/groups", get(list_groups))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((ApiClient::new(format!("http://{addr}"), "test-token"), state))
}

fn conversations(entries: &[ConversationEntry]) -> Vec<ConversationId> {
    entries.iter().map(|e| e.conversation).collect()
}

#[tokio::test]
async fn refresh_orders_by_recency_and_is_deterministic() {
    let (api, _state) = spawn_directory_server().await.expect("spawn server");
    let directory = ConversationDirectory::new();

    let first = directory.refresh(&api, UserId(99)).await;
    assert_eq!(
        conversations(&first),
        vec![
            ConversationId::Group(GroupId(4)),
            ConversationId::Direct(UserId(5)),
        ]
    );

    let second = directory.refresh(&api, UserId(99)).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn never_contacted_entries_sort_after_timestamped_ones() {
    let (api, state) = spawn_directory_server().await.expect("spawn server");
    state
        .peers
        .lock()
        .await
        .push(peer(6, "Quentin", None));
    let directory = ConversationDirectory::new();

    let entries = directory.refresh(&api, UserId(99)).await;
    assert_eq!(
        conversations(&entries),
        vec![
            ConversationId::Group(GroupId(4)),
            ConversationId::Direct(UserId(5)),
            ConversationId::Direct(UserId(6)),
        ]
    );
    assert!(entries[2].last_activity.is_none());
}

#[tokio::test]
async fn failed_source_degrades_to_empty_contribution() {
    let (api, state) = spawn_directory_server().await.expect("spawn server");
    *state.fail_groups.lock().await = true;
    let directory = ConversationDirectory::new();

    let entries = directory.refresh(&api, UserId(99)).await;
    assert_eq!(
        conversations(&entries),
        vec![ConversationId::Direct(UserId(5))]
    );
}

#[tokio::test]
async fn search_unions_roster_entries_without_timestamps() {
    let (api, _state) = spawn_directory_server().await.expect("spawn server");
    let directory = ConversationDirectory::new();
    directory.refresh(&api, UserId(99)).await;

    let counts = HashMap::new();
    let hits = directory.search("dan", &counts).await;
    assert_eq!(conversations(&hits), vec![ConversationId::Direct(UserId(9))]);
    assert!(hits[0].last_activity.is_none());

    // A peer already present in the merged list is not duplicated.
    let hits = directory.search("priya", &counts).await;
    assert_eq!(conversations(&hits), vec![ConversationId::Direct(UserId(5))]);
    assert!(hits[0].last_activity.is_some());
}

#[tokio::test]
async fn touch_bumps_ordering_but_never_moves_time_backwards() {
    let (api, _state) = spawn_directory_server().await.expect("spawn server");
    let directory = ConversationDirectory::new();
    directory.refresh(&api, UserId(99)).await;

    let newer = "2024-01-03T08:00:00Z".parse().expect("timestamp");
    directory
        .touch(ConversationId::Direct(UserId(5)), newer)
        .await;

    let counts = HashMap::new();
    let entries = directory.snapshot(&counts).await;
    assert_eq!(entries[0].conversation, ConversationId::Direct(UserId(5)));
    assert_eq!(entries[0].last_activity, Some(newer));

    let older = "2023-12-01T00:00:00Z".parse().expect("timestamp");
    directory
        .touch(ConversationId::Direct(UserId(5)), older)
        .await;
    let entries = directory.snapshot(&counts).await;
    assert_eq!(entries[0].last_activity, Some(newer));
}

#[tokio::test]
async fn touch_creates_entries_for_unseen_conversations() {
    let directory = ConversationDirectory::new();
    let at = "2024-01-05T12:00:00Z".parse().expect("timestamp");
    directory.touch(ConversationId::Group(GroupId(8)), at).await;

    let counts = HashMap::new();
    let entries = directory.snapshot(&counts).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].conversation, ConversationId::Group(GroupId(8)));
    assert_eq!(entries[0].last_activity, Some(at));
}

#[tokio::test]
async fn snapshot_annotates_unread_counts() {
    let (api, _state) = spawn_directory_server().await.expect("spawn server");
    let directory = ConversationDirectory::new();
    directory.refresh(&api, UserId(99)).await;

    let mut counts = HashMap::new();
    counts.insert(ConversationId::Direct(UserId(5)), 2u32);
    let entries = directory.snapshot(&counts).await;

    let priya = entries
        .iter()
        .find(|e| e.conversation == ConversationId::Direct(UserId(5)))
        .expect("entry");
    assert_eq!(priya.unread, 2);
    let growth = entries
        .iter()
        .find(|e| e.conversation == ConversationId::Group(GroupId(4)))
        .expect("entry");
    assert_eq!(growth.unread, 0);
}
