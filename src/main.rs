mod backup;
mod config;
mod game;
mod hub;
mod invite;
mod response;
mod room;
mod storage;
mod word;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use crate::backup::HubBackup;
use crate::game::Player;
use crate::hub::Hub;
use crate::invite::InviteStore;
use crate::storage::{GameStorage, MemoryStorage, StorageError};
use crate::word::{LocalWords, WordSource};

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    storage: Arc<dyn GameStorage>,
    invites: Arc<InviteStore>,
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

/// Username as presented by the caller. Authentication is handled upstream;
/// the server only refuses blank names.
fn username_param(
    params: &HashMap<String, String>,
) -> Result<String, (StatusCode, Json<serde_json::Value>)> {
    match params.get("username").map(|u| u.trim()) {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(bad_request("username is required")),
    }
}

// ─── Routes ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    username: String,
}

async fn create_room(
    State(state): State<AppState>,
    Json(body): Json<CreateRoomRequest>,
) -> impl IntoResponse {
    let username = body.username.trim();
    if username.is_empty() {
        return bad_request("username is required").into_response();
    }
    let room = state.hub.create_room(username);
    Json(json!({ "id": room.id() })).into_response()
}

async fn join_room(
    State(state): State<AppState>,
    Path(game_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let username = match username_param(&params) {
        Ok(username) => username,
        Err(err) => return err.into_response(),
    };
    let Some(room) = state.hub.get(game_id) else {
        return not_found("game not found").into_response();
    };
    if let Err(err) = room.can_join(&username).await {
        return bad_request(&err.to_string()).into_response();
    }
    let token = state.invites.issue(Player::new(&username), game_id);
    Json(json!({ "token": token })).into_response()
}

async fn live(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some((player, game_id)) = params
        .get("token")
        .and_then(|token| state.invites.redeem(token))
    else {
        return bad_request("invalid token").into_response();
    };

    let Some(room) = state.hub.get_or_restore(game_id, &player.username).await else {
        return not_found("game not found").into_response();
    };
    if let Err(err) = room.can_join(&player.username).await {
        return bad_request(&err.to_string()).into_response();
    }

    ws.on_upgrade(move |socket| async move {
        room.join(player, socket).await;
    })
    .into_response()
}

async fn list_games(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let username = match username_param(&params) {
        Ok(username) => username,
        Err(err) => return err.into_response(),
    };
    let limit = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);
    let offset = params
        .get("offset")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    match state.storage.list_games(&username, limit, offset).await {
        Ok(games) => {
            let rows: Vec<_> = games
                .iter()
                .map(|g| response::to_response(g, &username))
                .collect();
            Json(rows).into_response()
        }
        Err(err) => {
            tracing::error!("failed to list games: {}", err);
            bad_request("failed to list games").into_response()
        }
    }
}

async fn fetch_game(
    State(state): State<AppState>,
    Path(game_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let username = match username_param(&params) {
        Ok(username) => username,
        Err(err) => return err.into_response(),
    };
    match state.storage.fetch_game(&username, game_id).await {
        Ok(mut game) => {
            game.resync();
            Json(response::to_response(&game, &username)).into_response()
        }
        Err(StorageError::NotFound) => not_found("game not found").into_response(),
        Err(err) => {
            tracing::error!("failed to fetch game {}: {}", game_id, err);
            bad_request("failed to fetch game").into_response()
        }
    }
}

// ─── Main ─────────────────────────────────────────────────────────

async fn shutdown_signal(cancel: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
    let _ = cancel.send(true);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let words: Arc<dyn WordSource> = Arc::new(LocalWords::new());
    let storage: Arc<dyn GameStorage> = Arc::new(MemoryStorage::new());
    let hub = Hub::new(storage.clone(), words);
    let invites = InviteStore::new(&config::salt());

    let hub_backup = HubBackup::new(config::backup_path());
    match hub_backup.load_and_clear() {
        Ok(games) => {
            for game in games {
                hub.adopt(game);
            }
        }
        Err(err) => tracing::error!("failed to load hub snapshot: {}", err),
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(hub.clone().run_gc(cancel_rx.clone()));
    tokio::spawn(invites.clone().run_cleanup(cancel_rx));

    let state = AppState {
        hub: hub.clone(),
        storage,
        invites,
    };

    let app = Router::new()
        .route("/room", post(create_room))
        .route("/join/room/{game_id}", get(join_room))
        .route("/live", get(live))
        .route("/games", get(list_games))
        .route("/games/{game_id}", get(fetch_game))
        .with_state(state);

    let port = config::port();
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind");

    tracing::info!("wordrace server running on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_tx))
        .await
        .unwrap();

    // open games survive a restart through the snapshot file
    let games = hub.games().await;
    if let Err(err) = hub_backup.dump(&games) {
        tracing::error!("failed to write hub snapshot: {}", err);
    }
}
