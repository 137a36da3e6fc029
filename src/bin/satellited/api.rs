//! Admin HTTP API.
//!
//! Thin REST surface over a running satellite: inspect peers, push
//! unicast and broadcast packets, and drive the rating demo.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use satellite::Satellite;

use crate::ratings::{Rating, RatingRequest};

#[derive(Clone)]
pub struct AppState {
    sat: Arc<Satellite>,
}

pub fn router(sat: Arc<Satellite>) -> Router {
    Router::new()
        .route("/peers", get(peers))
        .route("/write", post(write))
        .route("/broadcast", post(broadcast))
        .route("/broadcast_rating", post(broadcast_rating))
        .route("/ratings/:peer/:ident", get(ratings))
        .with_state(AppState { sat })
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    destination: String,
    namespace: String,
    content: serde_json::Value,
}

async fn peers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sat.peer_ids().await)
}

async fn write(
    State(state): State<AppState>,
    Json(request): Json<WriteRequest>,
) -> impl IntoResponse {
    let error = match state.sat.peer(&request.destination).await {
        Some(peer) => match state
            .sat
            .message(&peer, &request.namespace, request.content)
            .await
        {
            Ok(()) => String::new(),
            Err(e) => format!("failed to write: {}", e),
        },
        None => format!("peer does not exist: {}", request.destination),
    };

    Json(json!({ "error": error }))
}

async fn broadcast(
    State(state): State<AppState>,
    Json(request): Json<WriteRequest>,
) -> impl IntoResponse {
    let error = match state
        .sat
        .broadcast(&request.namespace, request.content)
        .await
    {
        Ok(failures) if failures.is_empty() => String::new(),
        Ok(failures) => format!("failed to reach {} peers", failures.len()),
        Err(e) => format!("failed to broadcast: {}", e),
    };

    Json(json!({ "error": error }))
}

async fn broadcast_rating(
    State(state): State<AppState>,
    Json(rating): Json<Rating>,
) -> impl IntoResponse {
    let error = match state.sat.broadcast("new_rating", rating).await {
        Ok(failures) if failures.is_empty() => String::new(),
        Ok(failures) => format!("failed to reach {} peers", failures.len()),
        Err(e) => format!("failed to broadcast: {}", e),
    };

    Json(json!({ "error": error }))
}

async fn ratings(
    State(state): State<AppState>,
    Path((peer_id, ident)): Path<(String, String)>,
) -> impl IntoResponse {
    let Some(peer) = state.sat.peer(&peer_id).await else {
        return Json(json!({
            "ratings": [],
            "error": format!("peer does not exist: {}", peer_id),
        }));
    };

    let mut stream = match state
        .sat
        .request(&peer, "get_rating", RatingRequest { identity: ident })
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            return Json(json!({
                "ratings": [],
                "error": format!("failed to request: {}", e),
            }));
        }
    };

    debug!("waiting for rating stream");
    let mut collected: Vec<Rating> = Vec::new();
    while let Some(inbound) = stream.recv().await {
        match inbound.payload::<Rating>() {
            Ok(rating) => collected.push(rating),
            Err(e) => debug!(error = %e, "skipping undecodable rating reply"),
        }
    }
    let code = stream.done().await;
    debug!(?code, count = collected.len(), "rating stream complete");

    Json(json!({ "ratings": collected, "error": "" }))
}
