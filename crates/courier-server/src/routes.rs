use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use courier_gateway::Gateway;
use courier_gateway::auth::bearer_token;
use courier_gateway::connection;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
}

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { gateway })
}

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    pub token: Option<String>,
}

/// Authenticate at the HTTP layer; only a verified caller gets a socket.
async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_owned)
        .or(query.token);

    let Some(credential) = credential else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let identity = match state.gateway.authenticate(&credential) {
        Ok(identity) => identity,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.gateway, identity))
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    online_users: usize,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        online_users: state.gateway.online_users().len(),
    })
}
