//! Admin / metadata HTTP surface: satellite registration and server
//! metadata. Runs alongside the WebSocket listener on its own bind
//! address, sharing the same `Arc`-held Event Store / Satellite Registry
//! handles. Grounded on the pack's axum-fronted gateway crate
//! (`hdds-gateway`), which runs a small admin REST API beside its main
//! service the same way.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::config::Config;
use crate::satellite::SatelliteRegistry;
use crate::storage::Storage;

pub struct AdminState {
    pub config: Config,
    pub storage: Arc<Storage>,
    pub satellites: Arc<SatelliteRegistry>,
    pub identity_pubkey: String,
}

#[derive(Debug, Deserialize)]
struct RegisterSatelliteRequest {
    url: String,
    pubkey: String,
    supported_kinds: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct RegisterSatelliteResponse {
    registered: bool,
}

async fn register_satellite(
    State(state): State<Arc<AdminState>>,
    body: Result<Json<RegisterSatelliteRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(json) => json,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("malformed body: {rejection}") })),
            )
                .into_response()
        }
    };

    if req.url.is_empty() || req.pubkey.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "url and pubkey are required" })),
        )
            .into_response();
    }

    let now = crate::now_unix();
    match state.satellites.register(
        &state.storage,
        req.pubkey.clone(),
        req.url.clone(),
        req.supported_kinds.clone(),
        now,
    ) {
        Ok(()) => {
            info!(pubkey = %req.pubkey, url = %req.url, "registered satellite");
            (
                StatusCode::OK,
                Json(RegisterSatelliteResponse { registered: true }),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
struct Metadata {
    name: &'static str,
    description: &'static str,
    pubkey: String,
    contact: String,
    supported_kinds: Vec<u32>,
    default_query_limit: usize,
    max_query_limit: usize,
}

async fn metadata(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut supported_kinds: Vec<u32> = fitrelay_core::event::ALLOWED_KINDS.to_vec();
    supported_kinds.extend(fitrelay_core::event::ALLOWED_KIND_RANGE);

    Json(Metadata {
        name: "fitrelayd",
        description: "Publish-subscribe relay for signed health and fitness events",
        pubkey: state.identity_pubkey.clone(),
        contact: state.config.server_contact.clone(),
        supported_kinds,
        default_query_limit: state.config.default_query_limit,
        max_query_limit: state.config.max_query_limit,
    })
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/", get(metadata))
        .route("/register-satellite", post(register_satellite))
        .with_state(state)
}

pub async fn serve(state: Arc<AdminState>, listen: SocketAddr) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "admin HTTP surface listening");
    axum::serve(listener, app).await
}
