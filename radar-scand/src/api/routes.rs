use std::convert::Infallible;
use std::sync::Arc;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use shared::protocol::API_PREFIX;
use shared::types::{DiscoveredService, HostSummary, PublicNetworkInfo, ScanEvent, ScanSnapshot};
use crate::coordinator::ScanCoordinator;
use crate::error::ScanError;
use crate::public_network::PublicNetworkSource;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: ScanCoordinator,
    pub public_network: Arc<dyn PublicNetworkSource>,
}

#[derive(Serialize)]
pub struct ScanAccepted {
    pub scan_id: u64,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<u64>,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scan", get(get_scan).post(run_scan))
        .route("/scan/stop", post(stop_scan))
        .route("/events", get(events))
        .route("/services", get(get_services))
        .route("/services/hash", get(get_hash))
        .route("/hosts", get(get_hosts))
        .route("/public-network", get(get_public_network));

    Router::new().nest(API_PREFIX, api).with_state(state)
}

async fn run_scan(State(state): State<AppState>) -> Response {
    match state.coordinator.start() {
        Ok(scan_id) => (StatusCode::ACCEPTED, Json(ScanAccepted { scan_id })).into_response(),
        Err(e @ ScanError::AlreadyRunning { scan_id }) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse { error: e.to_string(), scan_id: Some(scan_id) }),
        )
            .into_response(),
        Err(e @ ScanError::ShuttingDown) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse { error: e.to_string(), scan_id: None }),
        )
            .into_response(),
    }
}

async fn stop_scan(State(state): State<AppState>) -> StatusCode {
    state.coordinator.stop();
    StatusCode::ACCEPTED
}

async fn get_scan(State(state): State<AppState>) -> Result<Json<ScanSnapshot>, StatusCode> {
    state.coordinator.snapshot().map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Json<Vec<DiscoveredService>> {
    let mut services = state.coordinator.services();
    if let Some(service_type) = params.service_type {
        services.retain(|s| s.service_type == service_type);
    }
    Json(services)
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.coordinator.services_digest()
}

async fn get_hosts(State(state): State<AppState>) -> Json<Vec<HostSummary>> {
    Json(state.coordinator.hosts())
}

async fn get_public_network(
    State(state): State<AppState>,
) -> Result<Json<PublicNetworkInfo>, (StatusCode, Json<ErrorResponse>)> {
    state.public_network.lookup().await.map(Json).map_err(|e| {
        tracing::error!("Public network lookup failed: {}", e);
        (
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse {
                error: format!("Failed to get public network info: {}", e),
                scan_id: None,
            }),
        )
    })
}

async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.coordinator.subscribe();
    Sse::new(event_stream(rx, state.coordinator)).keep_alive(KeepAlive::default())
}

/// One SSE frame per scan event; the SSE event field carries the wire name.
/// The stream ends when the coordinator shuts down so graceful shutdown
/// does not wait on idle subscribers.
fn event_stream(
    rx: broadcast::Receiver<ScanEvent>,
    coordinator: ScanCoordinator,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, coordinator), |(mut rx, coordinator)| async move {
        loop {
            let received = tokio::select! {
                biased;
                received = rx.recv() => received,
                _ = coordinator.closed() => return None,
            };

            match received {
                Ok(event) => match Event::default().event(event.name()).json_data(&event) {
                    Ok(frame) => return Some((Ok(frame), (rx, coordinator))),
                    Err(e) => tracing::warn!("Failed to encode {} event: {}", event.name(), e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
