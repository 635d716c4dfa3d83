use crate::core::DaemonEvent;
use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use vakit_proto::protocol::{City, Command, PanelStatus, Station};
use vakit_proto::state::StateManager;

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

fn router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST]);

    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/stations", get(get_stations))
        .route("/api/cities", get(get_cities))
        .route("/api/radio/toggle/:id", post(toggle_radio))
        .route("/api/radio/stop", post(stop_radio))
        .route("/api/city/:name", post(select_city))
        .route("/api/refresh", post(refresh))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(HttpState {
            state_manager,
            event_tx,
        });

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_status(State(state): State<HttpState>) -> Json<PanelStatus> {
    Json(state.state_manager.get_status().await)
}

async fn get_stations(State(state): State<HttpState>) -> Json<Vec<Station>> {
    Json(state.state_manager.stations().to_vec())
}

async fn get_cities(State(state): State<HttpState>) -> Json<Vec<City>> {
    Json(state.state_manager.cities().to_vec())
}

async fn send(state: &HttpState, cmd: Command) -> StatusCode {
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("HTTP API: daemon core is gone");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

async fn toggle_radio(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    info!("HTTP API: toggle radio {}", id);
    if state.state_manager.station(&id).is_none() {
        return StatusCode::NOT_FOUND;
    }
    send(&state, Command::ToggleRadio { station_id: id }).await
}

async fn stop_radio(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: stop radio");
    send(&state, Command::StopRadio).await
}

async fn select_city(State(state): State<HttpState>, Path(name): Path<String>) -> StatusCode {
    info!("HTTP API: select city {}", name);
    if state.state_manager.city(&name).is_none() {
        return StatusCode::NOT_FOUND;
    }
    send(&state, Command::SelectCity { name }).await
}

async fn refresh(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: refresh schedule");
    send(&state, Command::RefreshSchedule).await
}
