use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use wormer::{
    RapierPhysics, Simulation, SimulationEvent, SimulationOptions, SimulationSnapshot,
    SimulationStatus,
};

#[derive(Clone)]
struct AppState {
    simulation: Arc<Mutex<Simulation>>,
}

impl AppState {
    fn simulation(&self) -> MutexGuard<'_, Simulation> {
        self.simulation.lock().expect("simulation mutex poisoned")
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum ControlAction {
    Start,
    Pause,
    Resume,
    Terminate,
}

#[derive(Clone, Copy, Debug, Deserialize)]
struct ControlRequest {
    action: ControlAction,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .compact()
        .init();

    let simulation = match Simulation::spawn(SimulationOptions::default(), Arc::new(RapierPhysics))
    {
        Ok(simulation) => simulation,
        Err(err) => {
            error!("failed to launch simulation: {err}");
            return;
        }
    };
    let state = AppState {
        simulation: Arc::new(Mutex::new(simulation)),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/sim/state", get(state_handler))
        .route("/api/sim/control", post(control_handler))
        .route(
            "/api/sim/snapshot",
            get(snapshot_handler).post(snapshot_load_handler),
        )
        .route("/api/sim/ws", get(ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8788));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            return;
        }
    };
    info!("wormer listening on http://{addr}");
    if let Err(err) = axum::serve(listener, app).await {
        error!("server exited unexpectedly: {err}");
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn state_handler(State(state): State<AppState>) -> Json<SimulationStatus> {
    Json(state.simulation().status())
}

async fn control_handler(
    State(state): State<AppState>,
    Json(request): Json<ControlRequest>,
) -> Json<SimulationStatus> {
    let simulation = state.simulation();
    match request.action {
        ControlAction::Start => simulation.start(),
        ControlAction::Pause => simulation.pause(),
        ControlAction::Resume => simulation.resume(),
        ControlAction::Terminate => simulation.terminate(),
    }
    Json(simulation.status())
}

async fn snapshot_handler(State(state): State<AppState>) -> Json<SimulationSnapshot> {
    Json(state.simulation().snapshot())
}

/// Replaces the running simulation with a restored one. Validation failures
/// surface to the caller instead of silently substituting defaults.
async fn snapshot_load_handler(
    State(state): State<AppState>,
    Json(snapshot): Json<SimulationSnapshot>,
) -> Result<Json<SimulationStatus>, (StatusCode, String)> {
    let restored = Simulation::from_snapshot(snapshot, Arc::new(RapierPhysics))
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    let mut simulation = state.simulation();
    simulation.terminate();
    *simulation = restored;
    info!("simulation restored from snapshot");
    Ok(Json(simulation.status()))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_event_socket(socket, state))
}

async fn handle_event_socket(mut socket: WebSocket, state: AppState) {
    let mut events = state.simulation().subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, event).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event websocket lagged by {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            message = socket.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: SimulationEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(&event) {
        Ok(text) => text,
        Err(err) => {
            error!("failed to serialize event: {err}");
            return Err(());
        }
    };
    socket
        .send(Message::Text(text.into()))
        .await
        .map_err(|err| {
            error!("failed to send event: {err}");
        })
}
