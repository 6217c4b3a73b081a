use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use connectteam_game::auth::{self, AdmissionParams};
use connectteam_game::config::{self, BackendConfig, Config};
use connectteam_game::connection::{self, ConnectionConfig};
use connectteam_game::hub::Hub;
use connectteam_game::repository::{HttpBackend, HttpMeetingRepository, MemoryBackend, Services};
use connectteam_game::tokens::TokenVerifier;
use connectteam_game::types::User;

#[derive(Clone)]
struct AppState {
    hub: Hub,
    services: Services,
    connection: ConnectionConfig,
}

// ─── Routes ───────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<AdmissionParams>,
) -> Response {
    // Identity is resolved before the upgrade; a refused socket never opens.
    let user = match auth::admit(&params, state.services.users.as_ref()).await {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!("connection refused: {}", e);
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    ws.max_message_size(state.connection.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, user, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, user: User, state: AppState) {
    let (sink, stream) = socket.split();
    connection::serve(sink, stream, user, state.hub, state.connection).await;
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.hub.connection_count().await,
    }))
}

// ─── Main ─────────────────────────────────────────────────────────

fn build_services(config: &Config) -> anyhow::Result<Services> {
    let tokens = TokenVerifier::new(&config.jwt_signing_key);
    let services = match &config.backend {
        BackendConfig::Http { base_url, api_key } => {
            tracing::info!("using backend of record at {}", base_url);
            Services::http(Arc::new(HttpBackend::new(base_url, api_key, tokens)))
        }
        BackendConfig::Memory { seed_path } => {
            config::init(&config.config_path)?;
            let seed = config::load_seed(seed_path)?;
            tracing::info!(
                "using in-memory backend with {} games and {} topics from {}",
                seed.games.len(),
                seed.topics.len(),
                seed_path.display()
            );
            Services::memory(Arc::new(MemoryBackend::from_seed(seed, tokens)))
        }
    };

    Ok(match config.meeting.clone() {
        Some(meeting) => services.with_meetings(Arc::new(HttpMeetingRepository::new(meeting))),
        None => {
            tracing::info!("meeting provider not configured");
            services
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let services = build_services(&config)?;
    let hub = Hub::spawn(services.clone(), config.session.clone());

    let state = AppState {
        hub,
        services,
        connection: config.connection.clone(),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("game server running on port {}", config.port);

    axum::serve(listener, app).await?;
    Ok(())
}
