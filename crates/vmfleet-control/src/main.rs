//! vmfleetd - VM fleet orchestrator daemon
//!
//! Opens the identity database, restores the fleet to its cold state, keeps
//! reconciling it in the background and serves the phone-home ingress that
//! provisioning and start-up depend on.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmfleet_control::{ControlConfig, ControlError, Orchestrator, OrchestratorService, PhoneCall};
use vmfleet_core::SecretUuid;
use vmfleet_hypervisor::{Hypervisor, HypervisorConfig, VirshHypervisor};
use vmfleet_store::{RocksStore, Store};

/// Application state shared across handlers.
struct AppState<H, S> {
    service: Arc<OrchestratorService<H, S>>,
}

impl<H, S> Clone for AppState<H, S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

/// Body posted by a guest's first-boot tooling.
#[derive(Deserialize)]
struct PhoneRequest {
    secret_uuid: SecretUuid,
    #[serde(default)]
    cloud_init: bool,
}

struct ApiError(ControlError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.http_status_code();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: self.0.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "vmfleetd",
    })
}

/// Ready once the network has been read and leases synchronized.
async fn ready_handler<H: Hypervisor + 'static, S: Store + 'static>(
    State(state): State<AppState<H, S>>,
) -> impl IntoResponse {
    if state.service.leases().cached_network().is_some() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn phone_handler<H: Hypervisor + 'static, S: Store + 'static>(
    State(state): State<AppState<H, S>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(request): Json<PhoneRequest>,
) -> Result<StatusCode, ApiError> {
    let call = PhoneCall {
        secret_uuid: request.secret_uuid,
        remote_ip: remote.ip(),
        cloud_init: request.cloud_init,
    };
    state.service.receive_call(call).await.map_err(ApiError)?;
    Ok(StatusCode::NO_CONTENT)
}

fn create_router<H: Hypervisor + 'static, S: Store + 'static>(state: AppState<H, S>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler::<H, S>))
        .route("/phone", post(phone_handler::<H, S>))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vmfleet=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting vmfleetd");

    // Load configuration from environment
    let config = ControlConfig::from_env();
    let hypervisor_config = HypervisorConfig::from_env();
    let listen_addr = config.listen_addr.clone();

    // Initialize store
    let store = Arc::new(RocksStore::open(&config.data_dir)?);
    tracing::info!(data_dir = %config.data_dir.display(), "Initialized RocksDB store");

    let hypervisor = Arc::new(VirshHypervisor::new(hypervisor_config));
    let service = Arc::new(OrchestratorService::new(hypervisor, store, config));

    // Bind before restoring: VMs started by the restore phone home here.
    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;

    let background = Arc::clone(&service);
    tokio::spawn(async move {
        match background.startup().await {
            Ok(report) => tracing::info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                "Restored cold state"
            ),
            Err(e) => tracing::warn!(error = %e, "Startup reconciliation failed"),
        }
        Arc::new(background.reconciler()).run().await;
    });

    let app = create_router(AppState { service });
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
