use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::media::MediaRef;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub storage: ComponentHealth,
    pub queue: QueueHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub backend: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub status: String,
    pub depth: usize,
    pub capacity: usize,
    pub workers: usize,
    pub active_jobs: usize,
}

/// GET /health — media store reachability and queue pressure.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let sentinel = MediaRef::new("healthcheck/sentinel");
    let storage_check = match state.storage.exists(&sentinel).await {
        Ok(_) => ComponentHealth {
            status: "ok".to_string(),
            backend: state.storage.name().to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Storage health check failed");
            ComponentHealth {
                status: "error".to_string(),
                backend: state.storage.name().to_string(),
                latency_ms: None,
            }
        }
    };

    let depth = state.jobs.queue_depth();
    let capacity = state.jobs.queue_capacity();
    let queue_check = QueueHealth {
        status: if depth >= capacity { "full" } else { "ok" }.to_string(),
        depth,
        capacity,
        workers: state.jobs.worker_count(),
        active_jobs: state.jobs.active_jobs(),
    };

    let all_healthy = storage_check.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy && queue_check.status == "ok" {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            storage: storage_check,
            queue: queue_check,
        },
    };

    (status_code, Json(response))
}
