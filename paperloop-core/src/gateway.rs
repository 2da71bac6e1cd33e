//! REST gateway over the research runtime.
//!
//! Routes:
//! - `POST /agents` start an instance
//! - `GET /agents` list instances
//! - `GET /agents/{id}` instance status
//! - `GET /agents/{id}/wait?timeout=SECS` block until finished
//! - `DELETE /agents/{id}` request termination
//! - `GET /health`

use crate::config::GatewayConfig;
use crate::error::WorkflowError;
use crate::runtime::{ResearchRuntime, StatusReport, Termination};
use crate::types::FinalResult;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub type SharedRuntime = Arc<ResearchRuntime>;

/// Default `wait` timeout when the query string omits one.
const DEFAULT_WAIT_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub topic: String,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub instance_id: Uuid,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    pub timeout: Option<u64>,
}

/// JSON error body with the status code it maps to.
#[derive(Debug)]
pub struct ApiError(WorkflowError);

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WorkflowError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            WorkflowError::InstanceNotFound { .. } => StatusCode::NOT_FOUND,
            WorkflowError::WaitTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            WorkflowError::Terminated { .. } | WorkflowError::AlreadyFinished { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Build the gateway router.
pub fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .route("/agents", get(list_handler).post(start_handler))
        .route("/agents/{id}", get(status_handler).delete(terminate_handler))
        .route("/agents/{id}/wait", get(wait_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(runtime)
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        ApiError(WorkflowError::InvalidArgument {
            message: format!("invalid instance id '{}'", raw),
        })
    })
}

async fn start_handler(
    State(rt): State<SharedRuntime>,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let instance_id = rt.start(&req.topic, req.max_iterations)?;
    Ok((
        StatusCode::CREATED,
        Json(StartResponse {
            instance_id,
            status: "started".to_string(),
        }),
    ))
}

async fn list_handler(State(rt): State<SharedRuntime>) -> Result<Json<Vec<StatusReport>>, ApiError> {
    Ok(Json(rt.list()?))
}

async fn status_handler(
    State(rt): State<SharedRuntime>,
    Path(id): Path<String>,
) -> Result<Json<StatusReport>, ApiError> {
    Ok(Json(rt.get_status(parse_id(&id)?)?))
}

async fn wait_handler(
    State(rt): State<SharedRuntime>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<FinalResult>, ApiError> {
    let id = parse_id(&id)?;
    let timeout = Duration::from_secs(query.timeout.unwrap_or(DEFAULT_WAIT_SECS));
    Ok(Json(rt.wait(id, timeout).await?))
}

async fn terminate_handler(
    State(rt): State<SharedRuntime>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    let status = match rt.terminate(id)? {
        Termination::Requested => "termination_requested",
        Termination::Recorded => "terminated",
    };
    Ok(Json(serde_json::json!({
        "instance_id": id,
        "status": status,
    })))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Serve the gateway until the process is stopped.
pub async fn serve(runtime: SharedRuntime, config: &GatewayConfig) -> Result<(), std::io::Error> {
    let app = router(runtime);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let id = Uuid::new_v4();
        let cases = [
            (
                WorkflowError::InvalidArgument {
                    message: "x".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (WorkflowError::InstanceNotFound { id }, StatusCode::NOT_FOUND),
            (
                WorkflowError::WaitTimeout {
                    id,
                    timeout_secs: 1,
                },
                StatusCode::REQUEST_TIMEOUT,
            ),
            (
                WorkflowError::Failed {
                    id,
                    message: "boom".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).into_response().status(), expected);
        }
    }

    #[test]
    fn test_parse_id_rejects_garbage() {
        assert!(parse_id("not-a-uuid").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
    }
}
