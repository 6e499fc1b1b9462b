//! Read-only HTTP surface plus the HITL decision endpoint.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::dsl::schema::Role;
use crate::exec::Orchestrator;

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/runs/:public_id", get(run_by_public_id))
        .route("/runs/:run_id/policy-checks", get(policy_checks))
        .route("/runs/:run_id/deviations", get(deviations))
        .route("/hitl/:run_id", post(hitl_decision))
        .with_state(orchestrator)
}

/// Serve the router until the process exits.
pub async fn serve(orchestrator: Arc<Orchestrator>, addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http surface listening");
    axum::serve(listener, router(orchestrator))
        .await
        .map_err(std::io::Error::other)
}

async fn metrics(State(orchestrator): State<Arc<Orchestrator>>) -> Json<Value> {
    let snapshot = orchestrator.services().metrics.snapshot();
    Json(serde_json::to_value(snapshot).unwrap_or(Value::Null))
}

async fn run_by_public_id(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(public_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let run = orchestrator
        .services()
        .store
        .find_by_public_id(&public_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(
        serde_json::to_value(run.masked_view()).unwrap_or(Value::Null),
    ))
}

async fn policy_checks(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(run_id): Path<u64>,
) -> Result<Json<Value>, StatusCode> {
    let decisions = orchestrator
        .services()
        .store
        .policy_decisions(run_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::to_value(decisions).unwrap_or(Value::Null)))
}

async fn deviations(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(run_id): Path<u64>,
) -> Result<Json<Value>, StatusCode> {
    let deviations = orchestrator
        .services()
        .store
        .deviations(run_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::to_value(deviations).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct HitlRequest {
    decision: String,
    #[serde(default)]
    role: Option<Role>,
}

async fn hitl_decision(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(run_id): Path<u64>,
    Json(request): Json<HitlRequest>,
) -> Result<Json<Value>, StatusCode> {
    let approve = match request.decision.as_str() {
        "approve" => true,
        "deny" => false,
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    orchestrator
        .resolve_approval(run_id, approve, request.role)
        .await
        .map_err(|_| StatusCode::CONFLICT)?;
    Ok(Json(json!({"run_id": run_id, "decision": request.decision})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Services;

    #[tokio::test]
    async fn test_router_builds_and_metrics_serializes() {
        let services = Services::builder().build();
        let orchestrator = Orchestrator::new(services);
        let _router = router(Arc::clone(&orchestrator));

        let Json(snapshot) = metrics(State(orchestrator)).await;
        assert!(snapshot.get("last_24h").is_some());
        assert!(snapshot.get("failure_clusters").is_some());
    }

    #[tokio::test]
    async fn test_unknown_public_id_is_404() {
        let services = Services::builder().build();
        let orchestrator = Orchestrator::new(services);
        let result = run_by_public_id(State(orchestrator), Path("nope".to_string())).await;
        assert!(matches!(result, Err(StatusCode::NOT_FOUND)));
    }

    #[tokio::test]
    async fn test_bad_hitl_decision_is_400() {
        let services = Services::builder().build();
        let orchestrator = Orchestrator::new(services);
        let result = hitl_decision(
            State(orchestrator),
            Path(1),
            Json(HitlRequest {
                decision: "maybe".to_string(),
                role: None,
            }),
        )
        .await;
        assert!(matches!(result, Err(StatusCode::BAD_REQUEST)));
    }
}
