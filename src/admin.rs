//! Admin and metrics HTTP surface.
//!
//! Operators (and the CipherBox server acting on their behalf) reach the
//! coordinator here: aggregate republish health, stale-row reactivation,
//! force-run, epoch deprecation, rotation history, and the Prometheus
//! scrape endpoint. Bearer authentication happens upstream; this router
//! assumes an already-authenticated caller.

use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::epoch::{DeprecateOutcome, RotationLogEntry};
use crate::error::StoreError;
use crate::metrics::HTTP_REQUESTS_TOTAL;
use crate::signer::SignerApi;
use crate::store::SharedStore;

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Everything the admin handlers need. Cheap to clone.
#[derive(Clone)]
pub struct AdminState<S> {
    pub store: SharedStore,
    pub signer: S,
    /// Wakes the scheduler loop for an immediate run.
    pub force_run: Arc<Notify>,
    /// Absent in tests that run without a recorder.
    pub prometheus: Option<PrometheusHandle>,
}

/// The aggregate health payload of `GET /admin/republish-health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepublishStats {
    /// Rows waiting on their regular schedule.
    pub pending: usize,
    pub retrying: usize,
    pub stale: usize,
    pub last_run_at: Option<u64>,
    pub current_epoch: Option<u64>,
    pub signer_healthy: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReactivateResponse {
    pub reactivated: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForceRunResponse {
    pub enqueued: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeprecateResponse {
    pub outcome: DeprecateOutcome,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Aggregate counters for the health endpoint. Signer transport trouble is
/// an expected condition here and reads as `signer_healthy: false`.
pub async fn stats<S: SignerApi + Sync>(store: &SharedStore, signer: &S) -> RepublishStats {
    let (counts, last_run_at, current_epoch) = {
        let guard = store.lock().await;
        (
            guard.status_counts(),
            guard.last_run_at(),
            guard.epoch_state().map(|e| e.current_epoch),
        )
    };
    let signer_healthy = match signer.health().await {
        Ok(health) => health.healthy,
        Err(err) => {
            tracing::debug!(error = %err, "signer health probe failed");
            false
        }
    };
    RepublishStats {
        pending: counts.pending,
        retrying: counts.retrying,
        stale: counts.stale,
        last_run_at,
        current_epoch,
        signer_healthy,
    }
}

pub fn router<S>(state: AdminState<S>) -> Router
where
    S: SignerApi + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/admin/republish-health", get(republish_health::<S>))
        .route("/admin/reactivate-stale", post(reactivate_stale::<S>))
        .route("/admin/force-run", post(force_run::<S>))
        .route(
            "/admin/deprecate-previous-epoch",
            post(deprecate_previous::<S>),
        )
        .route("/admin/epoch-history", get(epoch_history::<S>))
        .route("/metrics", get(metrics_text::<S>))
        .layer(middleware::from_fn(track_http))
        .with_state(state)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> eyre::Result<()> {
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(Into::into)
}

async fn republish_health<S>(State(state): State<AdminState<S>>) -> Json<RepublishStats>
where
    S: SignerApi + Clone + Send + Sync + 'static,
{
    Json(stats(&state.store, &state.signer).await)
}

async fn reactivate_stale<S>(
    State(state): State<AdminState<S>>,
) -> Result<Json<ReactivateResponse>, (StatusCode, String)>
where
    S: SignerApi + Clone + Send + Sync + 'static,
{
    let reactivated = state
        .store
        .lock()
        .await
        .reactivate_stale()
        .map_err(internal_error)?;
    tracing::info!(reactivated, "stale enrollments reactivated");
    Ok(Json(ReactivateResponse { reactivated }))
}

async fn force_run<S>(State(state): State<AdminState<S>>) -> Json<ForceRunResponse>
where
    S: SignerApi + Clone + Send + Sync + 'static,
{
    state.force_run.notify_one();
    tracing::info!("scheduler force-run requested");
    Json(ForceRunResponse { enqueued: true })
}

async fn deprecate_previous<S>(
    State(state): State<AdminState<S>>,
) -> Result<Json<DeprecateResponse>, (StatusCode, String)>
where
    S: SignerApi + Clone + Send + Sync + 'static,
{
    let outcome = state
        .store
        .lock()
        .await
        .deprecate_previous_epoch()
        .map_err(internal_error)?;
    tracing::info!(?outcome, "deprecate-previous-epoch requested");
    Ok(Json(DeprecateResponse { outcome }))
}

async fn epoch_history<S>(
    State(state): State<AdminState<S>>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<RotationLogEntry>>
where
    S: SignerApi + Clone + Send + Sync + 'static,
{
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Json(state.store.lock().await.epoch_history(limit))
}

async fn metrics_text<S>(State(state): State<AdminState<S>>) -> Response
where
    S: SignerApi + Clone + Send + Sync + 'static,
{
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}

async fn track_http(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method,
        "path" => path,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}

fn internal_error(err: StoreError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
