use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use color_eyre::eyre::{Context, eyre};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::http_server::{error::Report, state::AppState};
use crate::report::{FailureReport, StatusReport};

async fn get_status(State(app_state): State<Arc<AppState>>) -> Result<Json<StatusReport>, Report> {
    let status = StatusReport::gather(&app_state.store, app_state.limits).await?;
    Ok(Json(status))
}

async fn get_failures(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<FailureReport>, Report> {
    let report =
        FailureReport::gather(&app_state.store, &app_state.staging, app_state.limits).await?;
    Ok(Json(report))
}

pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/failures", get(get_failures))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Serve the read-only operator endpoints until `shutdown` fires.
pub async fn start(
    port: u16,
    app_state: Arc<AppState>,
    shutdown: CancellationToken,
) -> color_eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .wrap_err_with(|| eyre!("Failed to bind to port {}", port))?;
    tracing::info!(port, "Serving status endpoints");

    axum::serve(listener, router(app_state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .wrap_err("Failed to start HTTP server")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::DiscoveredItem;
    use crate::staging::Staging;
    use crate::store::RetryLimits;
    use crate::test_utils::test_store;

    #[tokio::test]
    async fn test_status_and_failures_handlers() {
        let t = test_store().await;
        t.store.register(&DiscoveredItem::new("a.jpg")).await.unwrap();
        let staging_dir = tempfile::tempdir().unwrap();
        let app_state = Arc::new(AppState {
            store: t.store.clone(),
            staging: Staging::new(staging_dir.path()).unwrap(),
            limits: RetryLimits {
                fetch: 5,
                delivery: 5,
            },
        });

        let Json(status) = get_status(State(app_state.clone())).await.unwrap();
        assert_eq!(status.total, 1);
        assert!(!status.complete);

        let Json(failures) = get_failures(State(app_state)).await.unwrap();
        assert!(failures.permanent_failures.is_empty());
        assert!(failures.leftover_staging.is_empty());
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let t = test_store().await;
        let staging_dir = tempfile::tempdir().unwrap();
        let app_state = Arc::new(AppState {
            store: t.store.clone(),
            staging: Staging::new(staging_dir.path()).unwrap(),
            limits: RetryLimits {
                fetch: 5,
                delivery: 5,
            },
        });
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            start(0, app_state, shutdown),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
