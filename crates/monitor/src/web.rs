use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::db::Db;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/gateways", get(api_gateways))
        .route("/api/gateways/{id}", get(api_gateway))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_gateways(State(state): State<AppState>) -> Response {
    match state.db.load_gateway_statuses().await {
        Ok(records) => Json(records).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn api_gateway(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.db.get_gateway_status(&id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("gateway '{id}' has not been evaluated") })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: anyhow::Error) -> Response {
    error!("web: query failed: {e:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("status api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("web server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::db::GatewayStateRecord;
    use crate::state::{CycleSummary, MonitorState};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;
    use time::macros::datetime;
    use tower::ServiceExt;

    async fn app() -> (Router, AppState) {
        let state = AppState {
            shared: MonitorState::shared(),
            db: test_db().await,
        };
        (router(state.clone()), state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_reports_cycles_and_events() {
        let (app, state) = app().await;
        {
            let mut st = state.shared.write().await;
            st.record_transition("gw1", true);
            st.record_cycle(CycleSummary {
                gateways: 3,
                ..CycleSummary::default()
            });
        }

        let (status, body) = get_json(app, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cycles_completed"], 1);
        assert_eq!(body["last_cycle"]["gateways"], 3);
        assert_eq!(body["events"][0]["kind"], "transition");
    }

    #[tokio::test]
    async fn gateways_list_and_lookup() {
        let (app, state) = app().await;
        state
            .db
            .upsert_gateway_status(&GatewayStateRecord {
                gateway_id: "gw1".into(),
                name: "Roof".into(),
                online: false,
                last_seen: datetime!(2024-06-01 11:50:00 UTC),
                status_factors: BTreeMap::new(),
                last_updated: datetime!(2024-06-01 12:00:00 UTC),
            })
            .await
            .unwrap();

        let (status, body) = get_json(app.clone(), "/api/gateways").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["online"], false);
        assert_eq!(body[0]["last_seen"], "2024-06-01T11:50:00Z");

        let (status, body) = get_json(app.clone(), "/api/gateways/gw1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Roof");

        let (status, _) = get_json(app, "/api/gateways/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
