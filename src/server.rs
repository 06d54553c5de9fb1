use axum::{
    Extension, Json, Router,
    extract::{Query, Request, State},
    http::{HeaderMap, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::clock::Clock;
use crate::db::SqliteReader;
use crate::engine::AnalyticsEngine;
use crate::error::{AnalyticsError, Result};
use crate::reader::Cancellation;
use crate::report::{ExportFormat, Report, StructuredReport};

/// Maps a bearer token to the tenant it belongs to.
pub trait TenantAuthenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> anyhow::Result<Option<i64>>;
}

impl TenantAuthenticator for SqliteReader {
    fn authenticate(&self, token: &str) -> anyhow::Result<Option<i64>> {
        self.company_for_token(token)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AnalyticsEngine>,
    pub auth: Arc<dyn TenantAuthenticator>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy)]
pub struct CurrentTenant(pub i64);

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let Some(token) = bearer_token(request.headers()).map(str::to_string) else {
        tracing::warn!("token missing, authentication denied");
        return Err(AnalyticsError::Unauthenticated);
    };

    let auth = Arc::clone(&state.auth);
    let tenant = tokio::task::spawn_blocking(move || auth.authenticate(&token))
        .await
        .map_err(|e| AnalyticsError::Storage(e.into()))??;

    match tenant {
        Some(tenant_id) => {
            request.extensions_mut().insert(CurrentTenant(tenant_id));
            Ok(next.run(request).await)
        }
        None => {
            tracing::warn!("unknown token, authentication denied");
            Err(AnalyticsError::Unauthenticated)
        }
    }
}

pub async fn analytics(
    State(state): State<AppState>,
    Extension(CurrentTenant(tenant_id)): Extension<CurrentTenant>,
) -> Result<Json<StructuredReport>> {
    let now = state.clock.now();
    let report = state
        .engine
        .structured(tenant_id, now, &Cancellation::new())
        .await?;
    Ok(Json(report))
}

pub async fn export(
    State(state): State<AppState>,
    Extension(CurrentTenant(tenant_id)): Extension<CurrentTenant>,
    Query(query): Query<ExportQuery>,
) -> Result<Response> {
    let format = ExportFormat::from_query(query.format.as_deref())?;
    let now = state.clock.now();
    let report = state
        .engine
        .report(tenant_id, format, now, &Cancellation::new())
        .await?;

    Ok(match report {
        Report::Structured(report) => Json(report).into_response(),
        Report::Flat(flat) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", flat.filename),
                ),
            ],
            flat.body,
        )
            .into_response(),
    })
}

pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "funnel",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/company/analytics", get(analytics))
        .route("/company/analytics/export", get(export))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .route("/healthz", get(healthz))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Listening");
    tokio::select! {
        r = axum::serve(listener, build_router(state)) => {
            tracing::warn!("server ended unexpectedly: {:?}", &r)
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl+c interrupt, closing server");
        }
    }
    Ok(())
}
