//! JSON API over the analytics engine.
//!
//! Thin layer: every request pulls a fresh snapshot from the
//! [`SnapshotSource`], runs one aggregation pass against a clock
//! captured at request time, and serializes the report. Nothing is
//! cached or persisted between requests.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use oubo_analytics::{site_rows_csv, AggregationEngine, TimeBucketer};
use oubo_channel::{ChannelRegistry, ChannelResolver};
use oubo_core::{MonthFilter, Scope, Snapshot};
use oubo_ingest::{FeedClient, FeedConfig};
use serde::Deserialize;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oubo-web";

/// Where a request gets its snapshot from. The production source walks
/// the feed; tests hand in a fixed snapshot.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Snapshot;
}

pub struct FeedSnapshotSource {
    client: FeedClient,
}

impl FeedSnapshotSource {
    pub fn new(client: FeedClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SnapshotSource for FeedSnapshotSource {
    async fn snapshot(&self) -> Snapshot {
        self.client.fetch_snapshot(Uuid::new_v4()).await
    }
}

/// Fixed snapshot, for tests and offline report generation.
pub struct StaticSnapshotSource {
    snapshot: Snapshot,
}

impl StaticSnapshotSource {
    pub fn new(snapshot: Snapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn snapshot(&self) -> Snapshot {
        self.snapshot.clone()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn SnapshotSource>,
    pub registry: ChannelRegistry,
}

impl AppState {
    pub fn new(source: Arc<dyn SnapshotSource>, registry: ChannelRegistry) -> Self {
        Self { source, registry }
    }
}

#[derive(Debug, Deserialize, Default)]
struct AnalyticsQuery {
    company: Option<String>,
    #[serde(alias = "month")]
    ym: Option<String>,
}

fn month_filter(raw: Option<&str>) -> MonthFilter {
    match raw {
        None | Some("") | Some("all") | Some("ALL") => MonthFilter::All,
        Some(ym) => MonthFilter::Month(ym.to_string()),
    }
}

impl AnalyticsQuery {
    fn scope(&self) -> Scope {
        Scope {
            company_id: self.company.clone().filter(|c| !c.is_empty()),
            month: month_filter(self.ym.as_deref()),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/analytics", get(analytics_handler))
        .route("/analytics/csv", get(analytics_csv_handler))
        .route("/companies/{company_id}/funnel", get(funnel_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("OUBO_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let registry = ChannelRegistry::with_overlay("channels.yaml")?;
    let client = FeedClient::new(FeedConfig::from_env())?;
    let state = AppState::new(Arc::new(FeedSnapshotSource::new(client)), registry);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn engine(state: &AppState) -> AggregationEngine<chrono::Local> {
    AggregationEngine::new(
        ChannelResolver::new(state.registry.clone()),
        TimeBucketer::local(Utc::now()),
    )
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "crate": CRATE_NAME })).into_response()
}

async fn analytics_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> Response {
    let snapshot = state.source.snapshot().await;
    let report = engine(&state).run_pass(&snapshot, &query.scope());
    Json(report).into_response()
}

async fn analytics_csv_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> Response {
    let snapshot = state.source.snapshot().await;
    let rows = engine(&state).site_rows(&snapshot, &query.scope());
    let csv = site_rows_csv(&rows);
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"site_analytics.csv\"",
            ),
        ],
        csv,
    )
        .into_response()
}

#[derive(Debug, Deserialize, Default)]
struct FunnelQuery {
    #[serde(alias = "month")]
    ym: Option<String>,
}

async fn funnel_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(company_id): AxumPath<String>,
    Query(query): Query<FunnelQuery>,
) -> Response {
    let snapshot = state.source.snapshot().await;
    if !snapshot.companies.iter().any(|c| c.id == company_id) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "company not found" })),
        )
            .into_response();
    }
    let funnel = engine(&state).funnel(&snapshot, &company_id, &month_filter(query.ym.as_deref()));
    Json(funnel).into_response()
}
