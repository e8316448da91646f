//! Read-only JSON API over the history aggregates.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use shelf_analytics::{
    catalog_statistics, currently_out_of_stock, demand_scores, stock_level_series,
    stockout_rates_by_category, variant_type_series, DemandReport, DemandScore, ProductState,
};
use shelf_core::NormalizedSnapshot;
use shelf_storage::{open_store, SnapshotStore};
use shelf_sync::SyncConfig;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "shelf-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SnapshotStore>,
    pub bucket_minutes: i64,
}

impl AppState {
    pub fn new(store: Arc<dyn SnapshotStore>, bucket_minutes: i64) -> Self {
        Self {
            store,
            bucket_minutes,
        }
    }

    fn bucket_width(&self, query: &SeriesQuery) -> Duration {
        let minutes = query
            .bucket_minutes
            .filter(|m| *m > 0)
            .unwrap_or(self.bucket_minutes)
            .max(1);
        Duration::minutes(minutes)
    }
}

#[derive(Debug, Deserialize, Default)]
struct SeriesQuery {
    bucket_minutes: Option<i64>,
}

/// The demand card shows a ranking once history allows one, otherwise what is sold out right now.
#[derive(Debug, Serialize)]
#[serde(tag = "mode", content = "items", rename_all = "snake_case")]
enum DemandCard {
    Ranked(Vec<DemandScore>),
    OutOfStock(Vec<ProductState>),
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/stock-levels", get(stock_levels_handler))
        .route("/api/variant-types", get(variant_types_handler))
        .route("/api/demand", get(demand_handler))
        .route("/api/stockout-rates", get(stockout_rates_handler))
        .route("/api/statistics", get(statistics_handler))
        .route("/api/runs/latest", get(latest_run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving history api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = open_store(&config.store_url).await?;
    serve(AppState::new(store, config.bucket_minutes), config.web_port).await
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn stock_levels_handler(State(state): State<Arc<AppState>>, Query(query): Query<SeriesQuery>) -> Response {
    let width = state.bucket_width(&query);
    with_history(&state, |history| Json(stock_level_series(history, width)).into_response()).await
}

async fn variant_types_handler(State(state): State<Arc<AppState>>, Query(query): Query<SeriesQuery>) -> Response {
    let width = state.bucket_width(&query);
    with_history(&state, |history| Json(variant_type_series(history, width)).into_response()).await
}

async fn demand_handler(State(state): State<Arc<AppState>>) -> Response {
    with_history(&state, |history| {
        let card = match demand_scores(history) {
            DemandReport::Ranked(scores) => DemandCard::Ranked(scores),
            DemandReport::InsufficientHistory => DemandCard::OutOfStock(currently_out_of_stock(history)),
        };
        Json(card).into_response()
    })
    .await
}

async fn stockout_rates_handler(State(state): State<Arc<AppState>>) -> Response {
    with_history(&state, |history| Json(stockout_rates_by_category(history)).into_response()).await
}

async fn statistics_handler(State(state): State<Arc<AppState>>) -> Response {
    with_history(&state, |history| Json(catalog_statistics(history)).into_response()).await
}

async fn latest_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_run().await {
        Ok(run) => Json(run).into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// One `query_all` per request; the closure sees a consistent copy of the history.
async fn with_history<F>(state: &AppState, render: F) -> Response
where
    F: FnOnce(&[NormalizedSnapshot]) -> Response,
{
    match state.store.query_all().await {
        Ok(history) => render(&history),
        Err(err) => server_error(err.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "history query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use shelf_core::{Category, CollectionRun, RunStatus, StockStatus};
    use shelf_storage::MemorySnapshotStore;
    use std::collections::BTreeSet;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn at(hhmm: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("2026-02-24T{hhmm}:00Z"))
            .unwrap()
            .with_timezone(&Utc)
    }

    fn snap(url: &str, status: StockStatus, ts: DateTime<Utc>) -> NormalizedSnapshot {
        NormalizedSnapshot {
            id: Uuid::new_v4(),
            product_url: url.to_string(),
            title: url.to_uppercase(),
            description: String::new(),
            price: 120.0,
            category: Category::Gloves,
            stock_status: status,
            variants: Vec::new(),
            variant_count: 0,
            variant_types: BTreeSet::new(),
            image_urls: Vec::new(),
            image_count: 0,
            first_image_url: None,
            processing_timestamp: ts,
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn app_with(snapshots: Vec<NormalizedSnapshot>) -> (Router, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemorySnapshotStore::with_snapshots(snapshots));
        (app(AppState::new(store.clone(), 60)), store)
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (app, _) = app_with(Vec::new());
        let (status, body) = get_json(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn demand_falls_back_to_out_of_stock_with_one_capture() {
        let (app, _) = app_with(vec![
            snap("a", StockStatus::OutOfStock, at("09:00")),
            snap("b", StockStatus::InStock, at("09:00")),
        ]);
        let (status, body) = get_json(app, "/api/demand").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "out_of_stock");
        assert_eq!(body["items"][0]["url"], "a");
        assert_eq!(body["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn demand_ranks_once_history_exists() {
        let (app, _) = app_with(vec![
            snap("a", StockStatus::InStock, at("09:00")),
            snap("a", StockStatus::OutOfStock, at("10:00")),
        ]);
        let (_, body) = get_json(app, "/api/demand").await;
        assert_eq!(body["mode"], "ranked");
        assert_eq!(body["items"][0]["demand_score"], 1);
        assert_eq!(body["items"][0]["title"], "A");
    }

    #[tokio::test]
    async fn stock_levels_honour_bucket_override() {
        let (app, _) = app_with(vec![
            snap("a", StockStatus::InStock, at("09:05")),
            snap("b", StockStatus::InStock, at("09:40")),
        ]);
        let (_, hourly) = get_json(app.clone(), "/api/stock-levels").await;
        assert_eq!(hourly["state"], "insufficient");
        assert_eq!(hourly["buckets"].as_array().unwrap().len(), 1);
        assert_eq!(hourly["buckets"][0]["total_in_stock"], 2);

        let (_, halves) = get_json(app, "/api/stock-levels?bucket_minutes=30").await;
        assert_eq!(halves["state"], "trend");
        assert_eq!(halves["buckets"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn latest_run_is_null_until_recorded() {
        let (app, store) = app_with(Vec::new());
        let (_, body) = get_json(app.clone(), "/api/runs/latest").await;
        assert!(body.is_null());

        let run = CollectionRun::start(at("09:00"));
        store
            .record_run(&run.finish(at("09:10"), 4, 4, RunStatus::Completed, None))
            .await
            .unwrap();
        let (_, body) = get_json(app, "/api/runs/latest").await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["attempted_count"], 4);
    }

    #[tokio::test]
    async fn statistics_and_rates_share_latest_state() {
        let (app, _) = app_with(vec![
            snap("a", StockStatus::InStock, at("09:00")),
            snap("a", StockStatus::OutOfStock, at("10:00")),
            snap("b", StockStatus::InStock, at("10:00")),
        ]);
        let (_, stats) = get_json(app.clone(), "/api/statistics").await;
        assert_eq!(stats["total_products"], 2);
        let (_, rates) = get_json(app.clone(), "/api/stockout-rates").await;
        assert_eq!(rates[0]["category"], "gloves");
        assert_eq!(rates[0]["stockout_rate_percent"], 50.0);
        let (status, _) = get_json(app, "/api/variant-types").await;
        assert_eq!(status, StatusCode::OK);
    }
}
