// Server module - HTTP endpoints of the exporter
//
// GET <metrics path>  -> runs one scrape, answers in the text format
// GET /health         -> liveness probe
// GET /               -> redirect to the metrics path

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::exposition;
use crate::scrape::Scraper;

pub const HEALTH_PATH: &str = "/health";

pub fn router(scraper: Arc<Scraper>, metrics_path: &str) -> Router {
    let target = metrics_path.to_string();

    Router::new()
        .route(metrics_path, get(metrics))
        .route(HEALTH_PATH, get(health))
        .route(
            "/",
            get(move || {
                let target = target.clone();
                async move { (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, target)]) }
            }),
        )
        .with_state(scraper)
}

/// A failed collector never turns into an HTTP error; it is visible only
/// through its success gauge.
async fn metrics(State(scraper): State<Arc<Scraper>>) -> Response {
    let samples = scraper.scrape().await;

    match exposition::encode(samples) {
        Ok(body) => (
            [(header::CONTENT_TYPE, exposition::content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
