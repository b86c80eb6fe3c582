use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Returns a simple status object with service version and registered categories.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let categories: Vec<&str> = state.coordinator.registry().categories().collect();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "insight-api",
        "categories": categories
    }))
}
