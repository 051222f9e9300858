//! Liveness probe, served without authentication.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// `GET /healthz`: always `200 OK` with `{"status": "ok"}`.
///
/// Does not contact the verification endpoint or the origin, so an outage of
/// either never takes the gateway out of a load balancer.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": env!("CARGO_PKG_NAME") })),
    )
}
