use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
}

pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}
