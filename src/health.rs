use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::{ApiResponse, AppError, AppState};

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_ms: u64,
    pub time: DateTime<Utc>,
}

pub async fn health(State(app_state): State<AppState>) -> Result<ApiResponse<HealthReport>, AppError> {
    let uptime_ms = u64::try_from(app_state.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    Ok(ApiResponse(HealthReport {
        status: "ok",
        uptime_ms,
        time: Utc::now(),
    }))
}
