//! Sweep handlers

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use zapcast_core::{StallReport, SweepReport};

use crate::auth::AppState;
use crate::error::ApiResult;

/// Reports of both sweeps
#[derive(Debug, Serialize)]
pub struct SweepAllResponse {
    pub trigger: SweepReport,
    pub stall: StallReport,
}

/// Run the scheduler trigger, then the stall detector
///
/// POST /api/v1/sweeps
pub async fn sweep_all(State(state): State<Arc<AppState>>) -> ApiResult<Json<SweepAllResponse>> {
    let trigger = state.trigger.sweep().await?;
    let stall = state.stall.detect_and_recover().await?;
    Ok(Json(SweepAllResponse { trigger, stall }))
}
