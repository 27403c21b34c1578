/// 容量概览接口

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use common::placement::CapacityReport;
use serde::Deserialize;

use super::ApiError;
use crate::app_state::AppState;
use crate::services::capacity_service::CapacityService;

#[derive(Debug, Deserialize)]
pub struct CapacityQuery {
    pub zone: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(get_capacity))
}

/// GET /api/capacity?zone=
pub async fn get_capacity(
    State(state): State<AppState>,
    Query(query): Query<CapacityQuery>,
) -> Result<Json<CapacityReport>, ApiError> {
    let report = CapacityService::new(state)
        .report(query.zone.as_deref())
        .await?;
    Ok(Json(report))
}
