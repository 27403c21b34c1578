/// 虚拟机管理接口

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::VmRecord;
use serde::Deserialize;

use super::ApiError;
use crate::app_state::AppState;
use crate::services::vm_service::{ProvisionRequest, VmService};

/// 重试开通请求
#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub extra_segments: Vec<String>,
}

/// VM 路由
pub fn vm_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_vm))
        .route("/:id", get(get_vm))
        .route("/:id/metrics", get(get_vm_metrics))
        .route("/:id/start", post(start_vm))
        .route("/:id/stop", post(stop_vm))
        .route("/:id/reboot", post(reboot_vm))
        .route("/:id/terminate", post(terminate_vm))
        .route("/:id/retry", post(retry_vm))
}

/// 提交开通请求，立即返回登记的记录
///
/// POST /api/vms
pub async fn create_vm(
    State(state): State<AppState>,
    Json(req): Json<ProvisionRequest>,
) -> Result<(StatusCode, Json<VmRecord>), ApiError> {
    let vm = VmService::new(state).provision(req).await?;
    Ok((StatusCode::ACCEPTED, Json(vm)))
}

/// GET /api/vms/:id
pub async fn get_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VmRecord>, ApiError> {
    Ok(Json(VmService::new(state).get_vm(&id).await?))
}

/// 虚拟机性能指标，按指标名给出 [毫秒时间戳, 取值] 点列
///
/// GET /api/vms/:id/metrics
pub async fn get_vm_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BTreeMap<String, Vec<(i64, f64)>>>, ApiError> {
    Ok(Json(VmService::new(state).get_metrics(&id).await?))
}

/// POST /api/vms/:id/start
pub async fn start_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<VmRecord>), ApiError> {
    let vm = VmService::new(state).start_vm(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(vm)))
}

/// POST /api/vms/:id/stop
pub async fn stop_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<VmRecord>), ApiError> {
    let vm = VmService::new(state).stop_vm(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(vm)))
}

/// POST /api/vms/:id/reboot
pub async fn reboot_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<VmRecord>), ApiError> {
    let vm = VmService::new(state).reboot_vm(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(vm)))
}

/// POST /api/vms/:id/terminate
pub async fn terminate_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<VmRecord>), ApiError> {
    let vm = VmService::new(state).terminate_vm(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(vm)))
}

/// 重新执行失败的开通流程
///
/// POST /api/vms/:id/retry
/// Body: { "extra_segments": ["xenbr1"] }
pub async fn retry_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RetryRequest>,
) -> Result<(StatusCode, Json<VmRecord>), ApiError> {
    let vm = VmService::new(state)
        .retry_provision(&id, req.extra_segments)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(vm)))
}
