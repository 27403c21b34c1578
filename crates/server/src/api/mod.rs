pub mod capacity;
pub mod preseed;
pub mod vms;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::app_state::AppState;

/// 所有 API 路由（统一入口）
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/vms", vms::vm_routes())
        .nest("/capacity", capacity::routes())
}

/// API 错误响应
#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    message: String,
}

/// 业务错误到 HTTP 状态码的映射
#[derive(Debug)]
pub struct ApiError(pub common::Error);

impl From<common::Error> for ApiError {
    fn from(err: common::Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        use common::Error::*;

        match &self.0 {
            InvalidCidr(_) | InvalidArgument(_) | Serialization(_) => StatusCode::BAD_REQUEST,
            NotFound(_) => StatusCode::NOT_FOUND,
            AddressPoolExhausted(_) | AddressInUse(_) | NoCapacity { .. } | StaleState(_)
            | InvalidState(_) => StatusCode::CONFLICT,
            HostUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RemoteObjectCreation { .. } | Hypervisor(_) => StatusCode::BAD_GATEWAY,
            Database(_) | Internal(_) | Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("请求处理失败: {}", self.0);
        }

        let body = Json(ErrorResponse {
            success: false,
            error: status.canonical_reason().unwrap_or("Unknown").to_string(),
            message: self.0.to_string(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Error;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::InvalidCidr("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("vm".into()), StatusCode::NOT_FOUND),
            (Error::NoCapacity { required: 1 }, StatusCode::CONFLICT),
            (Error::AddressInUse("10.0.0.2".into()), StatusCode::CONFLICT),
            (Error::StaleState("v".into()), StatusCode::CONFLICT),
            (Error::host_unavailable("xs01", "timeout"), StatusCode::SERVICE_UNAVAILABLE),
            (Error::remote_creation("create_vif", "boom"), StatusCode::BAD_GATEWAY),
            (Error::Database("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
