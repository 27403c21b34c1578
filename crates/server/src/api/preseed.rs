/// 安装引导内容
///
/// 开通时写入引导参数的 URL 指向这里，安装程序启动后按模板拉取 preseed。

use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};

use super::ApiError;
use crate::app_state::AppState;

/// GET /preseed/:template_id
pub async fn get_preseed(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let template = state.repo.get_template(&template_id).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], template.preseed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use crate::services::test_support::fixture;

    #[tokio::test]
    async fn test_serves_template_preseed() {
        let fx = fixture().await;
        let app = Router::new()
            .route("/preseed/:template_id", get(get_preseed))
            .with_state(fx.state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/preseed/{}", fx.template.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], fx.template.preseed.as_bytes());

        let response = app
            .oneshot(Request::builder().uri("/preseed/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
