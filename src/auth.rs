// API Key 鉴权

use crate::error::{AppError, AppResult};
use crate::routes::AppState;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

pub const API_KEY_HEADER: &str = "x-api-key";

/// 校验共享密钥：未配置时放行，缺失返回 401，不匹配返回 403
pub fn check_api_key(expected: Option<&str>, headers: &HeaderMap) -> AppResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };

    match headers.get(API_KEY_HEADER) {
        None => Err(AppError::Unauthorized),
        Some(value) if value.as_bytes() == expected.as_bytes() => Ok(()),
        Some(_) => Err(AppError::Forbidden),
    }
}

pub async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Err(e) = check_api_key(state.api_key.as_deref(), request.headers()) {
        return e.into_response();
    }
    next.run(request).await
}
