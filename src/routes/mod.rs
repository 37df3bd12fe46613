// HTTP 路由
//
// - GET  /health   存活检查（无需鉴权）
// - GET  /info     服务信息
// - POST /predict  上传音频，返回人声

pub mod predict;
pub mod system;

use crate::auth;
use crate::pipeline::Pipeline;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use system::ServiceInfo;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub api_key: Option<Arc<str>>,
    pub request_timeout: Option<Duration>,
    pub info: Arc<ServiceInfo>,
}

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    let protected = Router::new()
        .route("/predict", post(predict::predict))
        .route("/info", get(system::info))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(system::health))
        .merge(protected)
        .with_state(state)
}
