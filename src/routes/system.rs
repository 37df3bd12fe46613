// 系统接口

use super::AppState;
use crate::device::Accelerator;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

/// 服务信息
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub accelerator: Accelerator,
    pub workers_per_device: usize,
    pub worker_slots: usize,
    pub model_filename: String,
    pub output_format: String,
}

/// GET /health
pub async fn health() -> &'static str {
    "ok"
}

/// GET /info
pub async fn info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(state.info.as_ref().clone())
}
