// 错误处理模块

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, warn};

use crate::audio::separator::EngineError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("multipart 解析失败: {0}")]
    Multipart(#[from] MultipartError),

    #[error("请求中没有上传文件")]
    MissingUpload,

    #[error("未提供文件名")]
    MissingFilename,

    #[error("无效的文件格式: {0}")]
    InvalidFormat(String),

    #[error("上传文件写入失败 {path:?}: {source}")]
    StorageWriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("人声分离失败: {0}")]
    SeparationFailure(#[source] EngineError),

    #[error("模型加载失败: {0}")]
    ModelLoad(#[source] EngineError),

    #[error("输出文件不存在: {0:?}")]
    OutputMissing(PathBuf),

    #[error("临时文件清理失败 {path:?}: {source}")]
    CleanupFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("缺少 API Key")]
    Unauthorized,

    #[error("API Key 不匹配")]
    Forbidden,

    #[error("请求处理超时")]
    Timeout,

    #[error("工作线程异常退出: {0}")]
    Worker(String),
}

impl AppError {
    /// HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingUpload | AppError::MissingFilename | AppError::InvalidFormat(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Multipart(e) => e.status(),
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::OutputMissing(_) => StatusCode::NOT_FOUND,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 返回给客户端的描述，服务端内部原因只写日志
    pub fn client_message(&self) -> String {
        match self {
            AppError::Multipart(e) => e.body_text(),
            AppError::MissingUpload => "No file uploaded".to_string(),
            AppError::MissingFilename => "No filename provided".to_string(),
            AppError::InvalidFormat(name) => format!("Invalid file format: {}", name),
            AppError::StorageWriteFailure { .. } => "Failed to save uploaded file".to_string(),
            AppError::SeparationFailure(_) => "Audio separation failed".to_string(),
            AppError::OutputMissing(_) => "Output file not found".to_string(),
            AppError::Unauthorized => "Missing API key".to_string(),
            AppError::Forbidden => "Invalid API key".to_string(),
            AppError::Timeout => "Request timed out".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            // 推理声称成功但找不到输出，说明命名约定与引擎不一致
            AppError::OutputMissing(path) => {
                error!("[EGRESS] 推理完成但输出文件缺失，可能是命名约定漂移: {:?}", path);
            }
            AppError::SeparationFailure(source) => {
                error!("[INFERENCE] 人声分离失败: {}", source);
            }
            _ if status.is_server_error() => error!("请求失败: {}", self),
            _ => warn!("请求被拒绝: {}", self),
        }

        (status, Json(json!({ "detail": self.client_message() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
