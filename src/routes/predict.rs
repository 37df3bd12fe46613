// POST /predict

use super::AppState;
use crate::error::{AppError, AppResult};
use crate::pipeline::ingress::UploadDescriptor;
use axum::extract::{Multipart, State};
use axum::response::Response;
use futures_util::TryStreamExt;
use std::io;
use tokio_util::io::StreamReader;
use tracing::info;

/// 接收上传音频，返回分离出的人声
///
/// multipart 中第一个部分即为上传文件。
pub async fn predict(State(state): State<AppState>, mut multipart: Multipart) -> AppResult<Response> {
    let field = multipart
        .next_field()
        .await?
        .ok_or(AppError::MissingUpload)?;

    let original_filename = field.file_name().map(str::to_string);
    info!("[PREDICT] 收到上传: {:?}", original_filename);

    let byte_stream = StreamReader::new(Box::pin(
        field.map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
    ));
    let upload = UploadDescriptor {
        original_filename,
        byte_stream,
    };

    let run = state.pipeline.run(upload);
    match state.request_timeout {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .map_err(|_| AppError::Timeout)?,
        None => run.await,
    }
}
