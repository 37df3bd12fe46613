// 响应阶段：流式返回输出文件，发送结束后删除

use crate::error::{AppError, AppResult};
use crate::scratch::{ScratchFile, ScratchRole};
use chrono::Local;
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures_util::Stream;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// 根据扩展名推断音频 Content-Type
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "m4a" | "aac" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

/// 响应体流，持有输出文件的所有权
///
/// 流被丢弃时（发送完毕或传输中断）删除文件，且只删除一次。
pub struct CleanupStream<S> {
    inner: Option<S>,
    file: Option<ScratchFile>,
    sent: u64,
    finished: bool,
}

impl<S> CleanupStream<S> {
    pub fn new(inner: S, file: ScratchFile) -> Self {
        Self {
            inner: Some(inner),
            file: Some(file),
            sent: 0,
            finished: false,
        }
    }
}

impl<S> Stream for CleanupStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                warn!("[EGRESS] 读取输出文件失败: {}", e);
                this.inner = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                // 先关闭文件句柄，删除留到 Drop
                this.inner = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for CleanupStream<S> {
    fn drop(&mut self) {
        self.inner = None;
        if let Some(file) = self.file.take() {
            if self.finished {
                let elapsed = Local::now() - file.created_at();
                info!(
                    "[EGRESS] 发送完成 ({} bytes, 输出存在 {} ms): {:?}",
                    self.sent,
                    elapsed.num_milliseconds(),
                    file.path()
                );
            } else {
                warn!(
                    "[EGRESS] 传输中断 (已发送 {} bytes)，清理输出文件: {:?}",
                    self.sent,
                    file.path()
                );
            }
            file.remove();
        }
    }
}

/// 构造流式响应，并把输出文件的删除绑定到响应体生命周期
pub async fn respond(output: ScratchFile) -> AppResult<Response> {
    debug_assert_eq!(output.role(), ScratchRole::Output);

    let metadata = match tokio::fs::metadata(output.path()).await {
        Ok(m) if m.is_file() => m,
        _ => {
            // 文件不存在，不做任何删除
            let path = output.disown();
            return Err(AppError::OutputMissing(path));
        }
    };

    let file = tokio::fs::File::open(output.path()).await?;
    let content_type = content_type_for(output.path());
    let filename = output
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "vocals".to_string());

    info!(
        "[EGRESS] 开始发送: {:?} ({} bytes, {})",
        output.path(),
        metadata.len(),
        content_type
    );

    let body = Body::from_stream(CleanupStream::new(ReaderStream::new(file), output));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, metadata.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(body)
        .map_err(|e| AppError::Worker(format!("构造响应失败: {}", e)))
}
