// 请求处理流水线
//
// 子模块：
// - ingress: 上传文件落盘（唯一命名）
// - inference: 调用分离引擎，删除输入文件
// - egress: 流式返回输出文件，发送结束后删除

pub mod egress;
pub mod inference;
pub mod ingress;

use crate::audio::separator::SeparationEngine;
use crate::error::{AppError, AppResult};
use crate::scratch::ScratchDir;
use axum::response::Response;
use ingress::UploadDescriptor;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Ingress -> Inference -> Egress，所有请求共享同一个临时目录
#[derive(Clone)]
pub struct Pipeline {
    scratch: ScratchDir,
    engine: Arc<dyn SeparationEngine>,
    workers: Arc<Semaphore>,
    worker_slots: usize,
}

impl Pipeline {
    pub fn new(scratch: ScratchDir, engine: Arc<dyn SeparationEngine>, worker_slots: usize) -> Self {
        let worker_slots = worker_slots.max(1);
        Self {
            scratch,
            engine,
            workers: Arc::new(Semaphore::new(worker_slots)),
            worker_slots,
        }
    }

    pub fn worker_slots(&self) -> usize {
        self.worker_slots
    }

    pub fn output_format(&self) -> &str {
        self.engine.output_format()
    }

    /// 处理一次请求
    ///
    /// 请求在整个流水线期间占用一个工作槽位。推理在阻塞线程池中执行，
    /// 即使调用方被取消（客户端断开）也会跑完，临时文件由各自的所有者删除。
    pub async fn run<R>(&self, upload: UploadDescriptor<R>) -> AppResult<Response>
    where
        R: AsyncRead + Unpin,
    {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| AppError::Worker("工作池已关闭".to_string()))?;
        debug!(
            "[PIPELINE] 获得工作槽位，剩余 {}/{}",
            self.workers.available_permits(),
            self.worker_slots
        );

        let input = ingress::materialize(&self.scratch, upload).await?;

        let engine = self.engine.clone();
        let scratch = self.scratch.clone();
        let output = tokio::task::spawn_blocking(move || {
            inference::separate(engine.as_ref(), &scratch, input)
        })
        .await
        .map_err(|e| AppError::Worker(format!("推理任务异常: {}", e)))??;

        let response = egress::respond(output).await?;
        info!("[PIPELINE] 请求处理完成，开始流式返回");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::{FakeEngine, FakeMode};
    use axum::http::StatusCode;
    use std::path::Path;

    fn pipeline(dir: &Path, mode: FakeMode) -> (Pipeline, Arc<FakeEngine>) {
        let engine = Arc::new(FakeEngine::new(dir, mode));
        let pipeline = Pipeline::new(ScratchDir::new(dir), engine.clone(), 2);
        (pipeline, engine)
    }

    fn upload(name: &str, data: &'static [u8]) -> UploadDescriptor<&'static [u8]> {
        UploadDescriptor {
            original_filename: Some(name.to_string()),
            byte_stream: data,
        }
    }

    fn scratch_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_round_trip_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, engine) = pipeline(dir.path(), FakeMode::Write(4096));

        let response = pipeline.run(upload("song.wav", b"RIFF....WAVE")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(engine.calls(), 1);

        let (input_path, existed) = engine.seen_inputs()[0].clone();
        assert!(existed);
        assert!(!input_path.exists());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), 4096);
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_inference_failure_cleans_input() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, engine) = pipeline(dir.path(), FakeMode::Fail);

        let err = pipeline.run(upload("song.wav", b"RIFF")).await.unwrap_err();
        assert!(matches!(err, AppError::SeparationFailure(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(engine.calls(), 1);
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_missing_output_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _engine) = pipeline(dir.path(), FakeMode::SkipOutput);

        let err = pipeline.run(upload("song.wav", b"RIFF")).await.unwrap_err();
        assert!(matches!(err, AppError::OutputMissing(_)));
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_invalid_upload_never_reaches_engine() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, engine) = pipeline(dir.path(), FakeMode::Write(16));

        let err = pipeline.run(upload("song", b"RIFF")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidFormat(_)));
        assert_eq!(engine.calls(), 0);
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_cancelled_request_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, engine) = pipeline(
            dir.path(),
            FakeMode::SlowWrite {
                size: 512,
                delay_ms: 200,
            },
        );

        let task = tokio::spawn(async move {
            pipeline.run(upload("song.wav", b"RIFF")).await.map(|_| ())
        });
        while engine.calls() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        // 推理进行中客户端断开
        task.abort();

        for _ in 0..100 {
            if scratch_is_empty(dir.path()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(scratch_is_empty(dir.path()));
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, engine) = pipeline(dir.path(), FakeMode::Write(1024));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    let response = pipeline.run(upload("song.wav", b"RIFF")).await.unwrap();
                    axum::body::to_bytes(response.into_body(), usize::MAX)
                        .await
                        .unwrap()
                        .len()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1024);
        }

        let mut inputs: Vec<_> = engine.seen_inputs().into_iter().map(|(p, _)| p).collect();
        inputs.sort();
        inputs.dedup();
        assert_eq!(inputs.len(), 8);
        assert!(scratch_is_empty(dir.path()));
    }
}
