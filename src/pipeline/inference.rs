// 推理适配：调用分离引擎，推导输出路径，清理输入文件

use crate::audio::separator::{SeparationEngine, Stem};
use crate::error::{AppError, AppResult};
use crate::scratch::{OutputName, ScratchDir, ScratchFile, ScratchRole};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// 一次推理调用的描述
#[derive(Debug, Clone)]
pub struct SeparationJob {
    pub input_path: PathBuf,
    pub output: OutputName,
    pub stem: Stem,
}

impl SeparationJob {
    pub fn new(scratch: &ScratchDir, input: &ScratchFile, output_format: &str) -> Self {
        Self {
            input_path: input.path().to_path_buf(),
            output: scratch.output_name(input.path(), output_format),
            stem: Stem::Vocals,
        }
    }

    /// 传给引擎的 {stem -> basename}
    pub fn output_names(&self) -> HashMap<String, String> {
        HashMap::from([(self.stem.as_str().to_string(), self.output.basename.clone())])
    }
}

/// 执行人声分离（阻塞调用，每个请求只调用一次，不重试）
///
/// 无论推理成功与否，输入文件都会在返回前删除。
pub fn separate(
    engine: &dyn SeparationEngine,
    scratch: &ScratchDir,
    input: ScratchFile,
) -> AppResult<ScratchFile> {
    let job = SeparationJob::new(scratch, &input, engine.output_format());
    info!(
        "[INFERENCE] 开始人声分离: {:?} -> {:?}",
        job.input_path, job.output.path
    );

    // 调用引擎前就持有输出路径：引擎写出的任何文件都有所有者，panic 时也会被删除
    let output = ScratchFile::new(job.output.path.clone(), ScratchRole::Output);
    let result = engine.separate(&job.input_path, &job.output_names());

    // 输入文件在推理结束后立即释放，删除失败只记录警告
    input.remove();

    match result {
        Ok(()) => {
            info!("[INFERENCE] 分离完成: {:?}", output.path());
            Ok(output)
        }
        Err(e) => {
            error!("[INFERENCE] 分离失败 {:?}: {}", job.input_path, e);
            // 引擎失败前可能已写出部分输出
            if output.path().exists() {
                warn!("[INFERENCE] 清理失败推理留下的输出: {:?}", output.path());
                output.remove();
            } else {
                output.disown();
            }
            Err(AppError::SeparationFailure(e))
        }
    }
}
