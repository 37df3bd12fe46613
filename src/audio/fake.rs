// 测试用分离引擎：写出固定大小的输出文件，或按需失败
// 另有一个 sh 脚本版的 audio-separator，用来驱动真实的子进程路径

use super::separator::{AudioSeparator, EngineError, SeparationEngine};
use crate::config::SeparationConfig;
use crate::device::{Accelerator, AcceleratorKind};
use crate::scratch::engine_output_path;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMode {
    /// 按命名约定写出指定字节数的文件
    Write(usize),
    /// 等待一段时间后写出文件（模拟耗时推理）
    SlowWrite { size: usize, delay_ms: u64 },
    /// 返回引擎错误，不写文件
    Fail,
    /// 声称成功但不写文件
    SkipOutput,
    /// 写出文件后 panic
    PanicAfterWrite(usize),
}

#[derive(Debug)]
pub struct FakeEngine {
    output_dir: PathBuf,
    output_format: String,
    mode: FakeMode,
    calls: AtomicUsize,
    seen_inputs: Mutex<Vec<(PathBuf, bool)>>,
}

impl FakeEngine {
    pub fn new(output_dir: &Path, mode: FakeMode) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            output_format: "mp3".to_string(),
            mode,
            calls: AtomicUsize::new(0),
            seen_inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn write_outputs(
        &self,
        output_names: &HashMap<String, String>,
        size: usize,
    ) -> Result<(), EngineError> {
        for basename in output_names.values() {
            let path = engine_output_path(&self.output_dir, basename, &self.output_format);
            std::fs::write(path, vec![0x5a; size])?;
        }
        Ok(())
    }

    /// 每次调用时的输入路径以及当时文件是否存在
    pub fn seen_inputs(&self) -> Vec<(PathBuf, bool)> {
        self.seen_inputs.lock().unwrap().clone()
    }
}

impl SeparationEngine for FakeEngine {
    fn separate(
        &self,
        input_path: &Path,
        output_names: &HashMap<String, String>,
    ) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_inputs
            .lock()
            .unwrap()
            .push((input_path.to_path_buf(), input_path.exists()));

        match self.mode {
            FakeMode::Write(size) => self.write_outputs(output_names, size),
            FakeMode::SlowWrite { size, delay_ms } => {
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                self.write_outputs(output_names, size)
            }
            FakeMode::Fail => Err(EngineError::Failed("corrupt audio".to_string())),
            FakeMode::SkipOutput => Ok(()),
            FakeMode::PanicAfterWrite(size) => {
                self.write_outputs(output_names, size)?;
                panic!("engine crashed");
            }
        }
    }

    fn output_format(&self) -> &str {
        &self.output_format
    }
}

/// 解析 audio-separator 参数，按 --custom_output_names 写出人声文件
pub const WRITE_VOCALS_SH: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    --output_dir) out_dir="$2"; shift ;;
    --output_format) fmt="$2"; shift ;;
    --custom_output_names) names="$2"; shift ;;
  esac
  shift
done
name=$(printf '%s' "$names" | sed 's/.*:"\([^"]*\)".*/\1/')
printf 'vocals' > "$out_dir/$name.$fmt"
"#;

/// 在 `dir` 下写一个可执行的 sh 脚本充当 audio-separator
#[cfg(unix)]
pub fn write_fake_cli(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("audio-separator");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// 使用脚本作为可执行文件的 AudioSeparator
pub fn cli_engine(script: &Path, output_dir: &Path, kind: AcceleratorKind) -> AudioSeparator {
    let config = SeparationConfig {
        separator_path: Some(script.to_path_buf()),
        ..SeparationConfig::default()
    };
    AudioSeparator::new(
        &config,
        output_dir.join("models"),
        output_dir.to_path_buf(),
        Accelerator::new(kind, 1),
    )
}
