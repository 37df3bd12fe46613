// 人声分离引擎 - 使用 audio-separator
//
// 引擎对服务来说是黑盒：给定输入路径和 {stem -> basename}，
// 在输出目录写出 `<basename>.<output_format>`。

use crate::config::SeparationConfig;
use crate::device::Accelerator;
use crate::utils::{get_exe_dir, hidden_command};
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// 保留的 stderr 尾部行数，用于失败时的错误信息
const STDERR_TAIL_LINES: usize = 40;

/// 错误信息最大字符数
const ERROR_MESSAGE_LIMIT: usize = 500;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("启动 audio-separator 失败: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("audio-separator 处理失败: {0}")]
    Failed(String),

    #[error("输出名称序列化失败: {0}")]
    OutputNames(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 分离输出轨道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stem {
    Vocals,
}

impl Stem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stem::Vocals => "Vocals",
        }
    }
}

/// 分离引擎接口
///
/// 实现需要支持多个工作线程并发调用（每个线程同一时刻只有一次调用）。
pub trait SeparationEngine: Send + Sync {
    /// 对 `input_path` 执行分离，按 `output_names` 的 basename 写出各轨道
    fn separate(
        &self,
        input_path: &Path,
        output_names: &HashMap<String, String>,
    ) -> Result<(), EngineError>;

    /// 输出格式，同时是输出文件扩展名
    fn output_format(&self) -> &str;
}

/// 基于 audio-separator 命令行的分离引擎
#[derive(Debug, Clone)]
pub struct AudioSeparator {
    executable: String,
    model_filename: String,
    model_dir: PathBuf,
    output_dir: PathBuf,
    output_format: String,
    accelerator: Accelerator,
}

impl AudioSeparator {
    /// 创建引擎。输出目录固定为共享临时目录，只输出人声轨道
    pub fn new(
        config: &SeparationConfig,
        model_dir: PathBuf,
        output_dir: PathBuf,
        accelerator: Accelerator,
    ) -> Self {
        let executable = resolve_separator_path(config.separator_path.as_deref());
        info!("audio-separator 路径: {}", executable);
        info!(
            "模型: {}, 输出格式: {}, 加速器: {}, autocast={}",
            config.model_filename,
            config.output_format,
            accelerator,
            accelerator.is_cuda()
        );

        Self {
            executable,
            model_filename: config.model_filename.clone(),
            model_dir,
            output_dir,
            output_format: config.output_format.clone(),
            accelerator,
        }
    }

    /// 启动时加载（下载并校验）模型，只调用一次
    pub fn load(&self) -> Result<(), EngineError> {
        info!("正在准备模型: {}", self.model_filename);
        let mut args = self.common_args();
        args.push("--download_model_only".to_string());
        self.run(&args)?;
        info!("模型已就绪: {} ({})", self.model_filename, self.accelerator);
        Ok(())
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "--model_filename".to_string(),
            self.model_filename.clone(),
            "--model_file_dir".to_string(),
            self.model_dir.to_string_lossy().to_string(),
        ]
    }

    fn separate_args(
        &self,
        input_path: &Path,
        output_names: &HashMap<String, String>,
    ) -> Result<Vec<String>, EngineError> {
        let mut args = vec![input_path.to_string_lossy().to_string()];
        args.extend(self.common_args());
        args.extend([
            "--output_dir".to_string(),
            self.output_dir.to_string_lossy().to_string(),
            "--output_format".to_string(),
            self.output_format.clone(),
            "--single_stem".to_string(),
            Stem::Vocals.as_str().to_string(),
            "--custom_output_names".to_string(),
            serde_json::to_string(output_names)?,
        ]);

        if self.accelerator.is_cuda() {
            args.push("--use_autocast".to_string());
        }

        Ok(args)
    }

    fn run(&self, args: &[String]) -> Result<(), EngineError> {
        debug!("audio-separator 命令: {} {}", self.executable, args.join(" "));

        let mut cmd = hidden_command(&self.executable);
        cmd.args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        // CUDA_VISIBLE_DEVICES="-1" 才能真正禁用 GPU，空字符串无效
        if self.accelerator.is_cpu() {
            cmd.env("CUDA_VISIBLE_DEVICES", "-1");
        }

        let child = cmd.spawn().map_err(|e| {
            error!("启动 audio-separator 失败: {}", e);
            EngineError::Spawn(e)
        })?;
        let mut child = ChildGuard::new(child);

        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        if let Some(stderr) = child.stderr() {
            // 进程退出时 stderr 关闭，读取自然结束
            for line in BufReader::new(stderr).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!("读取 audio-separator 输出失败: {}", e);
                        break;
                    }
                };
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if let Some(progress) = parse_progress(line) {
                    debug!("分离进度: {:.1}%", progress * 100.0);
                } else {
                    debug!("audio-separator stderr: {}", line);
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            }
        }

        let status = child.wait()?;
        if !status.success() {
            let output = tail.into_iter().collect::<Vec<_>>().join("\n");
            error!("audio-separator 退出码: {:?}", status.code());
            error!("audio-separator 错误输出: {}", output);
            let message = if output.is_empty() {
                format!("退出码 {:?}（无详细错误信息）", status.code())
            } else {
                last_chars(&output, ERROR_MESSAGE_LIMIT)
            };
            return Err(EngineError::Failed(message));
        }

        Ok(())
    }
}

/// 子进程守卫：未正常等待结束就被丢弃时（提前返回或 panic）杀掉子进程，
/// 保证调用返回后引擎不会再往临时目录写文件
struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    fn stderr(&mut self) -> Option<std::process::ChildStderr> {
        self.child.as_mut().and_then(|c| c.stderr.take())
    }

    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let mut child = match self.child.take() {
            Some(child) => child,
            None => return Err(std::io::Error::new(std::io::ErrorKind::Other, "子进程已回收")),
        };
        match child.wait() {
            Ok(status) => Ok(status),
            Err(e) => {
                self.child = Some(child);
                Err(e)
            }
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("audio-separator 未正常结束，终止子进程 (pid {})", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl SeparationEngine for AudioSeparator {
    fn separate(
        &self,
        input_path: &Path,
        output_names: &HashMap<String, String>,
    ) -> Result<(), EngineError> {
        let args = self.separate_args(input_path, output_names)?;
        self.run(&args)
    }

    fn output_format(&self) -> &str {
        &self.output_format
    }
}

/// 保留末尾 `limit` 个字符（错误原因通常在最后）
fn last_chars(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(limit)).collect()
}

/// 解析进度输出（尽力而为，解析不了就返回 None）
fn parse_progress(line: &str) -> Option<f32> {
    // 进度输出格式类似: "100%|██████████| 100/100 [00:10<00:00, 10.00it/s]"
    let pos = line.find('%')?;
    let head = &line[..pos];
    // 按字符回溯，切片位置总在字符边界上
    let start = head
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    head[start..].parse::<f32>().ok().map(|percent| percent / 100.0)
}

/// 解析 audio-separator 路径
/// 配置优先，其次是可执行文件旁的打包版本，最后使用系统 PATH
fn resolve_separator_path(configured: Option<&Path>) -> String {
    if let Some(path) = configured.filter(|p| !p.as_os_str().is_empty()) {
        return path.to_string_lossy().to_string();
    }

    let binary = format!("audio-separator{}", std::env::consts::EXE_SUFFIX);
    if let Some(exe_dir) = get_exe_dir() {
        let bundled_path = exe_dir.join("audio-separator").join(&binary);
        if bundled_path.exists() {
            return bundled_path.to_string_lossy().to_string();
        }
    }

    "audio-separator".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AcceleratorKind;

    fn separator(kind: AcceleratorKind) -> AudioSeparator {
        AudioSeparator::new(
            &SeparationConfig::default(),
            PathBuf::from("/models"),
            PathBuf::from("/scratch"),
            Accelerator::new(kind, 1),
        )
    }

    fn vocals_names() -> HashMap<String, String> {
        HashMap::from([(
            Stem::Vocals.as_str().to_string(),
            "song_abc_vocals".to_string(),
        )])
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(
            parse_progress("100%|██████████| 100/100 [00:10<00:00, 10.00it/s]"),
            Some(1.0)
        );
        assert_eq!(parse_progress(" 45%|████▌     | 45/100"), Some(0.45));
        assert_eq!(parse_progress("Loading model"), None);
        assert_eq!(parse_progress("加载进度50%"), Some(0.5));
        assert_eq!(parse_progress("进度%完成"), None);
        assert_eq!(parse_progress("██▌%"), None);
    }

    #[test]
    fn test_separate_args_pin_output() {
        let args = separator(AcceleratorKind::Cpu)
            .separate_args(Path::new("/scratch/song.wav"), &vocals_names())
            .unwrap();

        assert_eq!(args[0], "/scratch/song.wav");
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--output_dir") + 1], "/scratch");
        assert_eq!(args[pos("--output_format") + 1], "mp3");
        assert_eq!(args[pos("--single_stem") + 1], "Vocals");
        assert_eq!(
            args[pos("--custom_output_names") + 1],
            r#"{"Vocals":"song_abc_vocals"}"#
        );
        assert!(!args.contains(&"--use_autocast".to_string()));
    }

    #[test]
    fn test_autocast_only_on_cuda() {
        let cuda = separator(AcceleratorKind::Cuda)
            .separate_args(Path::new("/scratch/song.wav"), &vocals_names())
            .unwrap();
        assert!(cuda.contains(&"--use_autocast".to_string()));

        let mps = separator(AcceleratorKind::Mps)
            .separate_args(Path::new("/scratch/song.wav"), &vocals_names())
            .unwrap();
        assert!(!mps.contains(&"--use_autocast".to_string()));
    }

    #[test]
    fn test_last_chars_keeps_tail() {
        assert_eq!(last_chars("abcdef", 3), "def");
        assert_eq!(last_chars("人声分离", 10), "人声分离");
    }

    #[test]
    fn test_missing_executable_is_spawn_error() {
        let config = SeparationConfig {
            separator_path: Some(PathBuf::from("/nonexistent/audio-separator")),
            ..SeparationConfig::default()
        };
        let engine = AudioSeparator::new(
            &config,
            PathBuf::from("/models"),
            PathBuf::from("/scratch"),
            Accelerator::new(AcceleratorKind::Cpu, 1),
        );
        let err = engine
            .separate(Path::new("/scratch/song.wav"), &vocals_names())
            .unwrap_err();
        assert!(matches!(err, EngineError::Spawn(_)));
    }

    #[cfg(unix)]
    mod cli {
        use super::*;
        use crate::audio::fake::{cli_engine, write_fake_cli, WRITE_VOCALS_SH};

        #[test]
        fn test_nonzero_exit_keeps_stderr_tail() {
            let bin = tempfile::tempdir().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let script = write_fake_cli(
                bin.path(),
                r#"i=0
while [ $i -lt 60 ]; do
  echo "warning line $i: padding padding padding" >&2
  i=$((i+1))
done
echo "RuntimeError: 模型加载失败" >&2
exit 3"#,
            );
            let engine = cli_engine(&script, dir.path(), AcceleratorKind::Cpu);

            let err = engine
                .separate(&dir.path().join("song.wav"), &vocals_names())
                .unwrap_err();
            let message = match err {
                EngineError::Failed(message) => message,
                other => panic!("unexpected error: {:?}", other),
            };
            assert!(message.ends_with("RuntimeError: 模型加载失败"));
            assert!(message.chars().count() <= ERROR_MESSAGE_LIMIT);
            assert!(!message.contains("warning line 0:"));
        }

        #[test]
        fn test_nonzero_exit_without_stderr() {
            let bin = tempfile::tempdir().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let script = write_fake_cli(bin.path(), "exit 2");
            let engine = cli_engine(&script, dir.path(), AcceleratorKind::Cpu);

            let err = engine
                .separate(&dir.path().join("song.wav"), &vocals_names())
                .unwrap_err();
            assert!(matches!(err, EngineError::Failed(ref m) if m.contains("Some(2)")));
        }

        #[test]
        fn test_cpu_hides_cuda_devices() {
            let bin = tempfile::tempdir().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let script = write_fake_cli(
                bin.path(),
                r#"echo "CUDA_VISIBLE_DEVICES=$CUDA_VISIBLE_DEVICES" >&2
exit 1"#,
            );
            let engine = cli_engine(&script, dir.path(), AcceleratorKind::Cpu);

            let err = engine
                .separate(&dir.path().join("song.wav"), &vocals_names())
                .unwrap_err();
            assert!(matches!(err, EngineError::Failed(ref m) if m == "CUDA_VISIBLE_DEVICES=-1"));
        }

        #[test]
        fn test_load_downloads_model_only() {
            let bin = tempfile::tempdir().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let args_file = dir.path().join("args.txt");
            let script = write_fake_cli(
                bin.path(),
                &format!(r#"echo "$@" > "{}""#, args_file.display()),
            );
            let engine = cli_engine(&script, dir.path(), AcceleratorKind::Cpu);

            engine.load().unwrap();

            let args = std::fs::read_to_string(&args_file).unwrap();
            assert!(args.contains("--download_model_only"));
            assert!(args.contains("--model_filename model_bs_roformer_ep_368_sdr_12.9628.ckpt"));
            assert!(!args.contains("--single_stem"));
        }

        #[test]
        fn test_separate_writes_named_output() {
            let bin = tempfile::tempdir().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let script = write_fake_cli(bin.path(), WRITE_VOCALS_SH);
            let engine = cli_engine(&script, dir.path(), AcceleratorKind::Cpu);

            engine
                .separate(&dir.path().join("song.wav"), &vocals_names())
                .unwrap();
            assert!(dir.path().join("song_abc_vocals.mp3").exists());
        }
    }
}
