// 临时文件管理模块
//
// 所有请求共享同一个临时目录且不加锁，路径互不冲突完全依赖命名：
// 时间戳 + 随机 token。每个 ScratchFile 只有一个所有者，
// 所有者释放时（显式 remove 或 Drop）删除文件，且只删除一次。

use crate::error::AppError;
use crate::utils::generate_token;
use chrono::{DateTime, Local};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 输出文件名后缀
pub const VOCALS_SUFFIX: &str = "_vocals";

/// 临时文件角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchRole {
    Input,
    Output,
}

impl fmt::Display for ScratchRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScratchRole::Input => f.write_str("input"),
            ScratchRole::Output => f.write_str("output"),
        }
    }
}

/// 分离引擎写出文件的命名约定：`<output_dir>/<basename>.<format>`
///
/// 推理适配器和响应阶段都通过这个函数定位输出文件，不要在别处拼接。
pub fn engine_output_path(output_dir: &Path, basename: &str, output_format: &str) -> PathBuf {
    output_dir.join(format!("{}.{}", basename, output_format))
}

/// 共享临时目录句柄
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

/// 推理输出的名称：传给引擎的 basename 和引擎最终写出的路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputName {
    pub basename: String,
    pub path: PathBuf,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 创建目录（已存在则直接使用）
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = Self::new(root);
        fs::create_dir_all(&dir.root)?;
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// 上传文件路径：`<base>_<YYYYmmdd_HHMMSS>_<token>.<ext>`
    pub fn input_path(&self, base_name: &str, extension: &str) -> PathBuf {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        self.root.join(format!(
            "{}_{}_{}.{}",
            base_name,
            timestamp,
            generate_token(),
            extension
        ))
    }

    /// 输出名称：输入文件 stem + 新 token + `_vocals`，扩展名由引擎输出格式决定
    ///
    /// 使用新的 token，保证输出永远不会与任何输入文件重名。
    pub fn output_name(&self, input_path: &Path, output_format: &str) -> OutputName {
        let stem = input_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let basename = format!("{}_{}{}", stem, generate_token(), VOCALS_SUFFIX);
        let path = engine_output_path(&self.root, &basename, output_format);
        OutputName { basename, path }
    }
}

/// 请求期间产生的临时文件，所有者释放时删除
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    role: ScratchRole,
    created_at: DateTime<Local>,
    armed: bool,
}

impl ScratchFile {
    pub fn new(path: PathBuf, role: ScratchRole) -> Self {
        Self {
            path,
            role,
            created_at: Local::now(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> ScratchRole {
        self.role
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    /// 立即删除文件。失败只记录警告，不向上传播
    pub fn remove(mut self) {
        self.armed = false;
        remove_scratch_path(&self.path, self.role);
    }

    /// 放弃所有权且不删除文件（文件根本不存在时使用）
    pub fn disown(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            debug!("[SCRATCH] 所有者释放，清理{}文件: {:?}", self.role, self.path);
            remove_scratch_path(&self.path, self.role);
        }
    }
}

fn remove_scratch_path(path: &Path, role: ScratchRole) {
    match fs::remove_file(path) {
        Ok(()) => info!("[SCRATCH] 已清理{}文件: {:?}", role, path),
        Err(source) => {
            let err = AppError::CleanupFailure {
                path: path.to_path_buf(),
                source,
            };
            warn!("[SCRATCH] {}", err);
        }
    }
}
