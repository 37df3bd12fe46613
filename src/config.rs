// 配置管理模块

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const API_KEY_ENV: &str = "VOCALSEP_API_KEY";
const SCRATCH_DIR_ENV: &str = "VOCALSEP_SCRATCH_DIR";
const PORT_ENV: &str = "VOCALSEP_PORT";
const WORKERS_ENV: &str = "VOCALSEP_WORKERS_PER_DEVICE";
const ACCELERATOR_ENV: &str = "VOCALSEP_ACCELERATOR";
const LOG_DIR_ENV: &str = "VOCALSEP_LOG_DIR";

/// 加速器选择
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorMode {
    /// 自动探测：CUDA > MPS > CPU
    Auto,
    /// NVIDIA GPU
    Cuda,
    /// Apple Silicon GPU
    Mps,
    /// 仅使用 CPU
    Cpu,
}

impl Default for AcceleratorMode {
    fn default() -> Self {
        Self::Auto
    }
}

impl AcceleratorMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "cuda" | "gpu" => Some(Self::Cuda),
            "mps" => Some(Self::Mps),
            "cpu" => Some(Self::Cpu),
            _ => None,
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    /// 转换为 tracing 过滤器字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// 人声分离配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparationConfig {
    /// 模型文件名
    #[serde(default = "default_model_filename")]
    pub model_filename: String,
    /// 输出格式（同时决定输出文件扩展名）
    #[serde(default = "default_output_format")]
    pub output_format: String,
    /// 模型缓存目录，未设置时使用默认数据目录
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
    /// audio-separator 可执行文件路径，未设置时自动查找
    #[serde(default)]
    pub separator_path: Option<PathBuf>,
}

fn default_model_filename() -> String {
    "model_bs_roformer_ep_368_sdr_12.9628.ckpt".to_string()
}

fn default_output_format() -> String {
    "mp3".to_string()
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            model_filename: default_model_filename(),
            output_format: default_output_format(),
            model_dir: None,
            separator_path: None,
        }
    }
}

/// 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 共享 API Key，为空时不启用鉴权
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// 临时文件目录
    pub scratch_dir: PathBuf,
    /// 每个设备的工作槽位数
    pub workers_per_device: usize,
    /// 加速器选择
    pub accelerator: AcceleratorMode,
    /// 整个请求的超时时间（秒），0 表示不限制
    pub request_timeout_secs: u64,
    /// 上传文件大小上限 (MB)
    pub max_upload_mb: usize,
    /// 人声分离配置
    pub separation: SeparationConfig,
    /// 日志目录
    pub log_dir: Option<PathBuf>,
    /// 日志级别
    pub log_level: LogLevel,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_key: None,
            scratch_dir: std::env::temp_dir(),
            workers_per_device: 2,
            accelerator: AcceleratorMode::default(),
            request_timeout_secs: 1000,
            max_upload_mb: 512,
            separation: SeparationConfig::default(),
            log_dir: None,
            log_level: LogLevel::default(),
        }
    }
}

impl ServerConfig {
    /// 启动日志用的配置摘要：JSON 形式，api_key 不参与序列化
    pub fn summary(&self) -> String {
        let json = serde_json::to_string(self)
            .unwrap_or_else(|e| format!("<配置序列化失败: {}>", e));
        format!("{} auth={}", json, self.api_key.is_some())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    /// 日志目录：配置 > 数据目录 > 临时目录
    pub fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("vocalsep")
                .join("logs")
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> AppResult<()> {
        if let Some(key) = lookup(API_KEY_ENV) {
            self.api_key = Some(key);
        }
        if let Some(dir) = lookup(SCRATCH_DIR_ENV) {
            self.scratch_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup(PORT_ENV) {
            self.port = port
                .parse()
                .map_err(|_| AppError::Config(format!("{} 不是有效端口: {}", PORT_ENV, port)))?;
        }
        if let Some(workers) = lookup(WORKERS_ENV) {
            self.workers_per_device = workers.parse().map_err(|_| {
                AppError::Config(format!("{} 不是有效数字: {}", WORKERS_ENV, workers))
            })?;
        }
        if let Some(mode) = lookup(ACCELERATOR_ENV) {
            self.accelerator = AcceleratorMode::parse(&mode).ok_or_else(|| {
                AppError::Config(format!("未知的加速器: {}", mode))
            })?;
        }
        if let Some(dir) = lookup(LOG_DIR_ENV) {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup(crate::models::MODELS_DIR_ENV) {
            self.separation.model_dir = Some(PathBuf::from(dir));
        }
        // 空字符串视为未设置
        if self.api_key.as_deref().map_or(false, |k| k.is_empty()) {
            self.api_key = None;
        }
        Ok(())
    }

    fn validate(&self) -> AppResult<()> {
        if self.workers_per_device == 0 {
            return Err(AppError::Config("workers_per_device 必须大于 0".to_string()));
        }
        if self.separation.output_format.trim().is_empty() {
            return Err(AppError::Config("output_format 不能为空".to_string()));
        }
        Ok(())
    }
}

/// 读取配置文件，解析失败时回退到默认配置
fn read_config_file(config_path: &Path) -> AppResult<ServerConfig> {
    if !config_path.exists() {
        eprintln!("配置文件不存在，使用默认配置: {:?}", config_path);
        return Ok(ServerConfig::default());
    }

    let content = fs::read_to_string(config_path)?;
    Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
        // 此时日志系统尚未初始化
        eprintln!("配置文件 JSON 解析失败: {}，使用默认配置", e);
        ServerConfig::default()
    }))
}

/// 加载配置：默认值 -> 配置文件 -> 环境变量
///
/// 配置文件路径来自命令行 `--config`（或 `VOCALSEP_CONFIG`）。
pub fn load_config(config_path: Option<&Path>) -> AppResult<ServerConfig> {
    let mut config = match config_path {
        Some(p) => read_config_file(p)?,
        None => ServerConfig::default(),
    };

    config.apply_env(|name| std::env::var(name).ok())?;
    config.validate()?;

    Ok(config)
}
