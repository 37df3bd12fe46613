// 模型目录管理

use crate::config::SeparationConfig;
use std::fs;
use std::path::PathBuf;

pub const MODELS_DIR_ENV: &str = "VOCALSEP_MODELS_DIR";

/// 获取模型缓存目录
/// 优先使用配置（已合并环境变量 VOCALSEP_MODELS_DIR），否则回退到本地数据目录
pub fn get_models_cache_dir(config: &SeparationConfig) -> PathBuf {
    if let Some(dir) = config.model_dir.as_ref().filter(|d| !d.as_os_str().is_empty()) {
        return dir.clone();
    }
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vocalsep")
        .join("models")
}

pub fn ensure_models_cache_dir(config: &SeparationConfig) -> std::io::Result<PathBuf> {
    let dir = get_models_cache_dir(config);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// 模型文件是否已在缓存目录中
pub fn is_model_cached(config: &SeparationConfig) -> bool {
    get_models_cache_dir(config)
        .join(&config.model_filename)
        .exists()
}
