// 上传文件落盘

use crate::error::{AppError, AppResult};
use crate::scratch::{ScratchDir, ScratchFile, ScratchRole};
use std::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{error, info};

/// 单次请求的上传内容
pub struct UploadDescriptor<R> {
    pub original_filename: Option<String>,
    pub byte_stream: R,
}

/// 从原始文件名解析出的基础名和扩展名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub base_name: String,
    pub extension: String,
}

/// 解析上传文件名
///
/// 按 `.` 切分，第一段为基础名，最后一段为扩展名；少于两段视为无效格式。
/// 客户端可能带上目录，只取最后一级。
pub fn parse_filename(original: Option<&str>) -> AppResult<ParsedFilename> {
    let original = original
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(AppError::MissingFilename)?;

    let name = original
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(original);
    let segments: Vec<&str> = name.split('.').collect();
    if segments.len() < 2 {
        return Err(AppError::InvalidFormat(original.to_string()));
    }

    let extension = segments[segments.len() - 1];
    if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidFormat(original.to_string()));
    }

    let base_name: String = segments[0]
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let base_name = if base_name.is_empty() {
        "upload".to_string()
    } else {
        base_name
    };

    Ok(ParsedFilename {
        base_name,
        extension: extension.to_ascii_lowercase(),
    })
}

/// 把上传内容完整写入临时目录中唯一命名的文件
///
/// 失败时删除已写入的部分文件，不会把残缺文件交给下游。
pub async fn materialize<R>(
    scratch: &ScratchDir,
    upload: UploadDescriptor<R>,
) -> AppResult<ScratchFile>
where
    R: AsyncRead + Unpin,
{
    let parsed = parse_filename(upload.original_filename.as_deref())?;
    let path = scratch.input_path(&parsed.base_name, &parsed.extension);

    // create_new：即使出现不可能的重名也只会报错，不会覆盖别人的文件
    // 同步创建：文件出现和被 ScratchFile 接管之间没有 await，请求被取消时不会遗留
    let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => file,
        Err(source) => {
            error!("[INGRESS] 创建临时文件失败 {:?}: {}", path, source);
            return Err(AppError::StorageWriteFailure { path, source });
        }
    };
    let input = ScratchFile::new(path, ScratchRole::Input);
    let mut file = tokio::fs::File::from_std(file);

    let mut reader = upload.byte_stream;
    let copied = match tokio::io::copy(&mut reader, &mut file).await {
        Ok(bytes) => file.flush().await.map(|_| bytes),
        Err(e) => Err(e),
    };
    drop(file);

    match copied {
        Ok(bytes) => {
            info!("[INGRESS] 文件已保存: {:?} ({} bytes)", input.path(), bytes);
            Ok(input)
        }
        Err(source) => {
            let path = input.path().to_path_buf();
            error!("[INGRESS] 写入上传文件失败 {:?}: {}", path, source);
            input.remove();
            Err(AppError::StorageWriteFailure { path, source })
        }
    }
}
