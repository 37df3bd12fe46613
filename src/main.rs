// vocalsep - 人声分离 HTTP 服务
// 主入口文件

mod audio;
mod auth;
mod config;
mod device;
mod error;
mod logging;
mod models;
mod pipeline;
mod routes;
mod scratch;
mod utils;

use audio::separator::AudioSeparator;
use clap::Parser;
use error::{AppError, AppResult};
use pipeline::Pipeline;
use routes::system::ServiceInfo;
use routes::AppState;
use scratch::ScratchDir;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "vocalsep", about = "人声分离 HTTP 服务", version)]
struct Cli {
    /// JSON 配置文件路径
    #[arg(short, long, env = "VOCALSEP_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("服务启动失败: {}", e);
        eprintln!("服务启动失败: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    let config = config::load_config(cli.config.as_deref())?;

    // guard 必须保持存活，否则异步日志线程会退出
    let _log_guard = logging::init_logging(&config.resolved_log_dir(), &config.log_level);

    info!("vocalsep {} 启动中...", env!("CARGO_PKG_VERSION"));
    info!("[CONFIG] {}", config.summary());

    let scratch = ScratchDir::open(&config.scratch_dir)?;
    info!("临时目录: {:?}", scratch.path());

    let accelerator = device::detect_accelerator(config.accelerator);

    let model_dir = models::ensure_models_cache_dir(&config.separation)?;
    info!("模型目录: {:?}", model_dir);
    if !models::is_model_cached(&config.separation) {
        info!("模型尚未缓存，首次启动需要下载: {}", config.separation.model_filename);
    }

    let engine = AudioSeparator::new(
        &config.separation,
        model_dir,
        scratch.path().to_path_buf(),
        accelerator,
    );

    // 模型只在启动时加载一次
    let loader = engine.clone();
    tokio::task::spawn_blocking(move || loader.load())
        .await
        .map_err(|e| AppError::Worker(format!("模型加载任务异常: {}", e)))?
        .map_err(AppError::ModelLoad)?;

    let worker_slots = accelerator.worker_slots(config.workers_per_device);
    let pipeline = Pipeline::new(scratch, Arc::new(engine), worker_slots);
    info!(
        "工作槽位: {} ({} x {} 设备)",
        worker_slots, config.workers_per_device, accelerator.device_count
    );

    let info = ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        accelerator,
        workers_per_device: config.workers_per_device,
        worker_slots,
        model_filename: config.separation.model_filename.clone(),
        output_format: pipeline.output_format().to_string(),
    };

    let request_timeout = match config.request_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let state = AppState {
        pipeline,
        api_key: config.api_key.as_deref().map(Arc::from),
        request_timeout,
        info: Arc::new(info),
    };
    let app = routes::build_router(state, config.max_upload_bytes());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP 服务已启动: http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("监听 Ctrl-C 失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("监听 SIGTERM 失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("收到停止信号，等待进行中的请求完成...");
}
