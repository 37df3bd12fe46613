// 加速器探测
//
// 探测结果在进程生命周期内只计算一次。

use crate::config::AcceleratorMode;
use crate::utils::hidden_command;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

static ACCELERATOR_CACHE: OnceCell<Accelerator> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorKind {
    Cuda,
    Mps,
    Cpu,
}

/// 选定的加速器及设备数量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Accelerator {
    pub kind: AcceleratorKind,
    pub device_count: usize,
}

impl Accelerator {
    pub fn new(kind: AcceleratorKind, device_count: usize) -> Self {
        Self {
            kind,
            device_count: device_count.max(1),
        }
    }

    pub fn cpu() -> Self {
        Self::new(AcceleratorKind::Cpu, 1)
    }

    pub fn is_cuda(&self) -> bool {
        self.kind == AcceleratorKind::Cuda
    }

    pub fn is_cpu(&self) -> bool {
        self.kind == AcceleratorKind::Cpu
    }

    /// 工作槽位总数 = 每设备槽位 × 设备数
    pub fn worker_slots(&self, workers_per_device: usize) -> usize {
        workers_per_device.max(1) * self.device_count
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AcceleratorKind::Cuda => write!(f, "cuda x{}", self.device_count),
            AcceleratorKind::Mps => f.write_str("mps"),
            AcceleratorKind::Cpu => f.write_str("cpu"),
        }
    }
}

/// 选择加速器（使用缓存）
pub fn detect_accelerator(mode: AcceleratorMode) -> Accelerator {
    *ACCELERATOR_CACHE.get_or_init(|| {
        info!("首次检测加速器, 模式: {:?}", mode);
        let accelerator = select_accelerator(mode, count_cuda_devices(), mps_available());
        info!("使用加速器: {}", accelerator);
        accelerator
    })
}

fn select_accelerator(mode: AcceleratorMode, cuda_devices: usize, mps: bool) -> Accelerator {
    match mode {
        AcceleratorMode::Cpu => Accelerator::cpu(),
        AcceleratorMode::Cuda if cuda_devices > 0 => {
            Accelerator::new(AcceleratorKind::Cuda, cuda_devices)
        }
        AcceleratorMode::Cuda => {
            warn!("配置要求 CUDA，但未检测到 NVIDIA GPU，回退到 CPU");
            Accelerator::cpu()
        }
        AcceleratorMode::Mps if mps => Accelerator::new(AcceleratorKind::Mps, 1),
        AcceleratorMode::Mps => {
            warn!("配置要求 MPS，但当前平台不支持，回退到 CPU");
            Accelerator::cpu()
        }
        AcceleratorMode::Auto => {
            if cuda_devices > 0 {
                Accelerator::new(AcceleratorKind::Cuda, cuda_devices)
            } else if mps {
                Accelerator::new(AcceleratorKind::Mps, 1)
            } else {
                Accelerator::cpu()
            }
        }
    }
}

/// 通过 nvidia-smi 统计 NVIDIA GPU 数量
fn count_cuda_devices() -> usize {
    match hidden_command("nvidia-smi").arg("--list-gpus").output() {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let count = count_listed_gpus(&stdout);
            info!("nvidia-smi 检测到 {} 个 GPU", count);
            count
        }
        Ok(output) => {
            info!("nvidia-smi 返回失败: {:?}", output.status.code());
            0
        }
        Err(e) => {
            info!("未找到 nvidia-smi: {}", e);
            0
        }
    }
}

fn count_listed_gpus(stdout: &str) -> usize {
    stdout
        .lines()
        .filter(|line| line.trim_start().starts_with("GPU "))
        .count()
}

fn mps_available() -> bool {
    cfg!(all(target_os = "macos", target_arch = "aarch64"))
}
