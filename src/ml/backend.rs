//! バックエンドとデバイスの選択

use burn::backend::Wgpu;
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;

use crate::config::DeviceType;

/// GPU (WGPU) 推論用
pub type GpuBackend = Wgpu;
/// CPU (NdArray) 推論用
pub type CpuBackend = NdArray;
/// GPU (WGPU) 学習用
pub type GpuTrainBackend = Autodiff<Wgpu>;
/// CPU (NdArray) 学習用
pub type CpuTrainBackend = Autodiff<NdArray>;

pub fn gpu_device() -> WgpuDevice {
    WgpuDevice::default()
}

pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// 使用するデバイスをログに出す
pub fn log_device(device_type: DeviceType) {
    match device_type {
        DeviceType::Wgpu => tracing::info!("使用デバイス: {} ({:?})", device_type, gpu_device()),
        DeviceType::Cpu => tracing::info!("使用デバイス: {} ({:?})", device_type, cpu_device()),
    }
}
