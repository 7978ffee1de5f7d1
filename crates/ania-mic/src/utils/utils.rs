use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;

use crate::error::AniaError;

/// A concrete execution device together with how it was obtained.
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    pub device: Device,
    /// The device string the caller asked for.
    pub requested: String,
    /// True when the requested accelerator could not be used as-is.
    pub fell_back: bool,
}

impl ResolvedDevice {
    pub fn label(&self) -> String {
        match &self.device {
            Device::Cpu => "cpu".to_string(),
            Device::Cuda(_) => "cuda".to_string(),
            Device::Metal(_) => "metal".to_string(),
        }
    }

    pub fn is_accelerated(&self) -> bool {
        !self.device.is_cpu()
    }
}

/// Resolves a device string to a Candle device, falling back instead of failing.
///
/// # Supported Device Strings
///
/// - `"cpu"`: the CPU device
/// - `"cuda"` / `"cuda:N"`: CUDA device N (default 0)
/// - `"metal"` / `"metal:N"`: Metal device N (default 0)
///
/// An accelerator index that cannot be opened falls back to index 0, and an
/// absent accelerator falls back to the CPU. Both cases are logged as
/// warnings and flagged through `ResolvedDevice::fell_back`.
///
/// # Errors
///
/// Returns `AniaError::UnsupportedDevice` for any other device string.
pub fn resolve_execution_device(requested: &str) -> Result<ResolvedDevice> {
    let normalized = requested.trim().to_lowercase();
    let (kind, index) = parse_device_string(&normalized)?;

    let resolved = |device: Device, fell_back: bool| ResolvedDevice {
        device,
        requested: requested.to_string(),
        fell_back,
    };

    let available = match kind {
        "cpu" => return Ok(resolved(Device::Cpu, false)),
        "cuda" => cuda_is_available(),
        _ => metal_is_available(),
    };

    if !available {
        log::warn!(
            "{}. Falling back to CPU.",
            AniaError::AcceleratorUnavailable(requested.to_string())
        );
        return Ok(resolved(Device::Cpu, true));
    }

    let open = |idx: usize| -> candle_core::Result<Device> {
        if kind == "cuda" {
            Device::new_cuda(idx)
        } else {
            Device::new_metal(idx)
        }
    };

    match open(index) {
        Ok(device) => Ok(resolved(device, false)),
        Err(e) if index != 0 => {
            log::warn!(
                "Could not open {}:{} ({}). Falling back to {}:0.",
                kind,
                index,
                e,
                kind
            );
            match open(0) {
                Ok(device) => Ok(resolved(device, true)),
                Err(e) => {
                    log::warn!("Could not open {}:0 ({}). Falling back to CPU.", kind, e);
                    Ok(resolved(Device::Cpu, true))
                }
            }
        }
        Err(e) => {
            log::warn!("Could not open {}:0 ({}). Falling back to CPU.", kind, e);
            Ok(resolved(Device::Cpu, true))
        }
    }
}

fn parse_device_string(device_str: &str) -> Result<(&'static str, usize)> {
    let (kind, index) = match device_str.split_once(':') {
        Some((kind, idx)) => {
            let index = idx
                .parse::<usize>()
                .map_err(|_| AniaError::UnsupportedDevice(device_str.to_string()))?;
            (kind, index)
        }
        None => (device_str, 0),
    };

    let kind = match kind {
        "cpu" => "cpu",
        "cuda" | "gpu" => "cuda",
        "metal" | "mps" => "metal",
        _ => return Err(AniaError::UnsupportedDevice(device_str.to_string()).into()),
    };
    Ok((kind, index))
}
