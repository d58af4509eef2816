use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use tracing::warn;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("running on CPU, to run on GPU(metal) build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("running on CPU, to run on GPU build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into interleaved RGB bytes.
pub fn tensor_to_rgb(img: &Tensor) -> Result<(usize, usize, Vec<u8>)> {
    let (channels, height, width) = img.dims3()?;
    if channels != crate::CHANNELS {
        anyhow::bail!("tensor_to_rgb expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    Ok((width, height, img.to_vec1::<u8>()?))
}
