use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::DeviceMap;

/// Latent channels of the flux autoencoder.
const LATENT_CHANNELS: usize = 16;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Standard-normal latent noise for a `height`x`width` image, fully
/// determined by `seed` on every device.
///
/// Device RNGs cannot be seeded on CPU, so the noise is drawn on the host.
pub fn seeded_noise(seed: u64, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let height = height.div_ceil(16) * 2;
    let width = width.div_ceil(16) * 2;
    let len = LATENT_CHANNELS * height * width;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(len);
    while values.len() < len {
        // Box-Muller; u1 in (0, 1] keeps ln finite.
        let u1: f32 = 1.0 - rng.random::<f32>();
        let u2: f32 = rng.random::<f32>();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        values.push(radius * angle.cos());
        values.push(radius * angle.sin());
    }
    values.truncate(len);

    Ok(Tensor::from_vec(
        values,
        (1, LATENT_CHANNELS, height, width),
        device,
    )?)
}
