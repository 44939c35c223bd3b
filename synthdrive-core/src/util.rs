use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::RgbImage;
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
                warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<RgbImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("error converting tensor to image buffer"))
}

/// Converts an RGB image into a (3, height, width) tensor scaled to [0, 1].
pub fn image_to_tensor(img: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = img.dimensions();
    let data = Tensor::from_vec(
        img.as_raw().clone(),
        (height as usize, width as usize, 3),
        device,
    )?
    .permute((2, 0, 1))?;
    Ok((data.to_dtype(DType::F32)? / 255.)?.to_dtype(dtype)?)
}

/// Maps decoded VAE output in [-1, 1] with shape (batch, 3, h, w) to u8 images.
pub fn decoded_to_images(decoded: &Tensor) -> Result<Vec<RgbImage>> {
    let images = ((decoded.to_device(&Device::Cpu)?.to_dtype(DType::F32)? / 2.)? + 0.5)?
        .clamp(0f32, 1f32)?;
    let images = (images * 255.)?.round()?.to_dtype(DType::U8)?;
    let batch = images.dim(0)?;
    (0..batch)
        .map(|idx| tensor_to_image(&images.get(idx)?))
        .collect()
}

/// Rounds a pixel extent down to the latent grid (multiple of 8, at least 64).
pub fn latent_aligned(extent: u32) -> usize {
    ((extent as usize) / 8 * 8).max(64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn image_tensor_round_trip_keeps_layout() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(3, 1, image::Rgb([255, 0, 51]));
        let t = image_to_tensor(&img, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(t.dims(), &[3, 2, 4]);

        let back = (t * 255.).unwrap().round().unwrap().to_dtype(DType::U8).unwrap();
        let back = tensor_to_image(&back).unwrap();
        assert_eq!(back, img);
    }

    #[test]
    fn decoded_range_maps_to_bytes() {
        let decoded = Tensor::from_vec(
            vec![-1f32, 0., 1., 2., -1., 0., 1., 2., -1., 0., 1., 2.],
            (1, 3, 2, 2),
            &Device::Cpu,
        )
        .unwrap();
        let images = decoded_to_images(&decoded).unwrap();
        assert_eq!(images.len(), 1);
        let px = images[0].get_pixel(0, 0);
        assert_eq!(px.0, [0, 0, 0]);
        assert_eq!(images[0].get_pixel(0, 1).0, [255, 255, 255]);
        assert_eq!(images[0].get_pixel(1, 1).0, [255, 255, 255]);
    }

    #[test]
    fn rejects_non_rgb_tensor() {
        let t = Tensor::zeros((1, 2, 2), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&t).is_err());
    }

    #[rstest]
    #[case(512, 512)]
    #[case(517, 512)]
    #[case(256, 256)]
    #[case(10, 64)]
    fn aligns_to_latent_grid(#[case] extent: u32, #[case] expected: usize) {
        assert_eq!(latent_aligned(extent), expected);
    }
}
