//! Edge-conditioned image synthesis: Stable Diffusion 1.5 steered by a Canny
//! ControlNet, sampled with UniPC and classifier-free guidance.

use anyhow::{Context, Error};
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self,
    clip::ClipTextTransformer,
    schedulers::{Scheduler, SchedulerConfig},
    uni_pc::UniPCSchedulerConfig,
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::{imageops::FilterType, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod controlnet;
mod residency;

pub use controlnet::{ControlNet, ControlNetConfig, ControlResiduals};
pub use residency::Resident;

use crate::{
    decoded_to_images,
    error::{FactoryError, Result},
    image_to_tensor, latent_aligned, select_best_device, DeviceMap, DeviceProfile, EdgeMap,
    GenerationJob, Loader, ModelStore, PreviewFrame, PreviewSink, Synthesizer,
};

const VAE_SCALE: f64 = 0.18215;
const CONDITIONING_SCALE: f64 = 1.0;

pub struct ControlNetSynthesizer {
    profile: DeviceProfile,
    max_tokens: usize,
    pad_id: u32,
    tokenizer: Tokenizer,
    text_encoder: Resident<ClipTextTransformer>,
    controlnet: Resident<ControlNet>,
    unet: Resident<UNet2DConditionModel>,
    vae: Resident<AutoEncoderKL>,
}

impl ControlNetSynthesizer {
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn tokenize(&self, text: &str) -> anyhow::Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_tokens {
            debug!(tokens = tokens.len(), "prompt truncated");
            tokens.truncate(self.max_tokens);
        }
        tokens.resize(self.max_tokens, self.pad_id);
        Ok(Tensor::new(tokens.as_slice(), self.profile.device())?.unsqueeze(0)?)
    }

    /// Returns embeddings batched as `[negative, prompt]`.
    fn encode_prompts(&self, prompt: &str, negative_prompt: &str) -> anyhow::Result<Tensor> {
        let cond = self.tokenize(prompt)?;
        let uncond = self.tokenize(negative_prompt)?;
        let embeddings = self.text_encoder.with(|clip| {
            let cond = clip.forward(&cond)?;
            let uncond = clip.forward(&uncond)?;
            Ok(Tensor::cat(&[uncond, cond], 0)?)
        })?;
        Ok(embeddings.to_dtype(self.profile.dtype())?)
    }

    fn decode(&self, latents: &Tensor) -> anyhow::Result<Vec<RgbImage>> {
        let latents = (latents / VAE_SCALE)?;
        let sliced = self.profile.sliced_decode();
        self.vae.with(|vae| {
            let decoded = if sliced {
                let slices = (0..latents.dim(0)?)
                    .map(|idx| vae.decode(&latents.narrow(0, idx, 1)?))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                Tensor::cat(&slices, 0)?
            } else {
                vae.decode(&latents)?
            };
            decoded_to_images(&decoded)
        })
    }

    fn decode_one(&self, latents: &Tensor) -> anyhow::Result<RgbImage> {
        self.decode(latents)?
            .into_iter()
            .next()
            .context("decoder returned no image")
    }

    fn sample(
        &mut self,
        job: &GenerationJob,
        mut sink: Option<&mut dyn PreviewSink>,
    ) -> anyhow::Result<RgbImage> {
        let device = self.profile.device().clone();
        let dtype = self.profile.dtype();
        let (control_w, control_h) = job.control.dimensions();
        let (width, height) = (latent_aligned(control_w), latent_aligned(control_h));

        let text_embeddings = self.encode_prompts(&job.prompt, &job.negative_prompt)?;
        let control = control_tensor(&job.control, width, height, &device, dtype)?;

        let mut scheduler = UniPCSchedulerConfig::default().build(job.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let total = timesteps.len();

        let latents = initial_noise((1, 4, height / 8, width / 8), job.seed, &device)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(dtype)?;

        info!(width, height, steps = total, guidance = job.guidance_scale, "sampling");
        for (index, &timestep) in timesteps.iter().enumerate() {
            let model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let model_input = scheduler.scale_model_input(model_input, timestep)?;

            let residuals = self.controlnet.with(|controlnet| {
                Ok(controlnet.forward(
                    &model_input,
                    timestep as f64,
                    &text_embeddings,
                    &control,
                    CONDITIONING_SCALE,
                )?)
            })?;
            let noise_pred = self.unet.with(|unet| {
                Ok(unet.forward_with_additional_residuals(
                    &model_input,
                    timestep as f64,
                    &text_embeddings,
                    Some(residuals.down.as_slice()),
                    Some(&residuals.mid),
                )?)
            })?;
            drop(residuals);

            let noise_pred = noise_pred.chunk(2, 0)?;
            let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred = (uncond + ((text - uncond)? * job.guidance_scale)?)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total, timestep, "denoised");

            if let Some(sink) = sink.as_mut() {
                let image = self.decode_one(&latents)?;
                sink.on_frame(PreviewFrame {
                    step: index + 1,
                    total,
                    image,
                });
            }
        }

        self.decode_one(&latents)
    }
}

impl Synthesizer for ControlNetSynthesizer {
    fn generate(
        &mut self,
        job: &GenerationJob,
        sink: Option<&mut dyn PreviewSink>,
    ) -> Result<RgbImage> {
        self.sample(job, sink).map_err(FactoryError::generation)
    }

    fn accelerated(&self) -> bool {
        !self.profile.device().is_cpu()
    }
}

/// The edge map as a `[negative, prompt]` batch at the sampling resolution.
fn control_tensor(
    edges: &EdgeMap,
    width: usize,
    height: usize,
    device: &Device,
    dtype: DType,
) -> anyhow::Result<Tensor> {
    let (width, height) = (width as u32, height as u32);
    let image = if edges.dimensions() == (width, height) {
        edges.image().clone()
    } else {
        image::imageops::resize(edges.image(), width, height, FilterType::Triangle)
    };
    let control = image_to_tensor(&image, device, dtype)?.unsqueeze(0)?;
    Ok(Tensor::cat(&[&control, &control], 0)?)
}

pub struct ControlNetLoader;

impl Loader for ControlNetLoader {
    type Model = ControlNetSynthesizer;

    fn load(store: &ModelStore, device_map: DeviceMap) -> Result<Self::Model> {
        let paths = store.synthesizer()?;
        let unet_file = paths.unet()?;
        let vae_file = paths.vae()?;
        let clip_file = paths.text_encoder()?;
        let tokenizer_file = paths.tokenizer()?;
        let controlnet_file = paths.controlnet()?;

        let load = || -> anyhow::Result<ControlNetSynthesizer> {
            let device = select_best_device(device_map).context("failed to set up device")?;
            let profile = DeviceProfile::for_device(device);
            let sequential = profile.sequential_offload();
            let use_flash_attn = cfg!(feature = "flash-attn");
            info!(
                device = profile.label(),
                dtype = ?profile.dtype(),
                sequential_offload = sequential,
                sliced_decode = profile.sliced_decode(),
                "loading generator"
            );

            let sd_config = StableDiffusionConfig::v1_5(None, None, None);
            let tokenizer = Tokenizer::from_file(&tokenizer_file)
                .map_err(Error::msg)
                .context("failed to load CLIP tokenizer")?;
            let pad_token = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
            let pad_id = tokenizer
                .token_to_id(pad_token)
                .with_context(|| format!("tokenizer has no {pad_token} token"))?;

            let text_encoder = {
                let (clip_config, device) = (sd_config.clip.clone(), profile.device().clone());
                Resident::new("text_encoder", sequential, move || {
                    Ok(stable_diffusion::build_clip_transformer(
                        &clip_config,
                        &clip_file,
                        &device,
                        DType::F32,
                    )?)
                })
                .context("failed to load text encoder")?
            };
            let controlnet = {
                let (device, dtype) = (profile.device().clone(), profile.dtype());
                Resident::new("controlnet", sequential, move || {
                    let vb = unsafe {
                        candle_nn::VarBuilder::from_mmaped_safetensors(
                            &[&controlnet_file],
                            dtype,
                            &device,
                        )?
                    };
                    Ok(ControlNet::new(vb, &ControlNetConfig::sd15(), use_flash_attn)?)
                })
                .context("failed to load ControlNet")?
            };
            let unet = {
                let (config, device, dtype) =
                    (sd_config.clone(), profile.device().clone(), profile.dtype());
                Resident::new("unet", sequential, move || {
                    Ok(config.build_unet(&unet_file, &device, 4, use_flash_attn, dtype)?)
                })
                .context("failed to load UNet")?
            };
            let vae = {
                let (config, device, dtype) =
                    (sd_config.clone(), profile.device().clone(), profile.dtype());
                Resident::new("vae", sequential, move || {
                    Ok(config.build_vae(&vae_file, &device, dtype)?)
                })
                .context("failed to load VAE")?
            };

            Ok(ControlNetSynthesizer {
                profile,
                max_tokens: sd_config.clip.max_position_embeddings,
                pad_id,
                tokenizer,
                text_encoder,
                controlnet,
                unet,
                vae,
            })
        };
        load().map_err(FactoryError::generation)
    }
}

/// Standard normal starting latents. A seed draws them on the host so the
/// same seed gives the same noise on every backend.
fn initial_noise(
    shape: (usize, usize, usize, usize),
    seed: Option<u64>,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let Some(seed) = seed else {
        return Tensor::randn(0f32, 1f32, shape, device);
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let values: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CONTROLNET_DIR, DENOISER_DIR};
    use crate::EdgeExtractor;

    #[test]
    fn empty_store_fails_before_loading() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path());
        let err = match ControlNetLoader::load(&store, DeviceMap::ForceCpu) {
            Err(err) => err,
            Ok(_) => panic!("generator loaded from an empty store"),
        };
        assert!(err.is_missing_artifact(), "unexpected error: {err}");
    }

    #[test]
    fn missing_controlnet_weights_are_named() {
        let tmp = tempfile::tempdir().unwrap();
        let sd = tmp.path().join(DENOISER_DIR);
        for (dir, file) in [
            ("unet", "diffusion_pytorch_model.safetensors"),
            ("vae", "diffusion_pytorch_model.safetensors"),
            ("text_encoder", "model.safetensors"),
            ("tokenizer", "tokenizer.json"),
        ] {
            std::fs::create_dir_all(sd.join(dir)).unwrap();
            std::fs::write(sd.join(dir).join(file), b"").unwrap();
        }
        std::fs::create_dir(tmp.path().join(CONTROLNET_DIR)).unwrap();

        let store = ModelStore::new(tmp.path());
        let err = match ControlNetLoader::load(&store, DeviceMap::ForceCpu) {
            Err(err) => err,
            Ok(_) => panic!("generator loaded without ControlNet weights"),
        };
        assert!(
            matches!(err, FactoryError::MissingArtifact { component: "controlnet weights", .. }),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn control_batch_matches_sampling_resolution() {
        let mut rgb = RgbImage::new(100, 70);
        for x in 20..80 {
            rgb.put_pixel(x, 35, image::Rgb([255, 255, 255]));
        }
        let edges = EdgeExtractor::default().edges(&rgb);
        let control = control_tensor(
            &edges,
            latent_aligned(100),
            latent_aligned(70),
            &Device::Cpu,
            DType::F32,
        )
        .unwrap();
        assert_eq!(control.dims(), &[2, 3, 64, 96]);
        let max = control
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(max <= 1.0);
    }

    #[test]
    fn seeded_noise_is_reproducible_on_cpu() {
        let shape = (1, 4, 8, 12);
        let draw = |seed| {
            initial_noise(shape, seed, &Device::Cpu)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };
        let first = draw(Some(42));
        assert_eq!(first.len(), 4 * 8 * 12);
        assert_eq!(first, draw(Some(42)));
        assert_ne!(first, draw(Some(43)));
        assert_ne!(draw(None), draw(None));
    }
}
