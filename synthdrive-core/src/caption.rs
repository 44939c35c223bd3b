//! Scene description with BLIP.

use anyhow::Context;
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::blip;
use image::{imageops::FilterType, RgbImage};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    error::{FactoryError, Result},
    image_to_tensor, select_best_device, Captioner, DeviceMap, DeviceProfile, Loader, ModelStore,
};

/// Upper bound on generated caption length.
pub const MAX_NEW_TOKENS: usize = 50;

const IMAGE_SIZE: u32 = 384;
const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;
const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

pub struct BlipCaptioner {
    profile: DeviceProfile,
    model: blip::BlipForConditionalGeneration,
    tokenizer: Tokenizer,
}

impl BlipCaptioner {
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn preprocess(&self, image: &RgbImage) -> anyhow::Result<Tensor> {
        let resized =
            image::imageops::resize(image, IMAGE_SIZE, IMAGE_SIZE, FilterType::CatmullRom);
        let pixels = image_to_tensor(&resized, &Device::Cpu, DType::F32)?;
        let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
        let normalized = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;
        Ok(normalized
            .unsqueeze(0)?
            .to_device(self.profile.device())?
            .to_dtype(self.profile.dtype())?)
    }

    fn caption(&mut self, image: &RgbImage) -> anyhow::Result<String> {
        let pixel_values = self.preprocess(image)?;
        let image_embeds = self.model.vision_model().forward(&pixel_values)?;

        // No temperature: greedy decoding, so the seed is irrelevant.
        let mut logits_processor = LogitsProcessor::new(0, None, None);
        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..MAX_NEW_TOKENS {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids =
                Tensor::new(&token_ids[start_pos..], self.profile.device())?.unsqueeze(0)?;
            let logits = self
                .model
                .text_decoder()
                .forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }
        debug!(tokens = token_ids.len() - 1, "caption decoded");

        self.tokenizer
            .decode(&token_ids[1..], true)
            .map_err(anyhow::Error::msg)
            .context("failed to detokenize caption")
    }
}

impl Captioner for BlipCaptioner {
    fn describe(&mut self, image: &RgbImage) -> Result<String> {
        let caption = self.caption(image);
        // Always start the next call from an empty cache, even after a failure.
        self.model.reset_kv_cache();
        let caption = caption.map_err(FactoryError::vision)?;
        info!(caption = %caption, "scene described");
        Ok(caption.trim().to_string())
    }
}

pub struct BlipLoader;

impl Loader for BlipLoader {
    type Model = BlipCaptioner;

    fn load(store: &ModelStore, device_map: DeviceMap) -> Result<Self::Model> {
        let paths = store.captioner()?;
        let config_file = paths.config()?;
        let weights_file = paths.weights()?;
        let tokenizer_file = paths.tokenizer()?;

        let load = || -> anyhow::Result<BlipCaptioner> {
            let device = select_best_device(device_map).context("failed to set up device")?;
            let profile = DeviceProfile::full_precision(device);
            info!(device = profile.label(), "loading vision module");

            let config_str =
                std::fs::read_to_string(&config_file).context("failed to read BLIP config")?;
            let config: blip::Config =
                serde_json::from_str(&config_str).context("failed to parse BLIP config")?;
            let vb = unsafe {
                candle_nn::VarBuilder::from_mmaped_safetensors(
                    &[weights_file],
                    profile.dtype(),
                    profile.device(),
                )
                .context("failed to build BLIP var builder")?
            };
            let model = blip::BlipForConditionalGeneration::new(&config, vb)
                .context("failed to load BLIP model")?;
            let tokenizer = Tokenizer::from_file(&tokenizer_file)
                .map_err(anyhow::Error::msg)
                .context("failed to load BLIP tokenizer")?;

            Ok(BlipCaptioner {
                profile,
                model,
                tokenizer,
            })
        };
        load().map_err(FactoryError::vision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_fails_before_loading() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path());
        let err = match BlipLoader::load(&store, DeviceMap::ForceCpu) {
            Err(err) => err,
            Ok(_) => panic!("captioner loaded from an empty store"),
        };
        assert!(err.is_missing_artifact(), "unexpected error: {err}");
    }

    #[test]
    fn directory_without_weights_is_still_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(crate::store::CAPTIONER_DIR);
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("config.json"), "{}").unwrap();
        let store = ModelStore::new(tmp.path());
        let err = match BlipLoader::load(&store, DeviceMap::ForceCpu) {
            Err(err) => err,
            Ok(_) => panic!("captioner loaded without weights"),
        };
        assert!(matches!(
            err,
            FactoryError::MissingArtifact { component: "captioning weights", .. }
        ));
    }
}
