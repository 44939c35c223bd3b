pub mod caption;
pub mod device_map;
pub mod edges;
pub mod error;
pub mod loader;
pub mod pipeline;
pub mod preview;
pub mod prompt;
pub mod showcase;
pub mod store;
pub mod synth;
mod util;

pub use caption::{BlipCaptioner, BlipLoader};
pub use device_map::*;
pub use edges::{EdgeExtractor, EdgeMap};
pub use error::{FactoryError, Result};
use image::RgbImage;
pub use loader::*;
pub use pipeline::{
    run_batch, BatchEvent, BatchReport, BatchRequest, JobEvent, JobOutput, JobState, Session,
};
pub use preview::{PreviewFrame, PreviewSink};
pub use prompt::{compose_prompt, NEGATIVE_PROMPT};
use serde::Serialize;
pub use store::ModelStore;
pub use synth::{ControlNetLoader, ControlNetSynthesizer};
pub(crate) use util::*;

pub const DEFAULT_STEPS: usize = 20;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

/// Sampling knobs shared by every job of a session.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct SamplingSettings {
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: None,
        }
    }
}

/// One request to the synthesizer.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub prompt: String,
    pub negative_prompt: String,
    pub control: EdgeMap,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

impl GenerationJob {
    pub fn new(prompt: impl Into<String>, control: EdgeMap, settings: &SamplingSettings) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: NEGATIVE_PROMPT.to_string(),
            control,
            steps: settings.steps,
            guidance_scale: settings.guidance_scale,
            seed: settings.seed,
        }
    }
}

/// Describes the content of an image in one short sentence.
pub trait Captioner: Send {
    fn describe(&mut self, image: &RgbImage) -> Result<String>;
}

/// Produces one image from a prompt and an edge map, optionally reporting an
/// intermediate frame after each denoising step.
pub trait Synthesizer: Send {
    fn generate(
        &mut self,
        job: &GenerationJob,
        sink: Option<&mut dyn PreviewSink>,
    ) -> Result<RgbImage>;

    /// Whether sampling runs on an accelerator rather than the CPU.
    fn accelerated(&self) -> bool {
        false
    }
}
