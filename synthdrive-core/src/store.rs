//! Local model artifact store
//!
//! Models are installed once by a separate setup step into a single root
//! directory. Nothing here ever downloads; a missing directory is reported as
//! [`FactoryError::MissingArtifact`] before any weights are touched.

use std::path::{Path, PathBuf};

use crate::error::{FactoryError, Result};

pub const CAPTIONER_DIR: &str = "blip-image-captioning-base";
pub const DENOISER_DIR: &str = "stable-diffusion-v1-5";
pub const CONTROLNET_DIR: &str = "controlnet-canny";

/// Root of the installed model tree
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Captioning model directory, checked for existence.
    pub fn captioner(&self) -> Result<CaptionerPaths> {
        let dir = require_dir(&self.root.join(CAPTIONER_DIR), "captioning")?;
        Ok(CaptionerPaths { dir })
    }

    /// Denoiser and conditioning adapter directories, both checked before
    /// either is used.
    pub fn synthesizer(&self) -> Result<SynthesizerPaths> {
        let denoiser = require_dir(&self.root.join(DENOISER_DIR), "denoising")?;
        let controlnet = require_dir(&self.root.join(CONTROLNET_DIR), "conditioning adapter")?;
        Ok(SynthesizerPaths {
            denoiser,
            controlnet,
        })
    }
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::new("models")
    }
}

fn require_dir(path: &Path, component: &'static str) -> Result<PathBuf> {
    if path.is_dir() {
        Ok(path.to_path_buf())
    } else {
        Err(FactoryError::MissingArtifact {
            component,
            path: path.to_path_buf(),
        })
    }
}

fn require_file(path: PathBuf, component: &'static str) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(FactoryError::MissingArtifact { component, path })
    }
}

/// Files of the BLIP captioning model
#[derive(Debug, Clone)]
pub struct CaptionerPaths {
    dir: PathBuf,
}

impl CaptionerPaths {
    pub fn config(&self) -> Result<PathBuf> {
        require_file(self.dir.join("config.json"), "captioning config")
    }

    pub fn weights(&self) -> Result<PathBuf> {
        require_file(self.dir.join("model.safetensors"), "captioning weights")
    }

    pub fn tokenizer(&self) -> Result<PathBuf> {
        require_file(self.dir.join("tokenizer.json"), "captioning tokenizer")
    }
}

/// Files of the Stable Diffusion pipeline and its ControlNet adapter
#[derive(Debug, Clone)]
pub struct SynthesizerPaths {
    denoiser: PathBuf,
    controlnet: PathBuf,
}

impl SynthesizerPaths {
    pub fn unet(&self) -> Result<PathBuf> {
        require_file(
            self.denoiser.join("unet").join("diffusion_pytorch_model.safetensors"),
            "unet weights",
        )
    }

    pub fn vae(&self) -> Result<PathBuf> {
        require_file(
            self.denoiser.join("vae").join("diffusion_pytorch_model.safetensors"),
            "vae weights",
        )
    }

    pub fn text_encoder(&self) -> Result<PathBuf> {
        require_file(
            self.denoiser.join("text_encoder").join("model.safetensors"),
            "text encoder weights",
        )
    }

    pub fn tokenizer(&self) -> Result<PathBuf> {
        require_file(
            self.denoiser.join("tokenizer").join("tokenizer.json"),
            "clip tokenizer",
        )
    }

    pub fn controlnet(&self) -> Result<PathBuf> {
        require_file(
            self.controlnet.join("diffusion_pytorch_model.safetensors"),
            "controlnet weights",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn empty_store_reports_missing_captioner() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path());
        match store.captioner() {
            Err(FactoryError::MissingArtifact { component, path }) => {
                assert_eq!(component, "captioning");
                assert!(path.ends_with(CAPTIONER_DIR));
            }
            other => panic!("expected MissingArtifact, got {other:?}"),
        }
    }

    #[test]
    fn synthesizer_requires_both_directories() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join(DENOISER_DIR)).unwrap();
        let store = ModelStore::new(tmp.path());
        match store.synthesizer() {
            Err(FactoryError::MissingArtifact { component, .. }) => {
                assert_eq!(component, "conditioning adapter")
            }
            other => panic!("expected MissingArtifact, got {other:?}"),
        }

        fs::create_dir(tmp.path().join(CONTROLNET_DIR)).unwrap();
        let paths = store.synthesizer().unwrap();
        assert!(paths.unet().unwrap_err().is_missing_artifact());
    }

    #[test]
    fn present_files_resolve() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(CAPTIONER_DIR);
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("tokenizer.json"), "{}").unwrap();
        let paths = ModelStore::new(tmp.path()).captioner().unwrap();
        assert_eq!(paths.tokenizer().unwrap(), dir.join("tokenizer.json"));
        assert!(paths.weights().is_err());
    }
}
