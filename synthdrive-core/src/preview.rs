//! Intermediate frames reported while sampling runs

use image::RgbImage;

/// An intermediate decode of the noisy latent after one denoising step
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    /// 1-based step that produced this frame
    pub step: usize,
    /// Total steps in the job
    pub total: usize,
    pub image: RgbImage,
}

/// Receives preview frames from the sampling loop, in step order.
///
/// The synthesizer only knows this trait; how frames are shown (a channel to
/// another thread, a test collector, a console) is up to the caller.
pub trait PreviewSink {
    fn on_frame(&mut self, frame: PreviewFrame);
}

impl<F: FnMut(PreviewFrame)> PreviewSink for F {
    fn on_frame(&mut self, frame: PreviewFrame) {
        self(frame)
    }
}

impl PreviewSink for Vec<PreviewFrame> {
    fn on_frame(&mut self, frame: PreviewFrame) {
        self.push(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(step: usize, total: usize) -> PreviewFrame {
        PreviewFrame {
            step,
            total,
            image: RgbImage::new(2, 2),
        }
    }

    #[test]
    fn closures_are_sinks() {
        let mut steps = Vec::new();
        let mut sink = |f: PreviewFrame| steps.push(f.step);
        sink.on_frame(frame(1, 3));
        sink.on_frame(frame(2, 3));
        assert_eq!(steps, vec![1, 2]);
    }
}
