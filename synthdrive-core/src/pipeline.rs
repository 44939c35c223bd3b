//! Job orchestration: caption, lock geometry, generate, and present.
//!
//! Two drivers share the same stages. [`Session`] keeps both models loaded
//! and runs the generator on a worker thread so intermediate frames can be
//! relayed while it samples. [`run_batch`] loads each model only for the
//! stage that needs it and runs everything on the calling thread.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{RecvTimeoutError, Sender};
use image::RgbImage;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    compose_prompt,
    error::{FactoryError, Result},
    showcase, Captioner, DeviceMap, EdgeExtractor, GenerationJob, Loader, ModelStore,
    PreviewFrame, PreviewSink, SamplingSettings, Synthesizer,
};

/// How long the foreground waits for a frame before checking the worker.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub const TEMP_INPUT: &str = "temp_input.png";
pub const TEMP_EDGES: &str = "temp_edges.png";
pub const DEBUG_EDGES: &str = "debug_edges.png";

pub mod status {
    pub const SEEING: &str = "👁️ AI is seeing...";
    pub const LOCKING_EDGES: &str = "📐 Locking Edges...";
    pub const STARTING_GENERATOR: &str = "🧬 Starting Generator (This will take time)...";
    pub const GENERATING: &str = "🧬 Generating... (Live Generation)";
    pub const FINALIZING: &str = "🖼️ Finalizing Portfolio Showcase...";
    pub const COMPLETE: &str = "✅ Generation Complete!";
    pub const NO_INPUT: &str = "❌ Please upload an image first.";
    pub const CPU_TIP: &str = "💡 TIP: Your GPU might be full. Restart in CPU mode.";

    pub fn failed(reason: impl std::fmt::Display) -> String {
        format!("❌ {reason}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Describing,
    LockingGeometry,
    Generating,
    Finalizing,
    Complete,
    Failed,
}

serde_plain::derive_display_from_serialize!(JobState);

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct JobOutput {
    pub image: RgbImage,
    pub result_path: PathBuf,
    /// `None` when the showcase could not be assembled.
    pub showcase_path: Option<PathBuf>,
    pub status: String,
}

/// Progress of an interactive job, in the order it happens.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Status { state: JobState, message: String },
    Preview { frame: PreviewFrame, message: String },
    Finished(JobOutput),
    Failed { message: String },
}

impl JobEvent {
    pub fn state(&self) -> JobState {
        match self {
            Self::Status { state, .. } => *state,
            Self::Preview { .. } => JobState::Generating,
            Self::Finished(_) => JobState::Complete,
            Self::Failed { .. } => JobState::Failed,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Status { message, .. }
            | Self::Preview { message, .. }
            | Self::Failed { message } => message,
            Self::Finished(output) => &output.status,
        }
    }

    fn status(state: JobState, message: &str) -> Self {
        Self::Status {
            state,
            message: message.to_string(),
        }
    }
}

/// Message from the generator worker. `Done` is always the last one sent.
enum WorkerMessage {
    Frame(PreviewFrame),
    Done(Result<RgbImage>),
}

struct ChannelSink(Sender<WorkerMessage>);

impl PreviewSink for ChannelSink {
    fn on_frame(&mut self, frame: PreviewFrame) {
        // The foreground only stops listening once the job is over.
        let _ = self.0.send(WorkerMessage::Frame(frame));
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Long-lived owner of the two expensive models.
pub struct Session<C, S> {
    captioner: C,
    synthesizer: S,
    edges: EdgeExtractor,
    settings: SamplingSettings,
    output_dir: PathBuf,
}

impl<C: Captioner, S: Synthesizer> Session<C, S> {
    pub fn new(captioner: C, synthesizer: S, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            captioner,
            synthesizer,
            edges: EdgeExtractor::default(),
            settings: SamplingSettings::default(),
            output_dir: output_dir.into(),
        }
    }

    pub fn with_settings(mut self, settings: SamplingSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &SamplingSettings {
        &self.settings
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Runs one job, reporting every transition through `emit`.
    ///
    /// The last event is always `Finished` or `Failed`. After a `Failed`
    /// event no preview or final image follows.
    pub fn run_interactive(
        &mut self,
        image: Option<&RgbImage>,
        instruction: &str,
        mut emit: impl FnMut(JobEvent),
    ) -> Option<JobOutput> {
        let Some(image) = image else {
            emit(JobEvent::Failed {
                message: status::NO_INPUT.to_string(),
            });
            return None;
        };

        match self.run_stages(image, instruction, &mut emit) {
            Ok(output) => {
                info!(result = %output.result_path.display(), "job complete");
                emit(JobEvent::Finished(output.clone()));
                Some(output)
            }
            Err(err) => {
                error!("job failed: {err}");
                let mut message = status::failed(&err);
                if err.is_out_of_memory() && self.synthesizer.accelerated() {
                    message = format!("{message} {}", status::CPU_TIP);
                }
                emit(JobEvent::Failed { message });
                None
            }
        }
    }

    fn run_stages(
        &mut self,
        image: &RgbImage,
        instruction: &str,
        emit: &mut impl FnMut(JobEvent),
    ) -> Result<JobOutput> {
        std::fs::create_dir_all(&self.output_dir)?;
        let input_path = self.output_dir.join(TEMP_INPUT);
        image.save(&input_path)?;

        emit(JobEvent::status(JobState::Describing, status::SEEING));
        let caption = self.captioner.describe(image)?;
        let prompt = compose_prompt(&caption, instruction);
        info!(%caption, %prompt, "prompt composed");

        emit(JobEvent::status(JobState::LockingGeometry, status::LOCKING_EDGES));
        let edges = self.edges.edges(image);
        let edges_path = self.output_dir.join(TEMP_EDGES);
        edges.save(&edges_path)?;

        emit(JobEvent::status(JobState::Generating, status::STARTING_GENERATOR));
        let job = GenerationJob::new(prompt, edges, &self.settings);
        let result = self.generate_live(&job, emit)?;

        emit(JobEvent::status(JobState::Finalizing, status::FINALIZING));
        let ts = timestamp();
        let result_path = self.output_dir.join(format!("result_{ts}.png"));
        result.save(&result_path)?;
        let showcase_path = self.output_dir.join(format!("showcase_{ts}.png"));
        let showcase_path =
            showcase::assemble(&input_path, &edges_path, &result_path, &showcase_path)
                .then_some(showcase_path);

        Ok(JobOutput {
            image: result,
            result_path,
            showcase_path,
            status: status::COMPLETE.to_string(),
        })
    }

    /// Samples on a scoped worker thread while the calling thread relays
    /// frames as they arrive.
    fn generate_live(
        &mut self,
        job: &GenerationJob,
        emit: &mut impl FnMut(JobEvent),
    ) -> Result<RgbImage> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let synthesizer = &mut self.synthesizer;

        thread::scope(|scope| {
            let worker = scope.spawn(move || {
                let mut sink = ChannelSink(tx.clone());
                let result = synthesizer.generate(job, Some(&mut sink));
                let _ = tx.send(WorkerMessage::Done(result));
            });

            let outcome = loop {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(WorkerMessage::Frame(frame)) => {
                        debug!(step = frame.step, total = frame.total, "preview frame");
                        emit(JobEvent::Preview {
                            frame,
                            message: status::GENERATING.to_string(),
                        });
                    }
                    Ok(WorkerMessage::Done(result)) => break result,
                    Err(RecvTimeoutError::Timeout) => {
                        // Done is sent before the worker returns, so a finished
                        // worker with nothing queued never sent it.
                        if worker.is_finished() && rx.is_empty() {
                            break Err(FactoryError::WorkerLost);
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break Err(FactoryError::WorkerLost),
                }
            };
            if worker.join().is_err() {
                warn!("generator worker panicked");
            }
            outcome
        })
    }
}

/// Stages reported by [`run_batch`].
#[derive(Debug)]
pub enum BatchEvent<'a> {
    Analyzing,
    Described { caption: &'a str },
    PromptComposed { prompt: &'a str },
    EdgesSaved { path: &'a Path },
    Generating,
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub input: PathBuf,
    pub instruction: String,
    pub output: PathBuf,
    pub showcase: Option<PathBuf>,
    pub settings: SamplingSettings,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub caption: String,
    pub prompt: String,
    pub output: PathBuf,
    pub edges_path: PathBuf,
    /// Set only when a showcase was requested and assembled.
    pub showcase: Option<PathBuf>,
    pub generation_time: Duration,
}

/// Batch driver: each model is loaded for its stage only, and the captioner
/// is released before the generator is loaded.
pub fn run_batch<CL, SL>(
    store: &ModelStore,
    device_map: DeviceMap,
    request: &BatchRequest,
    mut on_event: impl FnMut(BatchEvent<'_>),
) -> Result<BatchReport>
where
    CL: Loader,
    CL::Model: Captioner,
    SL: Loader,
    SL::Model: Synthesizer,
{
    let (original, edges) = EdgeExtractor::default().extract_path(&request.input)?;

    let caption = {
        let mut captioner = CL::load(store, device_map)?;
        on_event(BatchEvent::Analyzing);
        captioner.describe(&original)?
    };
    debug!("captioner released");
    on_event(BatchEvent::Described { caption: &caption });

    let prompt = compose_prompt(&caption, &request.instruction);
    on_event(BatchEvent::PromptComposed { prompt: &prompt });

    if let Some(parent) = request.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let edges_path = request.output.with_file_name(DEBUG_EDGES);
    edges.save(&edges_path)?;
    on_event(BatchEvent::EdgesSaved { path: &edges_path });

    let mut synthesizer = SL::load(store, device_map)?;
    on_event(BatchEvent::Generating);
    let start = Instant::now();
    let job = GenerationJob::new(prompt.clone(), edges, &request.settings);
    let result = synthesizer.generate(&job, None)?;
    let generation_time = start.elapsed();
    result.save(&request.output)?;
    info!(output = %request.output.display(), ?generation_time, "batch complete");

    let showcase = request.showcase.as_ref().and_then(|path| {
        showcase::assemble(&request.input, &edges_path, &request.output, path).then(|| path.clone())
    });

    Ok(BatchReport {
        caption,
        prompt,
        output: request.output.clone(),
        edges_path,
        showcase,
        generation_time,
    })
}
