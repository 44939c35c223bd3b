use std::{convert::Infallible, io::Cursor, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use synthdrive_core::{
    BlipCaptioner, BlipLoader, ControlNetLoader, ControlNetSynthesizer, DeviceMap, JobEvent,
    Loader, ModelStore, SamplingSettings, Session, DEFAULT_GUIDANCE_SCALE, DEFAULT_STEPS,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "SynthDrive live generation server")]
struct Args {
    /// Run every model on the CPU (the default)
    #[arg(long, conflicts_with = "gpu")]
    cpu: bool,

    /// Run on the best available accelerator instead of the CPU
    #[arg(long)]
    gpu: bool,

    /// Directory holding the installed models
    #[arg(long, env = "SYNTHDRIVE_MODELS", default_value = "models")]
    models: PathBuf,

    /// Where temporary inputs, results and showcases are written
    #[arg(long, env = "SYNTHDRIVE_OUTPUT_DIR", default_value = "outputs")]
    output_dir: PathBuf,

    #[arg(long, default_value_t = DEFAULT_STEPS)]
    steps: usize,

    #[arg(long, default_value_t = DEFAULT_GUIDANCE_SCALE)]
    guidance: f64,

    #[arg(long)]
    seed: Option<u64>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

type FactorySession = Session<BlipCaptioner, ControlNetSynthesizer>;

#[derive(Serialize, Clone, Debug)]
struct DeviceInfo {
    device: &'static str,
    dtype: String,
    sequential_offload: bool,
    sliced_decode: bool,
}

#[derive(Clone)]
struct AppState {
    // One job at a time; a second request while this is held gets 409.
    session: Arc<Mutex<FactorySession>>,
    device: DeviceInfo,
    settings: SamplingSettings,
}

#[derive(Deserialize, Debug)]
struct GenerationRequest {
    /// Base64-encoded image file bytes
    image: Option<String>,
    #[serde(default)]
    instruction: String,
}

fn image_to_base64_png(img: &RgbImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

fn decode_image(encoded: &str) -> Result<RgbImage> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .context("image is not valid base64")?;
    let image = image::load_from_memory(&bytes).context("image could not be decoded")?;
    Ok(image.to_rgb8())
}

/// SSE event name and JSON body for a job event.
fn payload(event: &JobEvent) -> Result<(&'static str, Value)> {
    Ok(match event {
        JobEvent::Status { state, message } => {
            ("status", json!({ "state": state, "status": message }))
        }
        JobEvent::Preview { frame, message } => (
            "preview",
            json!({
                "image": image_to_base64_png(&frame.image)?,
                "step": frame.step,
                "total": frame.total,
                "status": message,
            }),
        ),
        JobEvent::Finished(output) => (
            "complete",
            json!({
                "image": image_to_base64_png(&output.image)?,
                "result_path": output.result_path,
                "showcase_path": output.showcase_path,
                "status": output.status,
            }),
        ),
        JobEvent::Failed { message } => ("failed", json!({ "status": message })),
    })
}

fn to_sse(event: JobEvent) -> Event {
    match payload(&event) {
        Ok((name, body)) => Event::default().event(name).data(body.to_string()),
        Err(err) => {
            warn!("dropping unencodable event: {err:#}");
            Event::default().comment("encoding error")
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let busy = state.session.try_lock().is_err();
    Json(json!({
        "status": "ok",
        "busy": busy,
        "device": state.device,
        "settings": state.settings,
    }))
}

async fn generation_handler(
    State(state): State<AppState>,
    Json(req): Json<GenerationRequest>,
) -> Response {
    let image = match req.image.as_deref().map(decode_image).transpose() {
        Ok(image) => image,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("{e:#}")).into_response(),
    };
    let Ok(mut session) = state.session.clone().try_lock_owned() else {
        return (StatusCode::CONFLICT, "a generation job is already running").into_response();
    };

    let (tx, rx) = mpsc::channel::<JobEvent>(32);
    tokio::task::spawn_blocking(move || {
        session.run_interactive(image.as_ref(), &req.instruction, |event| {
            if tx.blocking_send(event).is_err() {
                // Client went away; the job still runs to completion.
                info!("event stream closed by client");
            }
        });
    });

    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(to_sse(event)));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let device_map = DeviceMap::from_cpu_flag(args.cpu || !args.gpu);
    let store = ModelStore::new(&args.models);
    info!(models = %store.root().display(), %device_map, "initializing engine");

    let (captioner, synthesizer) = tokio::task::spawn_blocking(move || {
        let captioner = BlipLoader::load(&store, device_map)?;
        let synthesizer = ControlNetLoader::load(&store, device_map)?;
        anyhow::Ok((captioner, synthesizer))
    })
    .await?
    .inspect_err(|e| error!("engine failed to start: {e:#}"))?;

    let profile = synthesizer.profile();
    let device = DeviceInfo {
        device: profile.label(),
        dtype: format!("{:?}", profile.dtype()),
        sequential_offload: profile.sequential_offload(),
        sliced_decode: profile.sliced_decode(),
    };
    let settings = SamplingSettings {
        steps: args.steps,
        guidance_scale: args.guidance,
        seed: args.seed,
    };
    let session = Session::new(captioner, synthesizer, &args.output_dir).with_settings(settings);
    let settings = *session.settings();
    info!(
        device = device.device,
        output_dir = %session.output_dir().display(),
        ?settings,
        "engine ready"
    );

    let state = AppState {
        session: Arc::new(Mutex::new(session)),
        device,
        settings,
    };
    let app = Router::new()
        .route("/v1/generations", post(generation_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use synthdrive_core::{JobState, PreviewFrame};

    #[test]
    fn preview_payload_carries_step_and_png() {
        let event = JobEvent::Preview {
            frame: PreviewFrame {
                step: 3,
                total: 20,
                image: RgbImage::new(8, 8),
            },
            message: "🧬 Generating... (Live Generation)".to_string(),
        };
        let (name, body) = payload(&event).unwrap();
        assert_eq!(name, "preview");
        assert_eq!(body["step"], 3);
        assert_eq!(body["total"], 20);
        let png = decode_image(body["image"].as_str().unwrap()).unwrap();
        assert_eq!(png.dimensions(), (8, 8));
    }

    #[test]
    fn status_payload_uses_snake_case_state() {
        let event = JobEvent::Status {
            state: JobState::LockingGeometry,
            message: "📐 Locking Edges...".to_string(),
        };
        let (name, body) = payload(&event).unwrap();
        assert_eq!(name, "status");
        assert_eq!(body["state"], "locking_geometry");
    }

    #[test]
    fn garbage_image_is_rejected() {
        assert!(decode_image("not base64!!").is_err());
        assert!(decode_image(&BASE64_STANDARD.encode(b"plain text")).is_err());
    }
}
