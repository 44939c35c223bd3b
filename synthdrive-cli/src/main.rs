use std::{path::PathBuf, process::ExitCode};

use anyhow::{ensure, Result};
use clap::{Args, Parser, Subcommand};
use synthdrive_core::{
    run_batch, showcase, BatchEvent, BatchRequest, BlipLoader, ControlNetLoader, DeviceMap,
    FactoryError, ModelStore, SamplingSettings, DEFAULT_GUIDANCE_SCALE, DEFAULT_STEPS,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "SynthDrive: Offline Data Factory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate one synthetic variant of an image
    Run(RunArgs),
    /// Stitch input, edge map and result into a labeled triptych
    Showcase(ShowcaseArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to input image
    #[arg(long)]
    input: PathBuf,

    /// E.g. "make it night", "heavy snow"
    #[arg(long)]
    instruction: String,

    #[arg(long, default_value = "outputs/result.png")]
    output: PathBuf,

    /// Force CPU mode if the accelerator runs out of memory
    #[arg(long)]
    cpu: bool,

    /// Directory holding the installed models
    #[arg(long, env = "SYNTHDRIVE_MODELS", default_value = "models")]
    models: PathBuf,

    #[arg(long, default_value_t = DEFAULT_STEPS)]
    steps: usize,

    #[arg(long, default_value_t = DEFAULT_GUIDANCE_SCALE)]
    guidance: f64,

    #[arg(long)]
    seed: Option<u64>,

    /// Also write a showcase triptych to this path
    #[arg(long)]
    showcase: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ShowcaseArgs {
    #[arg(long)]
    input: PathBuf,

    #[arg(long, default_value = "outputs/debug_edges.png")]
    edges: PathBuf,

    /// The generated image
    #[arg(long)]
    output: PathBuf,

    #[arg(long, default_value = "showcase.png")]
    save: PathBuf,
}

fn run(args: RunArgs) -> Result<ExitCode> {
    println!(
        "--- 🧬  SynthDrive Engine ({}) ❄️  ---",
        if args.cpu { "CPU" } else { "GPU" }
    );

    let store = ModelStore::new(&args.models);
    let request = BatchRequest {
        input: args.input,
        instruction: args.instruction,
        output: args.output,
        showcase: args.showcase,
        settings: SamplingSettings {
            steps: args.steps,
            guidance_scale: args.guidance,
            seed: args.seed,
        },
    };

    let outcome = run_batch::<BlipLoader, ControlNetLoader>(
        &store,
        DeviceMap::from_cpu_flag(args.cpu),
        &request,
        |event| match event {
            BatchEvent::Analyzing => println!(">> Analyzing Image..."),
            BatchEvent::Described { caption } => println!("   AI Saw: '{caption}'"),
            BatchEvent::PromptComposed { prompt } => println!(">> Full Prompt: '{prompt}'"),
            BatchEvent::EdgesSaved { path } => debug!(path = %path.display(), "edge map saved"),
            BatchEvent::Generating => println!(">> Generating Synthetic Data..."),
        },
    );

    match outcome {
        Ok(report) => {
            println!("✅ DONE! Saved to {}", report.output.display());
            println!("   Time taken: {:.1}s", report.generation_time.as_secs_f64());
            if let Some(path) = report.showcase {
                println!("✅ Portfolio Showcase saved to: {}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err @ (FactoryError::Generation(_) | FactoryError::WorkerLost)) => {
            println!("\n❌ GENERATION FAILED: {err}");
            if !args.cpu {
                if err.is_out_of_memory() {
                    println!("💡 TIP: Your GPU might be full.");
                }
                println!("   Try running again with: --cpu");
            }
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}

fn assemble_showcase(args: ShowcaseArgs) -> Result<ExitCode> {
    let saved = showcase::assemble(&args.input, &args.edges, &args.output, &args.save);
    ensure!(saved, "could not load one of the images, check the paths");
    println!("✅ Portfolio Showcase saved to: {}", args.save.display());
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args),
        Command::Showcase(args) => assemble_showcase(args),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            println!("❌ {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from([
            "synthdrive-cli",
            "run",
            "--input",
            "car.jpg",
            "--instruction",
            "make it snowy",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.output, PathBuf::from("outputs/result.png"));
        assert!(!args.cpu);
        assert_eq!(args.steps, DEFAULT_STEPS);
        assert_eq!(args.guidance, DEFAULT_GUIDANCE_SCALE);
        assert!(args.showcase.is_none());
    }

    #[test]
    fn run_requires_instruction() {
        assert!(Cli::try_parse_from(["synthdrive-cli", "run", "--input", "car.jpg"]).is_err());
    }

    #[test]
    fn showcase_failure_is_an_error() {
        let tmp = std::env::temp_dir().join("synthdrive-cli-missing");
        let args = ShowcaseArgs {
            input: tmp.join("a.png"),
            edges: tmp.join("b.png"),
            output: tmp.join("c.png"),
            save: tmp.join("showcase.png"),
        };
        assert!(assemble_showcase(args).is_err());
    }
}
