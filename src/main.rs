// src/main.rs

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::info;

use kmsdisplay::config::{parse_color, Config, PROBE_COLOR};
use kmsdisplay::kms::DrmBackend;
use kmsdisplay::probe::probe_allocation;
use kmsdisplay::release::{block_termination_signals, ReleaseSignal, TerminalRelease};
use kmsdisplay::render::{renderer_for, RenderPattern};
use kmsdisplay::{DisplayPipeline, PipelineError};

#[derive(Parser, Debug)]
#[command(name = "kmsdisplay", version)]
#[command(about = "Show a test pattern on a display through DRM/KMS")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "KMSDISPLAY_CONFIG")]
    config: Option<PathBuf>,

    /// DRM card node, e.g. /dev/dri/card1
    #[arg(long, global = true)]
    device: Option<PathBuf>,

    /// Release the display automatically after this many milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[arg(long, value_enum, global = true)]
    pattern: Option<PatternArg>,

    /// Fill colour as RRGGBB; implies --pattern solid
    #[arg(long, value_parser = parse_color, global = true)]
    color: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Switch the display to a rendered buffer until released (default)
    Show,
    /// Allocate, map and fill a buffer without touching the display
    Probe {
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum PatternArg {
    Gradient,
    Solid,
}

impl Cli {
    /// Command-line flags take precedence over everything else.
    fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.device.path = device.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.release.timeout_ms = Some(timeout_ms);
        }
        let configured_color = match config.render.pattern {
            RenderPattern::Solid { color } => color,
            RenderPattern::Gradient => PROBE_COLOR,
        };
        match (self.pattern, self.color) {
            (Some(PatternArg::Gradient), _) => config.render.pattern = RenderPattern::Gradient,
            (Some(PatternArg::Solid), color) | (None, color @ Some(_)) => {
                config.render.pattern = RenderPattern::Solid {
                    color: color.unwrap_or(configured_color),
                }
            }
            (None, None) => {}
        }
        if let Some(Command::Probe { width, height }) = &self.command {
            if let Some(width) = width {
                config.probe.width = *width;
            }
            if let Some(height) = height {
                config.probe.height = *height;
            }
        }
    }
}

fn main() -> ExitCode {
    // Initialize the logger. Default filter is "info" if RUST_LOG is not set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let line = match e.downcast_ref::<PipelineError>() {
                Some(pipeline) => pipeline.diagnostic(),
                None => format!("setup failed: {e:#}"),
            };
            eprintln!("kmsdisplay: {line}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    match cli.command {
        Some(Command::Probe { .. }) => probe(&config),
        Some(Command::Show) | None => show(&config),
    }
}

fn show(config: &Config) -> Result<()> {
    if config.release.on_signals {
        block_termination_signals()?;
    }
    let input = config.release.on_input.then(io::stdin);
    let mut release =
        TerminalRelease::new(input, config.release.on_signals, config.release.timeout())?;
    let hint = release.describe();
    let what = match config.render.pattern {
        RenderPattern::Gradient => "a colour gradient".to_string(),
        RenderPattern::Solid { color } => format!("solid #{color:06X}"),
    };
    let mut announce = || {
        println!("Displaying {what}. To exit: {hint}.");
        let _ = io::stdout().flush();
        release.wait()
    };

    let backend = DrmBackend::new();
    let mut pipeline = DisplayPipeline::new(&backend, config.pipeline_settings());
    let report = pipeline.run(renderer_for(config.render.pattern), &mut announce)?;
    info!(
        "Showed {} on {} ({}) via {}, released by {}",
        report.mode, report.connector_name, report.connector, report.crtc, report.reason
    );
    Ok(())
}

fn probe(config: &Config) -> Result<()> {
    let backend = DrmBackend::new();
    let report = probe_allocation(&backend, &config.device.path, &config.probe_request())?;
    println!(
        "Allocated and filled a {}x{} buffer on {}, stride {} bytes",
        report.width,
        report.height,
        config.device.path.display(),
        report.stride
    );
    Ok(())
}
