// src/main.rs
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use holter_signal::capture::{CaptureSession, SerialLink, DEFAULT_BAUD_RATE};
use holter_signal::signal::{
    export_artifacts, processed_base_key, raw_object_key, ArtifactSink, DirectorySink,
    PlotStyle, ProcessingSummary, SessionStatusUpdate,
};
use holter_signal::{HolterError, Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(name = "holter", version, about = "Holter ECG capture and batch processing")]
struct Cli {
    /// JSON pipeline configuration; missing fields keep their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode one raw capture blob and write processed artifacts.
    Process {
        input: PathBuf,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long)]
        no_plots: bool,
    },
    /// Pull capture blocks from a recorder over USB serial.
    Capture {
        #[arg(long)]
        port: String,
        #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
        baud: u32,
        /// Write the first block here instead of under its raw object key.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long, default_value_t = 1)]
        device_id: u16,
        #[arg(long, default_value_t = 1)]
        blocks: usize,
        /// Run the pipeline on every block as it arrives.
        #[arg(long)]
        process: bool,
        #[arg(long)]
        no_plots: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let pipeline = Pipeline::new(config)?;
    match cli.cmd {
        Commands::Process {
            input,
            out_dir,
            no_plots,
        } => {
            let bytes =
                fs::read(&input).with_context(|| format!("failed to read {}", input.display()))?;
            let source = input.display().to_string();
            let mut sink = DirectorySink::new(out_dir);
            let status = match process_blob(&pipeline, &bytes, &source, &mut sink, !no_plots) {
                Ok(status) => status,
                Err(err) => {
                    let session = input
                        .file_stem()
                        .map(|stem| stem.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let status = SessionStatusUpdate::failed("unknown", session, &err, Utc::now());
                    println!("{}", serde_json::to_string_pretty(&status)?);
                    return Err(err).with_context(|| format!("failed to process {source}"));
                }
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Capture {
            port,
            baud,
            out,
            out_dir,
            device_id,
            blocks,
            process,
            no_plots,
        } => {
            if blocks == 0 {
                bail!("--blocks must be at least 1");
            }
            let mut link = SerialLink::open(&port, baud)
                .with_context(|| format!("failed to open serial port {port}"))?;
            let mut session = CaptureSession::new();
            let mut sink = DirectorySink::new(&out_dir);
            for index in 0..blocks {
                let block = link
                    .run_capture(&mut session)
                    .with_context(|| format!("capture {} of {blocks} failed", index + 1))?;
                if block.is_empty() {
                    warn!("block {} arrived without samples, skipping", index + 1);
                    continue;
                }
                if !block.is_complete() {
                    warn!(
                        "block {} has {} samples, {} announced",
                        index + 1,
                        block.len(),
                        block.expected.unwrap_or_default()
                    );
                }
                let started_at = block.started_at.unwrap_or_else(Utc::now);
                let start_time = u32::try_from(started_at.timestamp()).unwrap_or_default();
                let frame = block.to_frame(device_id, start_time, &pipeline.config().device)?;
                let raw_key = raw_object_key(
                    started_at.timestamp(),
                    &format!("device-{device_id}"),
                    &format!("session_{start_time}"),
                );
                let written = match (&out, index) {
                    (Some(path), 0) => write_file(path, &frame)?,
                    _ => {
                        sink.put(&raw_key, "application/octet-stream", &frame)?;
                        out_dir.join(&raw_key)
                    }
                };
                info!(
                    "block {}: {} samples over {:.1} s -> {}",
                    index + 1,
                    block.len(),
                    block.duration_s(),
                    written.display()
                );
                if process {
                    match process_blob(&pipeline, &frame, &raw_key, &mut sink, !no_plots) {
                        Ok(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                        Err(err) => error!("block {} failed to process: {err}", index + 1),
                    }
                }
            }
            if session.malformed_lines() > 0 {
                warn!("{} malformed DATA lines dropped", session.malformed_lines());
            }
        }
    }
    Ok(())
}

fn process_blob(
    pipeline: &Pipeline,
    bytes: &[u8],
    source: &str,
    sink: &mut dyn ArtifactSink,
    plots: bool,
) -> Result<SessionStatusUpdate, HolterError> {
    let result = pipeline.process(bytes)?;
    let processed_at: DateTime<Utc> = Utc::now();
    let raw_key = raw_object_key(
        i64::from(result.header.start_time),
        &format!("device-{}", result.header.device_id),
        &format!("session_{}", result.header.session_id),
    );
    let base_key = processed_base_key(&raw_key);
    let summary = ProcessingSummary::from_result(&result, source, processed_at);
    let style = PlotStyle::default();
    let written = export_artifacts(&result, &summary, &base_key, sink, plots.then_some(&style))?;
    info!(
        "{source}: {:.1} s, {:.1}% motion, {:.1} BPM, {} artifacts",
        result.duration_s,
        result.motion_percentage,
        result.average_bpm(),
        written.len()
    );
    Ok(SessionStatusUpdate::processed(&result, base_key, processed_at))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path.to_path_buf())
}
