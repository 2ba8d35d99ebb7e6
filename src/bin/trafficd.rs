//! trafficd - traffic camera counting daemon
//!
//! Resolves the camera catalog once, then cycles until interrupted:
//! fetch one image per camera, count cars/trucks/people, write the counts to
//! the telemetry sink and archive every processed image. Ctrl-C drains the
//! upload queue for up to the configured grace period before exiting.
//!
//! The stub detector is only accepted with `--dry-run`.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use trafficcam::{Orchestrator, PipelineConfig, PipelineParts};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(long, env = "TRAFFIC_CONFIG")]
    config: Option<PathBuf>,
    /// Directory fetched images are staged in.
    #[arg(long)]
    raw_dir: Option<PathBuf>,
    /// Directory claimed images wait in until uploaded.
    #[arg(long)]
    upload_dir: Option<PathBuf>,
    /// Directory uploaded raw images are moved to.
    #[arg(long)]
    archive_dir: Option<PathBuf>,
    /// Skip fetching while this many files are staged.
    #[arg(long)]
    max_in_flight: Option<usize>,
    /// Detection confidence threshold (0..1).
    #[arg(long)]
    threshold: Option<f32>,
    /// Fraction of images that get an annotated copy (0..1).
    #[arg(long)]
    sample_rate: Option<f64>,
    /// Run a single cycle, drain and exit.
    #[arg(long)]
    once: bool,
    /// Allow the stub detector, which records zero counts for every image.
    #[arg(long)]
    dry_run: bool,
    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    ui: ui::UiMode,
}

impl Args {
    fn apply(&self, cfg: &mut PipelineConfig) {
        if let Some(dir) = &self.raw_dir {
            cfg.dirs.raw_dir = dir.clone();
        }
        if let Some(dir) = &self.upload_dir {
            cfg.dirs.upload_dir = dir.clone();
        }
        if let Some(dir) = &self.archive_dir {
            cfg.dirs.archive_dir = dir.clone();
        }
        if let Some(max) = self.max_in_flight {
            cfg.pipeline.max_files_in_flight = max;
        }
        if let Some(threshold) = self.threshold {
            cfg.detect.threshold = threshold;
        }
        if let Some(rate) = self.sample_rate {
            cfg.pipeline.annotate_sample_rate = rate;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::new(args.ui, is_tty, !stdout_is_tty);

    let mut cfg = PipelineConfig::load_from(args.config.as_deref())?;
    args.apply(&mut cfg);
    cfg.validate()?;
    log::info!(
        "trafficd {} starting: raw={} upload={} archive={} store={} sink={}",
        env!("CARGO_PKG_VERSION"),
        cfg.dirs.raw_dir.display(),
        cfg.dirs.upload_dir.display(),
        cfg.dirs.archive_dir.display(),
        cfg.archive.store,
        cfg.telemetry_sink
    );

    let parts = {
        let _stage = ui.stage("Load detector and open stores");
        if args.dry_run {
            PipelineParts::dry_run(&cfg)?
        } else {
            PipelineParts::from_config(&cfg)?
        }
    };
    let mut orchestrator = Orchestrator::new(cfg, parts);

    let shutdown = orchestrator.shutdown_handle();
    ctrlc::set_handler(move || {
        log::info!("interrupt received; finishing current work");
        shutdown.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    {
        let mut stage = ui.stage("Resolve camera catalog");
        if let Err(e) = orchestrator.bootstrap() {
            log::error!("{:#}", e);
            orchestrator.drain();
            return Err(e);
        }
        stage.detail(format!("{} cameras", orchestrator.cameras().len()));
    }

    let report = if args.once {
        orchestrator.run_cycle();
        orchestrator.drain()
    } else {
        orchestrator.run()?
    };

    if report.abandoned > 0 {
        log::warn!(
            "{} uploads did not finish; they will be retried on the next start",
            report.abandoned
        );
    }
    log::info!("trafficd stopped");
    Ok(())
}
