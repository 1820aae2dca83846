//! Retina Triage command-line entry point.
//!
//! Loads retinal scans from disk, runs them through the batch orchestrator
//! and prints one line per item. The first Ctrl-C cancels the active run; a
//! second one, or one while no run is active, exits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use retina_triage::config::{AnalysisConfig, APP_VERSION};
use retina_triage::pipeline::analysis::{AnalysisClient, GeminiBackend, ImageSource};
use retina_triage::pipeline::batch::{BatchOrchestrator, ItemId, ItemStatus, TrackableItem};
use retina_triage::report;

#[derive(Parser, Debug)]
#[command(name = "retina-triage")]
#[command(about = "Screen retinal scans with a multimodal model")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze one or more scans as a single batch
    Analyze {
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Write a text report for every successful item into this directory
        #[arg(long, env = "RETINA_REPORT_DIR")]
        report_dir: Option<PathBuf>,
    },
    /// Analyze one scan, then re-run classification focused on a region or finding
    Refine {
        image: PathBuf,

        #[arg(long)]
        focus: String,

        #[arg(long, env = "RETINA_REPORT_DIR")]
        report_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    retina_triage::init_tracing();
    let args = Args::parse();

    info!("Retina Triage v{}", APP_VERSION);

    let config = AnalysisConfig::from_env().context("Invalid configuration")?;
    if !config.has_credential() {
        warn!("No API key configured; every analysis will fail until GEMINI_API_KEY is set");
    }
    let backend = Arc::new(GeminiBackend::from_config(&config));
    let client = AnalysisClient::new(backend, config);
    let orchestrator = Arc::new(BatchOrchestrator::new(Arc::new(client)));
    install_ctrl_c_handler(orchestrator.clone());

    match args.command {
        Command::Analyze { images, report_dir } => {
            for path in &images {
                match load_image(path).await {
                    Ok(source) => {
                        orchestrator.add_item(source);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping file"),
                }
            }
            if orchestrator.snapshot().is_empty() {
                bail!("No readable images to analyze");
            }

            let summary = orchestrator.analyze_pending().await;

            let items = orchestrator.snapshot();
            for item in &items {
                print_item(item);
            }
            if let Some(dir) = report_dir {
                write_reports(&dir, &items);
            }
            println!(
                "{} succeeded, {} failed, {} mismatched{}",
                summary.succeeded,
                summary.failed,
                summary.mismatched,
                if summary.cancelled { " (cancelled)" } else { "" }
            );
        }
        Command::Refine {
            image,
            focus,
            report_dir,
        } => {
            let source = load_image(&image).await?;
            let id = orchestrator.add_item(source);

            orchestrator.analyze_pending().await;

            let item = current(&orchestrator, id)?;
            print_item(&item);
            if item.status() != ItemStatus::Success {
                bail!("Initial analysis did not succeed; nothing to refine");
            }

            orchestrator
                .refine_item(id, &focus)
                .await
                .context("Refinement failed")?;

            let item = current(&orchestrator, id)?;
            print_item(&item);
            if let Some(dir) = report_dir {
                write_reports(&dir, std::slice::from_ref(&item));
            }
        }
    }

    Ok(())
}

/// Read a scan from disk, guessing its mime type from the extension.
async fn load_image(path: &Path) -> Result<ImageSource> {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() != mime_guess::mime::IMAGE {
        bail!("{} is not an image ({})", path.display(), mime.essence_str());
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(ImageSource::new(file_name, mime.essence_str(), bytes))
}

/// Exit status after an interrupt (128 + SIGINT).
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    CancelRun,
    Exit,
}

/// Decides what each Ctrl-C does: the first signal during a run cancels it,
/// every other signal exits.
#[derive(Debug, Default)]
struct InterruptHandler {
    cancel_sent: bool,
}

impl InterruptHandler {
    fn on_signal(&mut self, orchestrator: &BatchOrchestrator) -> Interrupt {
        if !self.cancel_sent && orchestrator.cancel_active() {
            self.cancel_sent = true;
            Interrupt::CancelRun
        } else {
            Interrupt::Exit
        }
    }
}

/// One listener for the whole process. Once `ctrl_c()` is installed the
/// default SIGINT behavior is gone, so this task must handle every signal.
fn install_ctrl_c_handler(orchestrator: Arc<BatchOrchestrator>) {
    tokio::spawn(async move {
        let mut handler = InterruptHandler::default();
        while signal::ctrl_c().await.is_ok() {
            match handler.on_signal(&orchestrator) {
                Interrupt::CancelRun => {
                    info!("Ctrl-C received, cancelling active run (press again to exit)");
                }
                Interrupt::Exit => {
                    warn!("Ctrl-C received, exiting");
                    std::process::exit(EXIT_INTERRUPTED);
                }
            }
        }
    });
}

fn current(orchestrator: &BatchOrchestrator, id: ItemId) -> Result<TrackableItem> {
    orchestrator
        .get(id)
        .with_context(|| format!("Item {id} disappeared"))
}

fn print_item(item: &TrackableItem) {
    let detail = match (item.result(), item.error_message()) {
        (_, Some(err)) if item.status() == ItemStatus::Error => err.to_string(),
        (Some(result), _) => format!("{} ({})", result.diagnosis, result.confidence),
        _ => String::new(),
    };
    println!(
        "{:<8} {:<10} {}  {}",
        item.status().as_str(),
        item.mapping_status().as_str(),
        item.file_name(),
        detail
    );
}

fn write_reports(dir: &Path, items: &[TrackableItem]) {
    for item in items.iter().filter(|i| i.status() == ItemStatus::Success) {
        match report::write_report(dir, item) {
            Ok(path) => println!("report: {}", path.display()),
            Err(e) => warn!(item_id = %item.id(), error = %e, "Failed to write report"),
        }
    }
}
