#![warn(clippy::pedantic)]
mod error;
mod fetcher;

use crate::error::MainError;
use crate::fetcher::{HttpTileSource, TileEvent, TileFetcher, TileOutcome};
use clap::Parser;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use shared::error::InitializationError;
use shared::tiles::{BoundingBox, TileStore, tile_ranges};
use shared::{init_tracing, load_config};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const DEFAULT_EXTENSION: &str = "png";

/// Downloads map tiles covering a bounding box into a local tile store for
/// offline use. Tiles already on disk are never fetched again.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Area to cover
    #[arg(
        long,
        num_args = 4,
        required = true,
        allow_negative_numbers = true,
        value_names = ["MIN_LAT", "MIN_LON", "MAX_LAT", "MAX_LON"]
    )]
    bbox: Vec<f64>,

    /// Zoom levels to fetch
    #[arg(long, num_args = 1.., required = true)]
    zoom: Vec<u8>,

    /// Tile store root
    #[arg(long, default_value = "tiles")]
    output: PathBuf,

    /// Upstream URL with {z}, {x} and {y} placeholders
    #[arg(long)]
    url_template: Option<String>,

    /// File extension for stored tiles; taken from the URL template when omitted
    #[arg(long)]
    extension: Option<String>,

    /// Minimum pause between upstream requests, e.g. "200ms"
    #[arg(long, value_parser = humantime::parse_duration)]
    delay: Option<Duration>,

    /// Per-request timeout, e.g. "10s"
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Hide the progress bar
    #[arg(long, short)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
    let args = Args::parse();
    init_tracing()?;

    // no network activity before the request itself is known to be valid
    let bbox = BoundingBox::new(args.bbox[0], args.bbox[1], args.bbox[2], args.bbox[3])?;
    let total: u64 = tile_ranges(&bbox, &args.zoom)?.iter().map(|r| r.len()).sum();

    let config = load_config().map_err(InitializationError::from)?.tile_fetcher;
    let url_template = args.url_template.unwrap_or(config.url_template);
    let extension = args
        .extension
        .or_else(|| template_extension(&url_template).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    let delay = args
        .delay
        .unwrap_or(Duration::from_millis(config.delay_ms));
    let timeout = args
        .timeout
        .unwrap_or(Duration::from_secs(config.timeout_seconds));
    info!(
        name: "fetcher.configured",
        url_template = %url_template,
        output = %args.output.display(),
        extension = %extension,
        delay = ?delay,
        timeout = ?timeout,
        tiles = total,
        "starting tile fill"
    );

    let source = HttpTileSource::new(url_template, &config.user_agent, timeout)
        .map_err(MainError::Client)?;
    let fetcher = TileFetcher::new(source, TileStore::new(args.output, extension), delay);

    let (tx, rx) = mpsc::unbounded_channel();
    let progress = tokio::spawn(report_progress(rx, total, args.quiet));

    let result = fetcher.fill(&bbox, &args.zoom, Some(&tx)).await;
    drop(tx);
    progress.await?;
    let summary = result?;

    for (key, reason) in &summary.failures {
        warn!(name: "fetcher.tile.failed", %key, reason = %reason, "tile was not downloaded");
    }
    info!(
        name: "fetcher.completed",
        fetched = summary.fetched,
        cached = summary.cached,
        failed = summary.failures.len(),
        root = %fetcher.store().root().display(),
        "tile fill finished"
    );
    Ok(())
}

/// Extension of the last path segment of `template`, ignoring any query.
fn template_extension(template: &str) -> Option<&str> {
    let path = template.split(['?', '#']).next().unwrap_or(template);
    let (_, file) = path.rsplit_once('/')?;
    let (_, extension) = file.rsplit_once('.')?;
    (!extension.is_empty() && extension.chars().all(|c| c.is_ascii_alphanumeric()))
        .then_some(extension)
}

async fn report_progress(mut events: mpsc::UnboundedReceiver<TileEvent>, total: u64, quiet: bool) {
    let target = if quiet {
        ProgressDrawTarget::hidden()
    } else {
        ProgressDrawTarget::stderr()
    };
    let style = ProgressStyle::with_template("{bar:50} {pos:>6}/{len:6} {msg} remaining: {eta}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let progress_bar = ProgressBar::with_draw_target(Some(total), target).with_style(style);

    let mut failed = 0u64;
    while let Some(event) = events.recv().await {
        if matches!(event.outcome, TileOutcome::Failed(_)) {
            failed += 1;
        }
        progress_bar.set_message(format!("{} ({failed} failed)", event.key));
        progress_bar.inc(1);
    }
    progress_bar.finish_and_clear();
}
