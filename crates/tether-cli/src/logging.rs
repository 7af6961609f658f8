//! Tracing setup: console output plus an optional file in the profile's
//! logs directory.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const LOG_FILE: &str = "tether.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Plain-text layer appending to `<logs_dir>/tether.log`.
///
/// Lines are written from a background thread; keep the guard alive until
/// exit so buffered lines are flushed.
pub fn file_layer(logs_dir: &Path) -> anyhow::Result<(BoxedLayer, WorkerGuard)> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;
    let appender = tracing_appender::rolling::never(logs_dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .boxed();
    Ok((layer, guard))
}

/// Install the global subscriber. `RUST_LOG` filters both outputs and
/// defaults to `info`.
pub fn init(logs_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let (file, guard) = match logs_dir {
        Some(dir) => {
            let (layer, guard) = file_layer(dir)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(file)
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    Ok(guard)
}
