use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

pub const LOG_FILE: &str = "hello_router.log";
pub const DISPATCH_FILE: &str = "dispatch.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LogSettings {
    /// An `EnvFilter` directive, e.g. `info` or `hello_router=debug`.
    pub level: String,
    /// When set, logs are also written to daily rolling files in here.
    pub dir: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

/// Install the global subscriber.
///
/// - stdout gets everything at `settings.level`.
/// - with `settings.dir`, a plain text rolling file gets the same, and a
///   newline-delimited JSON file gets only the `dispatch` target (one line per
///   handled start event).
///
/// Returns `Ok(false)` when a subscriber was already installed.
pub fn init_tracing(settings: &LogSettings) -> Result<bool> {
    let env_filter = EnvFilter::try_new(&settings.level)
        .with_context(|| format!("invalid log level `{}`", settings.level))?;

    let stdout_layer = fmt::layer().with_thread_names(true);

    let file_layers = match &settings.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log directory {}", dir.display()))?;
            Some(file_layers(dir))
        }
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layers)
        .try_init()
        .is_ok();
    Ok(installed)
}

fn file_layers<S>(dir: &Path) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
    let txt_layer = fmt::layer().with_writer(txt_appender).with_ansi(false);

    let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, DISPATCH_FILE);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("dispatch=info"));

    txt_layer.and_then(json_layer).boxed()
}
