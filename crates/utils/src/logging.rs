//! provides logging helpers

use std::path::Path;

use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

/// Environment variable naming a directory for rolling log files.
/// When unset, logs go to stderr.
pub const LOG_PATH_ENV_VAR: &str = "COMPUTE_AGENT_LOG_PATH";

const LOG_FILE_PREFIX: &str = "compute-agent.log";

/// Boxed fmt layer, so callers can stack filters on top of it.
pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Build the human-readable fmt layer.
///
/// With `log_path` set, output goes to a daily-rotated file in that directory,
/// falling back to stderr when the appender cannot be created.
pub fn get_fmt_layer(log_path: Option<String>) -> BoxedLayer {
    let Some(log_path) = log_path else {
        return stderr_layer();
    };

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(7)
        .build(Path::new(&log_path))
    {
        Ok(appender) => layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_target(true)
            .boxed(),
        Err(err) => {
            eprintln!("failed to create log appender at {log_path}: {err}; logging to stderr");
            stderr_layer()
        }
    }
}

fn stderr_layer() -> BoxedLayer {
    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed()
}
