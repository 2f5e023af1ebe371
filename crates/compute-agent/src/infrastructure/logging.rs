//! provides logging helpers

use std::env;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use utils::logging::LOG_PATH_ENV_VAR;

/// Target of the allocation audit trail.
pub const AUDIT_TARGET: &str = "allocation";

fn is_audit(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target() == AUDIT_TARGET
}

/// initiate the global tracing subscriber
///
/// Regular logs go through the shared fmt layer. Events with the `allocation`
/// target also land in a daily-rotated audit file next to `audit_log_file`.
pub fn init<P: AsRef<Path>>(audit_log_file: P) -> Result<WorkerGuard> {
    let log_path = env::var(LOG_PATH_ENV_VAR).ok();
    let fmt_layer = utils::logging::get_fmt_layer(log_path);

    let audit_log_file = audit_log_file.as_ref();
    let dir = audit_log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file = audit_log_file
        .file_name()
        .and_then(|f| f.to_str())
        .with_context(|| format!("invalid audit log file {}", audit_log_file.display()))?;

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let fmt_layer = fmt_layer.with_filter(env_filter);

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .max_log_files(7)
        .build(dir)
        .with_context(|| format!("failed to create audit log appender in {}", dir.display()))?;

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let audit_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(
            filter::filter_fn(is_audit).and(filter::LevelFilter::INFO),
        );

    registry().with(fmt_layer).with(audit_layer).init();
    Ok(file_guard)
}
