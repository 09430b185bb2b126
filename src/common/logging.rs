//! Logging and tracing configuration
//!
//! The CLI logs compactly to stderr. A run can additionally write a full
//! log file into its output directory.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file written into the output directory
pub const LOG_FILE: &str = "dact.log";

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("dact=debug,info")
        } else {
            EnvFilter::new("dact=info,warn")
        }
    })
}

/// Initialize tracing for the CLI
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate (DEBUG with `verbose`), WARN for
/// dependencies. With `log_dir` set, everything is also written to
/// `<log_dir>/dact.log`; keep the returned guard alive until exit so the
/// file is flushed.
pub fn init_cli(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let file = log_dir.and_then(|dir| match std::fs::create_dir_all(dir) {
        Ok(()) => Some(tracing_appender::non_blocking(tracing_appender::rolling::never(
            dir, LOG_FILE,
        ))),
        Err(e) => {
            eprintln!("Warning: Could not create log directory: {}", e);
            None
        }
    });

    match file {
        Some((writer, guard)) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true);
            tracing_subscriber::registry()
                .with(filter(verbose))
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter(verbose))
                .with(stderr_layer)
                .init();
            None
        }
    }
}
