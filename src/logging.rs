use crate::config::{expand_path, LoggingConfig};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directive used when `RUST_LOG` is unset.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Installs the global subscriber. Logs go to stderr so `--json` output on
/// stdout stays machine-readable; `logging.file` adds an uncoloured copy.
pub fn init(debug: bool, logging: &LoggingConfig) {
    // RUST_LOG takes precedence over --debug
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let file_layer = open_log_file(&logging.file).map(|file| {
        fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    // Err only when a subscriber is already installed, which tests do repeatedly
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .with(filter)
        .try_init();
}

fn open_log_file(raw: &str) -> Option<fs::File> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let path = expand_path(raw);
    let path = Path::new(&path);
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            eprintln!("warning: cannot create log directory {}", parent.display());
            return None;
        }
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("warning: cannot open log file {}: {err}", path.display());
            None
        }
    }
}
