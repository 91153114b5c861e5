use std::{
    fs::{self, OpenOptions},
    path::Path,
    sync::Mutex,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{AccessError, Result};

/// Default filter; `RUST_LOG` takes precedence when set
fn default_filter(debug: bool) -> &'static str {
    if debug {
        "kube_access=debug,kube=info,warn"
    } else {
        "kube_access=info,warn"
    }
}

fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(debug)))
}

/// Install the global subscriber. Events go to stderr, or are appended to
/// `log_file` (parent directories are created) when one is given.
pub fn init(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(debug));

    let installed = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()
        }
        None => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    installed.map_err(|e| AccessError::validation(format!("failed to install logger: {}", e)))
}
