//! Log setup for the daemon.
//!
//! `RUST_LOG` wins when set. The fallback keeps consultd chatty while
//! muting the per-request noise from the HTTP stack, which otherwise
//! drowns the sweep and lifecycle lines this daemon is actually debugged
//! by. Output goes to stderr so `--config`-style stdout stays parseable.

use tracing_subscriber::{fmt, EnvFilter};

/// Default directives when the environment does not specify any.
const DEFAULT_FILTER: &str = "info,consultd=debug,tower_http=warn,hyper=warn";

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .compact()
        .finish();

    // CLI modes call this on every entry path; a second call just keeps
    // the subscriber that is already installed.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
