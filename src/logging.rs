//! Logging setup using the `log` facade with an `env_logger` backend.
//!
//! The level is controlled through the `RUST_LOG` environment variable and
//! defaults to `warn`: the pipeline's regular channel to the user is the
//! progress bar and the error sink, not the logger, so anything below a
//! warning is debugging detail.

use env_logger::{Builder, Env};

/// Initialize the logging subsystem.
///
/// Call once at startup, before any logging calls. Honors `RUST_LOG` if
/// set, otherwise filters at `warn`.
pub fn init() {
    Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .format_target(false)
        .init();
}
