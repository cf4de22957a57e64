//! Signal handling for graceful shutdown.
//!
//! Ctrl+C sets a shared `AtomicBool` that every stage polls at its next
//! suspension point: the scanner stops listing directories, the verifier
//! aborts in-flight hashing at the next read-buffer boundary, and the
//! deduper stops between targets. Filesystem state stays consistent because
//! every mutation commits through an atomic rename.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Exit code for SIGINT interruption (128 + signal number).
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Shared shutdown flag handed to worker threads.
#[derive(Debug, Clone)]
pub struct ShutdownHandler {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandler {
    /// Create a handler with shutdown not requested.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether Ctrl+C was pressed or [`ShutdownHandler::request_shutdown`]
    /// was called.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Manually request a shutdown.
    pub fn request_shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clone of the underlying flag for passing into pipeline stages.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_HANDLER: OnceLock<ShutdownHandler> = OnceLock::new();

/// Install a Ctrl+C handler that sets the shutdown flag on interrupt.
///
/// Installation happens once per process; later calls return the existing
/// handler. If the ctrlc hook cannot be registered (another handler is
/// already present, as happens in test binaries) the returned handler still
/// works for manual shutdown requests.
#[must_use]
pub fn install_handler() -> ShutdownHandler {
    GLOBAL_HANDLER
        .get_or_init(|| {
            let handler = ShutdownHandler::new();
            let flag = handler.flag();
            let installed = ctrlc::set_handler(move || {
                flag.store(true, Ordering::SeqCst);
                let _ = writeln!(std::io::stderr(), "\nInterrupted. Cleaning up...");
                let _ = std::io::stderr().flush();
            });
            if let Err(err) = installed {
                log::warn!("Ctrl+C handler unavailable: {err}");
            }
            handler
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_shutdown_request() {
        let handler = ShutdownHandler::new();
        assert!(!handler.is_shutdown_requested());
        handler.request_shutdown();
        assert!(handler.is_shutdown_requested());

        // The flag is shared, not copied.
        let flag = handler.flag();
        assert!(flag.load(Ordering::SeqCst));
    }
}
