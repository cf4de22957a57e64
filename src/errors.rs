//! Non-fatal error reporting shared by all pipeline stages.
//!
//! Stages report recoverable failures (unreadable directories, vanished
//! files, cache hiccups) through a bounded multi-producer channel. A single
//! drain thread writes them to stderr, clearing the progress line first so
//! bar redraws and error lines do not interleave.
//!
//! Reporting never blocks a stage: when the channel is full the event is
//! dropped. Diagnostics are not correctness-critical.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

/// Buffered capacity of the error channel.
const SINK_CAPACITY: usize = 100;

/// Cloneable handle for reporting non-fatal errors from any stage or thread.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: Option<SyncSender<anyhow::Error>>,
}

impl ErrorSink {
    /// A sink that discards everything. Useful in tests.
    #[must_use]
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Report a non-fatal error.
    ///
    /// Never blocks; the event is dropped if the channel is full or the
    /// drain has gone away.
    pub fn report(&self, err: anyhow::Error) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(err);
        }
    }
}

/// Handle on the drain thread; [`ErrorDrain::join`] waits for it to finish.
#[derive(Debug)]
pub struct ErrorDrain {
    handle: JoinHandle<()>,
}

impl ErrorDrain {
    /// Wait for the drain thread to exit.
    ///
    /// The drain exits once every [`ErrorSink`] clone has been dropped and
    /// the channel has been emptied.
    pub fn join(self) {
        let _ = self.handle.join();
    }
}

/// Create the error channel and start its drain thread.
#[must_use]
pub fn spawn_sink() -> (ErrorSink, ErrorDrain) {
    let (tx, rx) = sync_channel(SINK_CAPACITY);
    let handle = thread::spawn(move || drain(rx));
    (ErrorSink { tx: Some(tx) }, ErrorDrain { handle })
}

fn drain(rx: Receiver<anyhow::Error>) {
    for err in rx {
        // \r\x1b[K clears any progress line sharing stderr.
        eprintln!("\r\x1b[Kerror: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_disabled_sink_discards() {
        let sink = ErrorSink::disabled();
        sink.report(anyhow!("ignored"));
    }

    #[test]
    fn test_drain_exits_after_senders_drop() {
        let (sink, drain) = spawn_sink();
        let clone = sink.clone();
        clone.report(anyhow!("one"));
        sink.report(anyhow!("two"));
        drop(sink);
        drop(clone);
        drain.join();
    }

    #[test]
    fn test_report_never_blocks_when_full() {
        let (sink, drain) = spawn_sink();
        // Far more events than the channel buffers; overflow must be dropped,
        // not block the producer.
        for i in 0..10_000 {
            sink.report(anyhow!("event {i}"));
        }
        drop(sink);
        drain.join();
    }
}
