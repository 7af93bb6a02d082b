//! Port definition for request listeners.

use std::path::PathBuf;

use crate::domain::entities::{Origin, RequestKey, ResourceHandle};
use crate::domain::errors::{CancelCause, FailCause};

/// Result of a download-only request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    /// Source key of the downloaded identifier.
    pub key: RequestKey,
    /// Number of bytes fetched.
    pub byte_len: u64,
    /// Disk cache file holding the bytes, when stored.
    pub path: Option<PathBuf>,
}

/// What a completed request delivers.
#[derive(Debug)]
pub enum Delivered {
    /// A decoded resource.
    Resource(ResourceHandle),
    /// Raw bytes stored for later.
    Download(DownloadResult),
}

impl Delivered {
    /// The resource, if this delivery carries one.
    #[must_use]
    pub const fn resource(&self) -> Option<&ResourceHandle> {
        match self {
            Self::Resource(handle) => Some(handle),
            Self::Download(_) => None,
        }
    }
}

/// Receives request events on the delivery context.
///
/// Exactly one of `on_completed`, `on_failed`, `on_canceled` fires per
/// request, exactly once.
pub trait RequestListener: Send + Sync {
    /// The request began asynchronous work.
    fn on_started(&self) {}

    /// Bytes received so far. `total` is 0 when unknown.
    fn on_progress(&self, _total: u64, _completed: u64) {}

    /// The request finished successfully.
    fn on_completed(&self, delivered: Delivered, origin: Origin);

    /// The request broke.
    fn on_failed(&self, cause: FailCause);

    /// The request gave up.
    fn on_canceled(&self, cause: CancelCause);
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl RequestListener for NoopListener {
    fn on_completed(&self, _delivered: Delivered, _origin: Origin) {}

    fn on_failed(&self, _cause: FailCause) {}

    fn on_canceled(&self, _cause: CancelCause) {}
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    /// A terminal event as recorded by [`RecordingListener`].
    #[derive(Debug)]
    pub enum Recorded {
        /// `on_completed`.
        Completed(Delivered, Origin),
        /// `on_failed`.
        Failed(FailCause),
        /// `on_canceled`.
        Canceled(CancelCause),
    }

    /// Listener recording every event for assertions.
    #[derive(Default)]
    pub struct RecordingListener {
        /// Terminal events in arrival order.
        pub terminal: Mutex<Vec<Recorded>>,
        /// Number of `on_started` calls.
        pub started: Mutex<usize>,
        /// Progress events.
        pub progress: Mutex<Vec<(u64, u64)>>,
        done: Notify,
    }

    impl RecordingListener {
        /// Waits until a terminal event arrived.
        pub async fn wait(&self) {
            loop {
                let notified = self.done.notified();
                if !self.terminal.lock().is_empty() {
                    return;
                }
                notified.await;
            }
        }

        /// Number of terminal events so far.
        pub fn terminal_count(&self) -> usize {
            self.terminal.lock().len()
        }

        fn record(&self, event: Recorded) {
            self.terminal.lock().push(event);
            self.done.notify_waiters();
        }
    }

    impl RequestListener for RecordingListener {
        fn on_started(&self) {
            *self.started.lock() += 1;
        }

        fn on_progress(&self, total: u64, completed: u64) {
            self.progress.lock().push((total, completed));
        }

        fn on_completed(&self, delivered: Delivered, origin: Origin) {
            self.record(Recorded::Completed(delivered, origin));
        }

        fn on_failed(&self, cause: FailCause) {
            self.record(Recorded::Failed(cause));
        }

        fn on_canceled(&self, cause: CancelCause) {
            self.record(Recorded::Canceled(cause));
        }
    }
}
