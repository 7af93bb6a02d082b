//! Live request state and the caller-facing handle.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::domain::entities::{Origin, RequestKey, RequestKind, RequestState, ResourceHandle};
use crate::domain::errors::{CancelCause, FailCause};
use crate::domain::ports::{Delivered, RequestListener};

use super::scheduler::DeliveryQueue;

/// Engine-unique request number.
pub type RequestId = u64;

/// Binds a delivered resource to its display surface. Returns false when
/// the surface no longer wants this request.
pub(crate) type RenderHook = Arc<dyn Fn(RequestId, &ResourceHandle) -> bool + Send + Sync>;

pub(crate) type Detach = Box<dyn FnOnce() + Send>;

/// State shared by the pipeline and every [`RequestHandle`] clone.
pub(crate) struct RequestCore {
    id: RequestId,
    kind: RequestKind,
    key: RequestKey,
    state: Mutex<RequestState>,
    listener: Arc<dyn RequestListener>,
    delivery: DeliveryQueue,
    detach: Mutex<Option<Detach>>,
}

impl RequestCore {
    pub(crate) fn new(
        id: RequestId,
        kind: RequestKind,
        key: RequestKey,
        listener: Arc<dyn RequestListener>,
        delivery: DeliveryQueue,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            key,
            state: Mutex::new(RequestState::Created),
            listener,
            delivery,
            detach: Mutex::new(None),
        })
    }

    pub(crate) const fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) const fn kind(&self) -> RequestKind {
        self.kind
    }

    pub(crate) fn state(&self) -> RequestState {
        self.state.lock().clone()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().is_terminal()
    }

    /// Moves to `next`. Returns false once the request is terminal, which
    /// tells the caller to stop working on it.
    pub(crate) fn advance(&self, next: RequestState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        if !state.can_transition_to(&next, self.kind) {
            error!(
                id = self.id,
                kind = %self.kind,
                from = %*state,
                to = %next,
                "Invalid request transition"
            );
            return true;
        }
        trace!(id = self.id, key = %self.key, from = %*state, to = %next, "Request transition");
        *state = next;
        true
    }

    /// Registers what to undo if the request ends while parked as a rider.
    /// Runs `detach` right away if the request already ended.
    pub(crate) fn set_detach(&self, detach: Detach) {
        if self.is_finished() {
            detach();
            return;
        }
        *self.detach.lock() = Some(detach);
        if self.is_finished()
            && let Some(detach) = self.detach.lock().take()
        {
            detach();
        }
    }

    pub(crate) fn clear_detach(&self) {
        self.detach.lock().take();
    }

    fn finish(&self, terminal: RequestState) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return false;
            }
            debug!(id = self.id, key = %self.key, from = %*state, to = %terminal, "Request finished");
            *state = terminal;
        }
        if let Some(detach) = self.detach.lock().take() {
            detach();
        }
        true
    }

    /// Terminates with `Failed(cause)`. No-op if already terminal.
    pub(crate) fn fail(self: &Arc<Self>, cause: FailCause) -> bool {
        if !self.finish(RequestState::Failed(cause.clone())) {
            return false;
        }
        let core = Arc::clone(self);
        self.delivery
            .post(Box::new(move || core.listener.on_failed(cause)));
        true
    }

    /// Terminates with `Canceled(cause)`. No-op if already terminal.
    pub(crate) fn cancel(self: &Arc<Self>, cause: CancelCause) -> bool {
        if !self.finish(RequestState::Canceled(cause)) {
            return false;
        }
        let core = Arc::clone(self);
        self.delivery
            .post(Box::new(move || core.listener.on_canceled(cause)));
        true
    }

    pub(crate) fn notify_started(self: &Arc<Self>) {
        let core = Arc::clone(self);
        self.delivery.post(Box::new(move || {
            if !core.is_finished() {
                core.listener.on_started();
            }
        }));
    }

    pub(crate) fn notify_progress(self: &Arc<Self>, total: u64, completed: u64) {
        let core = Arc::clone(self);
        self.delivery.post(Box::new(move || {
            if !core.is_finished() {
                core.listener.on_progress(total, completed);
            }
        }));
    }

    /// Moves to `AwaitingDelivery` and hands the result to the delivery
    /// context. Drops `delivered` if the request already ended.
    pub(crate) fn deliver(
        self: &Arc<Self>,
        delivered: Delivered,
        origin: Origin,
        render: Option<RenderHook>,
    ) {
        if !self.advance(RequestState::AwaitingDelivery) {
            trace!(id = self.id, "Dropping result of finished request");
            return;
        }
        let core = Arc::clone(self);
        self.delivery.post(Box::new(move || {
            core.complete(delivered, origin, render.as_ref());
        }));
    }

    fn complete(self: &Arc<Self>, delivered: Delivered, origin: Origin, render: Option<&RenderHook>) {
        if let Delivered::Resource(handle) = &delivered
            && handle.is_recycled()
        {
            error!(id = self.id, key = %handle.key(), "Delivering a recycled resource");
            self.fail(FailCause::ResourceRecycled);
            return;
        }

        if self.kind == RequestKind::Display {
            if !self.advance(RequestState::AwaitingRender) {
                return;
            }
            let bound = match (&delivered, render) {
                (Delivered::Resource(handle), Some(render)) => render(self.id, handle),
                _ => true,
            };
            if !bound {
                self.cancel(CancelCause::Superseded);
                return;
            }
        }

        if self.finish(RequestState::Completed) {
            self.listener.on_completed(delivered, origin);
        }
    }
}

/// Caller-side handle of a submitted request.
#[derive(Clone)]
pub struct RequestHandle {
    core: Arc<RequestCore>,
}

impl RequestHandle {
    pub(crate) const fn new(core: Arc<RequestCore>) -> Self {
        Self { core }
    }

    /// Engine-unique id.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.core.id
    }

    /// Request flavor.
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        self.core.kind
    }

    /// Cache key of the request.
    #[must_use]
    pub fn key(&self) -> &RequestKey {
        &self.core.key
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.core.state()
    }

    /// Returns true once a terminal state was reached.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.core.is_finished()
    }

    /// Cancels the request. `on_canceled` fires unless it already ended.
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelCause::Normal)
    }

    pub(crate) fn cancel_with(&self, cause: CancelCause) -> bool {
        self.core.cancel(cause)
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("key", &self.core.key)
            .field("state", &self.core.state())
            .finish()
    }
}

/// Result of [`Engine::load_now`](super::engine::Engine::load_now).
#[derive(Debug)]
pub enum LoadOutcome {
    /// Decoded resource and where it came from.
    Completed {
        /// The resource.
        handle: ResourceHandle,
        /// Where it came from.
        origin: Origin,
    },
    /// The request broke.
    Failed(FailCause),
    /// The request gave up.
    Canceled(CancelCause),
}

impl LoadOutcome {
    /// The resource, if the load completed.
    #[must_use]
    pub fn into_handle(self) -> Option<ResourceHandle> {
        match self {
            Self::Completed { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

/// Listener capturing the terminal event of an inline load.
#[derive(Default)]
pub(crate) struct OutcomeSlot {
    outcome: Mutex<Option<LoadOutcome>>,
}

impl OutcomeSlot {
    pub(crate) fn take(&self) -> Option<LoadOutcome> {
        self.outcome.lock().take()
    }

    fn set(&self, outcome: LoadOutcome) {
        self.outcome.lock().get_or_insert(outcome);
    }
}

impl RequestListener for OutcomeSlot {
    fn on_completed(&self, delivered: Delivered, origin: Origin) {
        match delivered {
            Delivered::Resource(handle) => self.set(LoadOutcome::Completed { handle, origin }),
            Delivered::Download(_) => {
                error!("Inline load delivered a download result");
                self.set(LoadOutcome::Failed(FailCause::decode("no resource produced")));
            }
        }
    }

    fn on_failed(&self, cause: FailCause) {
        self.set(LoadOutcome::Failed(cause));
    }

    fn on_canceled(&self, cause: CancelCause) {
        self.set(LoadOutcome::Canceled(cause));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::mocks::{Recorded, RecordingListener};

    fn core(kind: RequestKind, listener: Arc<RecordingListener>) -> Arc<RequestCore> {
        RequestCore::new(
            1,
            kind,
            RequestKey::from("file:///tmp/a.png"),
            listener,
            DeliveryQueue::inline(),
        )
    }

    #[test]
    fn test_terminal_fires_once() {
        let listener = Arc::new(RecordingListener::default());
        let core = core(RequestKind::Load, Arc::clone(&listener));

        assert!(core.advance(RequestState::Dispatching));
        assert!(core.cancel(CancelCause::Normal));
        assert!(!core.cancel(CancelCause::Superseded));
        assert!(!core.fail(FailCause::OutOfMemory));

        assert_eq!(listener.terminal_count(), 1);
        assert!(matches!(
            listener.terminal.lock()[0],
            Recorded::Canceled(CancelCause::Normal)
        ));
        assert!(!core.advance(RequestState::Decoding));
    }

    #[test]
    fn test_invalid_transition_keeps_state() {
        let listener = Arc::new(RecordingListener::default());
        let core = core(RequestKind::Load, listener);

        assert!(core.advance(RequestState::Decoding));
        assert_eq!(core.state(), RequestState::Created);
    }

    #[test]
    fn test_detach_runs_on_cancel() {
        let listener = Arc::new(RecordingListener::default());
        let core = core(RequestKind::Load, listener);
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);

        core.set_detach(Box::new(move || *flag.lock() = true));
        assert!(!*ran.lock());
        core.cancel(CancelCause::Normal);
        assert!(*ran.lock());
    }

    #[test]
    fn test_detach_runs_immediately_when_finished() {
        let listener = Arc::new(RecordingListener::default());
        let core = core(RequestKind::Load, listener);
        core.cancel(CancelCause::Normal);

        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        core.set_detach(Box::new(move || *flag.lock() = true));
        assert!(*ran.lock());
    }

    #[test]
    fn test_progress_suppressed_after_terminal() {
        let listener = Arc::new(RecordingListener::default());
        let core = core(RequestKind::Load, Arc::clone(&listener));

        core.notify_progress(10, 5);
        core.cancel(CancelCause::Normal);
        core.notify_progress(10, 10);
        core.notify_started();

        assert_eq!(*listener.progress.lock(), vec![(10, 5)]);
        assert_eq!(*listener.started.lock(), 0);
    }

    #[test]
    fn test_handle_cancel() {
        let listener = Arc::new(RecordingListener::default());
        let handle = RequestHandle::new(core(RequestKind::Download, Arc::clone(&listener)));

        assert!(!handle.is_finished());
        assert!(handle.cancel());
        assert!(handle.is_finished());
        assert_eq!(handle.state(), RequestState::Canceled(CancelCause::Normal));
        assert!(!handle.cancel());
    }
}
