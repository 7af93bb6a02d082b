//! Display targets.
//!
//! A target stands for one visual surface. It tracks the request currently
//! loading into it and holds a display reference on whatever it shows, which
//! keeps that resource out of the pool.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::domain::entities::{DecodedPayload, DisplayRef, RecycledError, RequestKey, ResourceHandle};
use crate::domain::errors::CancelCause;

use super::request::{RenderHook, RequestHandle, RequestId};

#[derive(Default)]
struct TargetState {
    current: Option<RequestHandle>,
    shown: Option<DisplayRef>,
}

#[derive(Default)]
pub(crate) struct TargetInner {
    state: Mutex<TargetState>,
}

impl TargetInner {
    fn bind(&self, id: RequestId, handle: &ResourceHandle) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if state.current.as_ref().map(RequestHandle::id) != Some(id) {
                return false;
            }
            state.current = None;
            state.shown.replace(handle.display())
        };
        debug!(id, key = %handle.key(), "Target bound to resource");
        drop(previous);
        true
    }
}

impl Drop for TargetInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.shown = None;
        if let Some(current) = state.current.take() {
            current.cancel_with(CancelCause::ConsumerTornDown);
        }
    }
}

/// A surface display requests deliver into.
///
/// Clones share the surface. The last clone going away tears the surface
/// down, canceling its in-flight request.
#[derive(Clone, Default)]
pub struct DisplayTarget {
    inner: Arc<TargetInner>,
}

impl DisplayTarget {
    /// Creates an empty target.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `handle` the target's request, superseding the previous one.
    pub(crate) fn attach(&self, handle: &RequestHandle) {
        let previous = self.inner.state.lock().current.replace(handle.clone());
        if let Some(previous) = previous
            && previous.id() != handle.id()
            && previous.cancel_with(CancelCause::Superseded)
        {
            debug!(old = previous.id(), new = handle.id(), "Display request superseded");
        }
    }

    /// Hook binding a delivered resource to this target.
    pub(crate) fn render_hook(&self) -> RenderHook {
        let inner: Weak<TargetInner> = Arc::downgrade(&self.inner);
        Arc::new(move |id, handle| inner.upgrade().is_some_and(|inner| inner.bind(id, handle)))
    }

    /// Cancels the in-flight request and lets go of the shown resource.
    pub fn detach(&self) {
        let (current, shown) = {
            let mut state = self.inner.state.lock();
            (state.current.take(), state.shown.take())
        };
        if let Some(current) = current {
            current.cancel_with(CancelCause::ConsumerTornDown);
        }
        drop(shown);
    }

    /// Returns true while a resource is shown.
    #[must_use]
    pub fn is_showing(&self) -> bool {
        self.inner.state.lock().shown.is_some()
    }

    /// Key of the shown resource.
    #[must_use]
    pub fn shown_key(&self) -> Option<RequestKey> {
        self.inner.state.lock().shown.as_ref().map(|shown| shown.key().clone())
    }

    /// Reads the shown pixels.
    ///
    /// # Errors
    /// Returns [`RecycledError`] if the shown resource was recycled, which
    /// a display reference should make impossible.
    pub fn with_shown<R>(
        &self,
        f: impl FnOnce(&DecodedPayload) -> R,
    ) -> Option<Result<R, RecycledError>> {
        let state = self.inner.state.lock();
        state.shown.as_ref().map(|shown| shown.with_payload(f))
    }

    /// The request currently loading into this target.
    #[must_use]
    pub fn pending_request(&self) -> Option<RequestHandle> {
        self.inner.state.lock().current.clone()
    }
}

impl std::fmt::Debug for DisplayTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DisplayTarget")
            .field("pending", &state.current.as_ref().map(RequestHandle::id))
            .field("shown", &state.shown.as_ref().map(DisplayRef::key))
            .finish()
    }
}
