//! Async session (component A, spec §4.1).
//!
//! Owns a task's pending events and watchers; fires the finalizer once both
//! counts drain. Spec §9 calls out the source's "reference counting for
//! session-owned objects with destructor functions" and "callback-driven
//! async with per-callback raw pointers" as patterns to re-architect: here a
//! pending event is a boxed `FnOnce` cleanup keyed by a stable
//! [`EventHandle`], and a watcher is a counted guard (`Watcher`) whose `Drop`
//! calls back into the session — there are no raw pointers and no manual
//! refcounting.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Identifies a registered event for idempotent `add`/`remove` (spec §4.1:
/// "idempotent by (cleanup_cb, ud)"). Rust ownership makes the raw
/// `(fn, ud)` pair unnecessary; the handle is a monotonic counter instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct EventHandle(u64);

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

struct PendingEvent {
    handle: EventHandle,
    tag: &'static str,
    cleanup: Option<Cleanup>,
}

struct SessionInner {
    events: Mutex<Vec<PendingEvent>>,
    watcher_count: AtomicU64,
    next_handle: AtomicU64,
    finalized: AtomicBool,
    finalizer: Mutex<Option<oneshot::Sender<FinalizeReason>>>,
}

/// Why the session finalized. `Timeout` short-circuits pending watcher
/// callbacks without invoking them (spec §5 "Cancellation & timeouts").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinalizeReason {
    Drained,
    Timeout,
}

/// Per-task async session (spec §3 "Async session").
///
/// Cheap to clone: it is a thin `Arc` handle shared between the task owner
/// and every outstanding callback.
#[derive(Clone)]
pub struct AsyncSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for AsyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSession")
            .field("pending_events", &self.inner.events.lock().len())
            .field(
                "watchers",
                &self.inner.watcher_count.load(Ordering::Relaxed),
            )
            .field("finalized", &self.inner.finalized.load(Ordering::Relaxed))
            .finish()
    }
}

impl AsyncSession {
    /// Creates a new session and a receiver that resolves exactly once, when
    /// the finalizer runs (spec §8: "the finalizer runs exactly once per
    /// task").
    pub fn new() -> (Self, oneshot::Receiver<FinalizeReason>) {
        let (tx, rx) = oneshot::channel();
        let inner = SessionInner {
            events: Mutex::new(Vec::new()),
            watcher_count: AtomicU64::new(0),
            next_handle: AtomicU64::new(0),
            finalized: AtomicBool::new(false),
            finalizer: Mutex::new(Some(tx)),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Attaches a pending event. Returns the handle needed to remove it.
    pub fn add_event<F>(&self, tag: &'static str, cleanup: F) -> EventHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = EventHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        self.inner.events.lock().push(PendingEvent {
            handle,
            tag,
            cleanup: Some(Box::new(cleanup)),
        });
        handle
    }

    /// Runs the event's cleanup and decrements the pending count. If this
    /// was the last event and no watcher is open, finalizes the session.
    pub fn remove_event(&self, handle: EventHandle) {
        let cleanup = {
            let mut events = self.inner.events.lock();
            let position = events.iter().position(|e| e.handle == handle);
            match position {
                Some(idx) => events.remove(idx).cleanup,
                None => None,
            }
        };
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        self.maybe_finalize(FinalizeReason::Drained);
    }

    /// Opens a watcher: a counted sub-scope. While any watcher is open the
    /// session cannot finalize even with zero pending events (spec §4.1).
    pub fn push_watcher(&self) -> Watcher {
        self.inner.watcher_count.fetch_add(1, Ordering::AcqRel);
        Watcher {
            session: self.clone(),
            popped: false,
            callbacks: Vec::new(),
        }
    }

    /// Registers a deferred callback against a still-open watcher (spec
    /// §4.1 `watcher_push_callback`). Callbacks run, in registration order,
    /// when the watcher is popped — and may themselves call
    /// [`AsyncSession::push_watcher`] to extend the scope transitively.
    pub fn watcher_push_callback(
        &self,
        watcher: &mut Watcher,
        callback: impl FnOnce() + Send + 'static,
    ) {
        watcher.callbacks.push(Box::new(callback));
    }

    /// Pops a previously opened watcher: every callback registered against
    /// it runs, in order, then the count is released and finalization is
    /// reconsidered.
    pub fn pop_watcher(&self, mut watcher: Watcher) {
        for callback in std::mem::take(&mut watcher.callbacks) {
            callback();
        }
        watcher.pop_silently();
    }

    fn drop_watcher_silently(&self) {
        // A global timeout (`force_timeout`) may have already zeroed the
        // count and finalized the session; watchers still held by rules
        // that gave up waiting drop in after the fact and must be no-ops.
        if self.inner.finalized.load(Ordering::Acquire) {
            return;
        }
        let previous = self.inner.watcher_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "watcher count underflow");
        self.maybe_finalize(FinalizeReason::Drained);
    }

    /// Forces finalization on a global deadline (spec §5): pending watchers
    /// are dropped without invoking their callbacks.
    pub fn force_timeout(&self) {
        self.inner.watcher_count.store(0, Ordering::Release);
        let cleanups: Vec<Cleanup> = {
            let mut events = self.inner.events.lock();
            events.drain(..).filter_map(|e| e.cleanup).collect()
        };
        for cleanup in cleanups {
            cleanup();
        }
        self.finalize_once(FinalizeReason::Timeout);
    }

    fn maybe_finalize(&self, reason: FinalizeReason) {
        let events_empty = self.inner.events.lock().is_empty();
        let no_watchers = self.inner.watcher_count.load(Ordering::Acquire) == 0;
        if events_empty && no_watchers {
            self.finalize_once(reason);
        }
    }

    fn finalize_once(&self, reason: FinalizeReason) {
        if self
            .inner
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(tx) = self.inner.finalizer.lock().take() {
                let _ = tx.send(reason);
            }
        }
    }

    pub fn pending_event_count(&self) -> usize {
        self.inner.events.lock().len()
    }

    pub fn watcher_count(&self) -> u64 {
        self.inner.watcher_count.load(Ordering::Relaxed)
    }
}

/// A counted sub-scope (spec glossary: "Watcher"). Dropping it without
/// calling [`AsyncSession::pop_watcher`] still releases the count — a rule
/// that opens a watcher and never explicitly pops it is only rescued by the
/// session's global timeout (spec §8 boundary behavior), not left leaking.
pub struct Watcher {
    session: AsyncSession,
    popped: bool,
    callbacks: Vec<Cleanup>,
}

impl Watcher {
    fn pop_silently(&mut self) {
        if !self.popped {
            self.popped = true;
            self.session.drop_watcher_silently();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.pop_silently();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finalizes_when_events_and_watchers_drain() {
        let (session, rx) = AsyncSession::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let handle = session.add_event("dns", move || {
            ran_clone.store(true, Ordering::SeqCst);
        });
        session.remove_event(handle);
        let reason = rx.await.unwrap();
        assert_eq!(reason, FinalizeReason::Drained);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn watcher_blocks_finalization_until_popped() {
        let (session, rx) = AsyncSession::new();
        let mut watcher = session.push_watcher();
        assert_eq!(session.watcher_count(), 1);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        session.watcher_push_callback(&mut watcher, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        session.pop_watcher(watcher);
        assert!(fired.load(Ordering::SeqCst));
        let reason = rx.await.unwrap();
        assert_eq!(reason, FinalizeReason::Drained);
    }

    #[tokio::test]
    async fn unpopped_watcher_waits_for_timeout() {
        let (session, rx) = AsyncSession::new();
        let _watcher = session.push_watcher();
        session.force_timeout();
        let reason = rx.await.unwrap();
        assert_eq!(reason, FinalizeReason::Timeout);
    }

    #[tokio::test]
    async fn finalizer_fires_exactly_once() {
        let (session, rx) = AsyncSession::new();
        session.force_timeout();
        session.force_timeout(); // second call must be a no-op
        assert_eq!(rx.await.unwrap(), FinalizeReason::Timeout);
    }
}
