//! Session registry: the only cross-session shared state.
//!
//! Two mappings (by call id, by session id) live behind a single mutex and
//! are mutated exclusively through whole-entry attach/detach operations, so
//! the at-most-one-live-session-per-call invariant never needs multi-step
//! locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cross-task view of one relay session.
///
/// The connection task exclusively owns the socket, buffers and upstream
/// link; everything another task may need (close requests, call binding for
/// transcript delivery) lives here.
pub struct SessionHandle {
    id: Uuid,
    call_id: RwLock<Option<String>>,
    stream_id: RwLock<Option<String>>,
    close_reason: Mutex<Option<String>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(call_id: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            call_id: RwLock::new(call_id),
            stream_id: RwLock::new(None),
            close_reason: Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn call_id(&self) -> Option<String> {
        self.call_id.read().clone()
    }

    pub fn stream_id(&self) -> Option<String> {
        self.stream_id.read().clone()
    }

    pub fn set_stream_id(&self, stream_id: String) {
        *self.stream_id.write() = Some(stream_id);
    }

    fn set_call_id(&self, call_id: String) {
        *self.call_id.write() = Some(call_id);
    }

    /// Request closure with a reason. Idempotent: only the first call
    /// records its reason and wakes the connection task.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.close_reason.lock() = Some(reason.to_string());
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Token the connection task selects on to observe close requests.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[derive(Default)]
struct Maps {
    by_call: HashMap<String, Arc<SessionHandle>>,
    by_id: HashMap<Uuid, Arc<SessionHandle>>,
}

/// Registry of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Maps>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted session under its session id. A session
    /// that is already closed is never (re)registered.
    pub fn register(&self, handle: Arc<SessionHandle>) {
        if handle.is_closed() {
            return;
        }
        self.inner.lock().by_id.insert(handle.id(), handle);
    }

    /// Bind `handle` to `call_id`. A different live session already holding
    /// the call id is detached and closed with reason "superseded" first,
    /// so the call maps to exactly one non-closed session afterwards.
    ///
    /// A closed handle is rejected: its task may still be draining frames
    /// after supersession or cleanup, and letting it back in would evict
    /// the call's legitimate live session.
    pub fn attach(&self, handle: &Arc<SessionHandle>, call_id: &str) {
        if handle.is_closed() {
            debug!(
                call_id = %call_id,
                session_id = %handle.id(),
                "ignoring attach of closed session"
            );
            return;
        }
        let superseded = {
            let mut maps = self.inner.lock();
            let old = match maps.by_call.get(call_id) {
                Some(existing) if !Arc::ptr_eq(existing, handle) => {
                    let old = existing.clone();
                    maps.by_call.remove(call_id);
                    maps.by_id.remove(&old.id());
                    Some(old)
                }
                _ => None,
            };
            handle.set_call_id(call_id.to_string());
            maps.by_call.insert(call_id.to_string(), handle.clone());
            maps.by_id.insert(handle.id(), handle.clone());
            old
        };

        if let Some(old) = superseded {
            warn!(
                call_id = %call_id,
                old_session = %old.id(),
                new_session = %handle.id(),
                "replacing existing relay session for call"
            );
            old.close("superseded");
        }
    }

    pub fn lookup_by_call(&self, call_id: &str) -> Option<Arc<SessionHandle>> {
        self.inner.lock().by_call.get(call_id).cloned()
    }

    pub fn lookup_by_id(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        self.inner.lock().by_id.get(&id).cloned()
    }

    /// Remove a session from both mappings. Idempotent; the by-call entry
    /// is only removed if it still points at this session.
    pub fn detach(&self, handle: &Arc<SessionHandle>) {
        let mut maps = self.inner.lock();
        if let Some(call_id) = handle.call_id()
            && let Some(existing) = maps.by_call.get(&call_id)
            && Arc::ptr_eq(existing, handle)
        {
            maps.by_call.remove(&call_id);
        }
        maps.by_id.remove(&handle.id());
    }

    /// Detach and return the session registered for `call_id`, if any.
    /// Control-plane cleanup path; the caller decides the close reason.
    pub fn remove_by_call(&self, call_id: &str) -> Option<Arc<SessionHandle>> {
        let mut maps = self.inner.lock();
        let handle = maps.by_call.remove(call_id)?;
        maps.by_id.remove(&handle.id());
        Some(handle)
    }

    /// Close every live session. Used at shutdown. Returns how many
    /// sessions were closed.
    pub fn close_all(&self, reason: &str) -> usize {
        let handles: Vec<Arc<SessionHandle>> = {
            let mut maps = self.inner.lock();
            maps.by_call.clear();
            maps.by_id.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.close(reason);
        }
        if !handles.is_empty() {
            info!(sessions = handles.len(), reason, "closed all relay sessions");
        }
        handles.len()
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_supersedes_previous_holder() {
        let registry = SessionRegistry::new();
        let first = SessionHandle::new(None);
        let second = SessionHandle::new(None);
        registry.register(first.clone());
        registry.register(second.clone());

        registry.attach(&first, "CALL1");
        registry.attach(&second, "CALL1");

        assert!(first.is_closed());
        assert_eq!(first.close_reason().as_deref(), Some("superseded"));
        assert!(!second.is_closed());

        let registered = registry.lookup_by_call("CALL1").unwrap();
        assert_eq!(registered.id(), second.id());
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup_by_id(first.id()).is_none());
    }

    #[test]
    fn reattach_same_session_is_not_supersession() {
        let registry = SessionRegistry::new();
        let handle = SessionHandle::new(None);
        registry.register(handle.clone());
        registry.attach(&handle, "CALL1");
        registry.attach(&handle, "CALL1");
        assert!(!handle.is_closed());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn detach_is_idempotent_and_scoped() {
        let registry = SessionRegistry::new();
        let handle = SessionHandle::new(Some("CALL1".to_string()));
        registry.register(handle.clone());
        registry.attach(&handle, "CALL1");

        registry.detach(&handle);
        registry.detach(&handle);
        assert!(registry.lookup_by_call("CALL1").is_none());
        assert!(registry.lookup_by_id(handle.id()).is_none());

        // Detaching a stale handle must not evict the call's current owner.
        let replacement = SessionHandle::new(None);
        registry.register(replacement.clone());
        registry.attach(&replacement, "CALL1");
        registry.detach(&handle);
        assert!(registry.lookup_by_call("CALL1").is_some());
    }

    #[test]
    fn remove_by_call_returns_handle_once() {
        let registry = SessionRegistry::new();
        let handle = SessionHandle::new(None);
        registry.register(handle.clone());
        registry.attach(&handle, "CALL1");

        let removed = registry.remove_by_call("CALL1").unwrap();
        assert_eq!(removed.id(), handle.id());
        assert!(registry.remove_by_call("CALL1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn close_all_closes_everything_with_reason() {
        let registry = SessionRegistry::new();
        let attached = SessionHandle::new(None);
        let unattached = SessionHandle::new(None);
        registry.register(attached.clone());
        registry.register(unattached.clone());
        registry.attach(&attached, "CALL1");

        assert_eq!(registry.close_all("shutdown"), 2);
        assert!(registry.is_empty());
        assert_eq!(attached.close_reason().as_deref(), Some("shutdown"));
        assert_eq!(unattached.close_reason().as_deref(), Some("shutdown"));
    }

    #[test]
    fn closed_session_is_never_reregistered() {
        let registry = SessionRegistry::new();
        let live = SessionHandle::new(None);
        registry.register(live.clone());
        registry.attach(&live, "CALL1");

        // A stale handle, already superseded, whose task is still draining
        // buffered frames and processes a late start event.
        let stale = SessionHandle::new(None);
        stale.close("superseded");
        registry.register(stale.clone());
        registry.attach(&stale, "CALL1");

        // The live session keeps the call; the stale one stays out.
        let owner = registry.lookup_by_call("CALL1").unwrap();
        assert_eq!(owner.id(), live.id());
        assert!(!live.is_closed());
        assert!(registry.lookup_by_id(stale.id()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn close_records_first_reason_only() {
        let handle = SessionHandle::new(None);
        handle.close("received close");
        handle.close("shutdown");
        assert_eq!(handle.close_reason().as_deref(), Some("received close"));
        assert!(handle.cancel_token().is_cancelled());
    }
}
