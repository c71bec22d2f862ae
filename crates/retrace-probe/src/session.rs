//! Per-thread session identity
//!
//! Sessions group the traces of one client interaction. Entry-point adapters
//! (HTTP handlers, job runners) bind the session around the request; traces
//! started on an unbound thread carry [`NO_SESSION_ID`].

use retrace_core::event::NO_SESSION_ID;
use std::cell::RefCell;

thread_local! {
    static SESSION_ID: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Handle over the calling thread's session slot
pub struct SessionRegistry;

impl SessionRegistry {
    /// Bind a session id to the calling thread
    pub fn store_session(session_id: String) {
        SESSION_ID.with_borrow_mut(|slot| *slot = Some(session_id));
    }

    /// Bind and return a freshly generated session id
    pub fn begin_session() -> String {
        let session_id = ulid::Ulid::new().to_string();
        Self::store_session(session_id.clone());
        session_id
    }

    /// Session id bound to the calling thread, or [`NO_SESSION_ID`]
    pub fn recall_session() -> String {
        SESSION_ID.with_borrow(|slot| {
            slot.clone()
                .unwrap_or_else(|| NO_SESSION_ID.to_string())
        })
    }

    /// Unbind the calling thread's session
    pub fn unset_session() {
        SESSION_ID.with_borrow_mut(|slot| *slot = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_thread_reports_no_session() {
        assert_eq!(SessionRegistry::recall_session(), NO_SESSION_ID);
    }

    #[test]
    fn stored_session_is_recalled_until_unset() {
        SessionRegistry::store_session("sess-1".to_string());
        assert_eq!(SessionRegistry::recall_session(), "sess-1");
        SessionRegistry::unset_session();
        assert_eq!(SessionRegistry::recall_session(), NO_SESSION_ID);
    }

    #[test]
    fn begin_session_generates_distinct_ids() {
        let a = SessionRegistry::begin_session();
        SessionRegistry::unset_session();
        let b = SessionRegistry::begin_session();
        SessionRegistry::unset_session();
        assert_ne!(a, b);
    }
}
