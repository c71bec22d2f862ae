//! Per-thread correlation state - trace id, eoi, and ess bookkeeping
//!
//! Each thread of execution owns its own `(trace_id, eoi, ess)` slot, so the
//! hot path needs no cross-thread synchronization; only the global trace-id
//! allocator is atomic. The slot is acquired by the first monitored call on a
//! thread (or by importing a remote context) and released when the entry call
//! exits.

use crate::propagation::CorrelationContext;
use crate::session::SessionRegistry;
use retrace_core::event::{UNSET_EOI, UNSET_ESS, UNSET_TRACE_ID};
use std::cell::Cell;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

static NEXT_TRACE_ID: AtomicI64 = AtomicI64::new(1);

thread_local! {
    static TRACE_ID: Cell<i64> = const { Cell::new(UNSET_TRACE_ID) };
    static EOI: Cell<i32> = const { Cell::new(UNSET_EOI) };
    static ESS: Cell<i32> = const { Cell::new(UNSET_ESS) };
}

/// Correlation protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A continuation was attempted while eoi/ess read as unset. This means
    /// context propagation broke somewhere upstream; the caller should treat
    /// it as a signal to disable monitoring, not as a reason to fail the
    /// monitored operation.
    #[error("correlation counters unset on bound trace {trace_id} (eoi {eoi}, ess {ess})")]
    BrokenContext { trace_id: i64, eoi: i32, ess: i32 },
}

/// What a probe learned on call entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEntry {
    pub trace_id: i64,
    /// eoi of this call
    pub eoi: i32,
    /// depth of this call
    pub ess: i32,
    /// whether this call began the trace on this thread
    pub entrypoint: bool,
}

/// Handle over the calling thread's correlation slot
pub struct CorrelationRegistry;

impl CorrelationRegistry {
    /// Trace id bound to the calling thread, if any
    pub fn current_trace_id() -> Option<i64> {
        let id = TRACE_ID.get();
        (id != UNSET_TRACE_ID).then_some(id)
    }

    /// Allocate a fresh trace id and bind it to the calling thread.
    ///
    /// The root call runs at depth 0; the counters are stored so the next
    /// nested call observes eoi 1 and ess 1.
    pub fn begin_trace() -> i64 {
        let trace_id = NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed);
        TRACE_ID.set(trace_id);
        EOI.set(0);
        ESS.set(1);
        trace_id
    }

    /// Record a call entry on the calling thread.
    ///
    /// Begins a new trace when none is bound. On a bound trace the eoi is
    /// pre-incremented (this call's index) and the ess post-incremented (the
    /// returned value is this call's depth, the stored value the depth of the
    /// next nested call).
    pub fn enter_call() -> Result<CallEntry, RegistryError> {
        let trace_id = TRACE_ID.get();
        if trace_id == UNSET_TRACE_ID {
            let trace_id = Self::begin_trace();
            return Ok(CallEntry {
                trace_id,
                eoi: 0,
                ess: 0,
                entrypoint: true,
            });
        }

        let stored_eoi = EOI.get();
        let stored_ess = ESS.get();
        if stored_eoi == UNSET_EOI || stored_ess == UNSET_ESS {
            return Err(RegistryError::BrokenContext {
                trace_id,
                eoi: stored_eoi,
                ess: stored_ess,
            });
        }

        let eoi = stored_eoi + 1;
        EOI.set(eoi);
        ESS.set(stored_ess + 1);
        Ok(CallEntry {
            trace_id,
            eoi,
            ess: stored_ess,
            entrypoint: false,
        })
    }

    /// Record the exit of a call at depth `ess`, so the next sibling call
    /// observes the correct depth
    pub fn exit_call(ess: i32) {
        ESS.set(ess);
    }

    /// Release the calling thread's correlation slot. Called exactly once
    /// per entry call, on every exit path.
    pub fn end_trace() {
        TRACE_ID.set(UNSET_TRACE_ID);
        EOI.set(UNSET_EOI);
        ESS.set(UNSET_ESS);
    }

    /// Snapshot the calling thread's correlation state for propagation.
    ///
    /// Inside a [`crate::CallScope`] the stored ess is already the depth the
    /// callee should continue at, so the snapshot doubles as the outbound
    /// request header.
    pub fn export_context() -> Option<CorrelationContext> {
        let trace_id = Self::current_trace_id()?;
        Some(CorrelationContext {
            trace_id,
            session_id: SessionRegistry::recall_session(),
            eoi: EOI.get(),
            ess: ESS.get(),
        })
    }

    /// Bind the calling thread to a propagated context instead of allocating
    /// a fresh trace
    pub fn import_context(ctx: &CorrelationContext) {
        TRACE_ID.set(ctx.trace_id);
        EOI.set(ctx.eoi);
        ESS.set(ctx.ess);
        SessionRegistry::store_session(ctx.session_id.clone());
    }

    /// Adopt the eoi a remote callee advanced to, read back from its
    /// response header
    pub fn adopt_eoi(eoi: i32) {
        EOI.set(eoi);
    }
}
