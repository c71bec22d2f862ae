//! The stateful, timeout-aware trace reconstruction engine
//!
//! Per trace id the engine runs the state machine
//! `Pending -> {Complete, Invalid, TimedOut}` (terminal). A stack-discipline
//! violation closes its id the moment it is detected; everything else stays
//! buffered until the trace leaves the pending set - at the event-driven
//! timeout sweep or at graceful termination - where a structurally valid
//! trace is emitted as complete and the rest as incomplete. Deciding
//! completion only on the way out keeps classification and emission a
//! function of the received event set alone, never of arrival order.
//!
//! Trace-id reuse policy: an event for a recently terminated id opens a
//! fresh buffered occurrence, but that occurrence is never emitted as valid
//! - it drains through the incomplete output. Terminal outcomes are
//! remembered for one trace-duration window on the event clock and then
//! forgotten, so the reuse guard does not grow with total traffic.

use retrace_core::config::ReconstructionSettings;
use retrace_core::error::TraceError;
use retrace_core::event::ExecutionEvent;
use retrace_core::metrics::ReconstructionMetrics;
use retrace_core::port::OutputPort;
use retrace_core::trace::{ExecutionTrace, MessageTrace, StackViolation, TraceValidity};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Engine-level errors surfaced to the stage driving the engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine is terminated")]
    Terminated,

    #[error("invalid trace {trace_id} halted the engine")]
    InvalidTraceHalt { trace_id: i64 },
}

/// Why a trace was routed to the invalid output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// The ess sequence violates stack discipline
    StackSkip(StackViolation),
    /// Two events claimed the same eoi; the buffered one was kept
    DuplicateEoi { eoi: i32 },
    /// Conversion to a message trace failed after classification
    Conversion(TraceError),
}

/// A structurally broken trace, with all events received for it so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTrace {
    pub trace: ExecutionTrace,
    pub reason: InvalidReason,
}

/// Why a trace was routed to the incomplete output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteReason {
    /// The trace span exceeded the configured maximum duration
    TimedOut,
    /// The trace was still pending at graceful termination
    Flushed,
}

/// A trace that never completed, with all events received for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteTrace {
    pub trace: ExecutionTrace,
    pub reason: IncompleteReason,
}

/// Terminal outcome of a trace id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceOutcome {
    Complete,
    Invalid,
    TimedOut,
}

struct ClosedTrace {
    outcome: TraceOutcome,
    /// engine clock when the outcome was recorded
    closed_at: i64,
}

struct PendingTrace {
    trace: ExecutionTrace,
    /// set when the id already reached a terminal outcome once
    reopened: bool,
}

/// See the module documentation for the state machine and reuse policy.
pub struct TraceReconstructionEngine {
    max_trace_duration_nanos: i64,
    ignore_invalid_traces: bool,

    pending: HashMap<i64, PendingTrace>,
    /// pending trace ids ordered by their earliest tin
    eviction_queue: BTreeSet<(i64, i64)>,
    /// terminal outcomes by trace id, retained for one duration window
    closed: HashMap<i64, ClosedTrace>,
    /// closed ids ordered by close time, for retention expiry
    closed_expiry: BTreeSet<(i64, i64)>,
    /// largest tin observed across all arrived events
    clock: i64,
    terminated: bool,

    metrics: Arc<ReconstructionMetrics>,

    execution_trace_output: OutputPort<ExecutionTrace>,
    message_trace_output: OutputPort<MessageTrace>,
    invalid_trace_output: OutputPort<InvalidTrace>,
    incomplete_trace_output: OutputPort<IncompleteTrace>,
}

impl TraceReconstructionEngine {
    pub fn new(settings: &ReconstructionSettings) -> Self {
        Self {
            max_trace_duration_nanos: settings.max_trace_duration_nanos(),
            ignore_invalid_traces: settings.ignore_invalid_traces,
            pending: HashMap::new(),
            eviction_queue: BTreeSet::new(),
            closed: HashMap::new(),
            closed_expiry: BTreeSet::new(),
            clock: i64::MIN,
            terminated: false,
            metrics: Arc::new(ReconstructionMetrics::new()),
            execution_trace_output: OutputPort::new("valid-execution-traces"),
            message_trace_output: OutputPort::new("valid-message-traces"),
            invalid_trace_output: OutputPort::new("invalid-traces"),
            incomplete_trace_output: OutputPort::new("incomplete-traces"),
        }
    }

    pub fn metrics(&self) -> Arc<ReconstructionMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn max_trace_duration_nanos(&self) -> i64 {
        self.max_trace_duration_nanos
    }

    /// Valid, complete traces
    pub fn subscribe_execution_traces(&mut self) -> mpsc::UnboundedReceiver<ExecutionTrace> {
        self.execution_trace_output.subscribe()
    }

    /// Message trees derived from valid traces
    pub fn subscribe_message_traces(&mut self) -> mpsc::UnboundedReceiver<MessageTrace> {
        self.message_trace_output.subscribe()
    }

    /// Structurally broken traces
    pub fn subscribe_invalid_traces(&mut self) -> mpsc::UnboundedReceiver<InvalidTrace> {
        self.invalid_trace_output.subscribe()
    }

    /// Timed-out and flushed traces
    pub fn subscribe_incomplete_traces(&mut self) -> mpsc::UnboundedReceiver<IncompleteTrace> {
        self.incomplete_trace_output.subscribe()
    }

    /// Consume one event: buffer, validate, and run the timeout sweep.
    ///
    /// Completion is never decided here; a buffered trace is emitted only
    /// when the sweep or [`terminate`](Self::terminate) removes it, so the
    /// outcome of a trace does not depend on the order its events arrive in.
    /// Never blocks. Errors only after termination, or on the first invalid
    /// trace when `ignore_invalid_traces` is off.
    pub fn on_event(&mut self, event: ExecutionEvent) -> Result<(), EngineError> {
        if self.terminated {
            return Err(EngineError::Terminated);
        }
        ReconstructionMetrics::incr(&self.metrics.events_received);

        let trace_id = event.trace_id;
        let event_tin = event.tin;
        let reopened = self.closed.contains_key(&trace_id);

        let pending = self.pending.entry(trace_id).or_insert_with(|| {
            if reopened {
                debug!(trace_id, "event for terminated trace id, reopening as fresh occurrence");
            }
            PendingTrace {
                trace: ExecutionTrace::new(trace_id),
                reopened,
            }
        });

        let old_min_tin = pending.trace.min_tin();
        match pending.trace.add(event) {
            Ok(()) => {
                let new_min_tin = pending.trace.min_tin();
                if new_min_tin != old_min_tin {
                    if old_min_tin != i64::MAX {
                        self.eviction_queue.remove(&(old_min_tin, trace_id));
                    }
                    self.eviction_queue.insert((new_min_tin, trace_id));
                }
            }
            Err(TraceError::DuplicateEoi { eoi, .. }) => {
                warn!(trace_id, eoi, "duplicate eoi, marking trace invalid");
                ReconstructionMetrics::incr(&self.metrics.events_dropped);
                self.close_invalid(trace_id, InvalidReason::DuplicateEoi { eoi })?;
                self.advance_clock(event_tin);
                return Ok(());
            }
            Err(err) => {
                error!(trace_id, %err, "event rejected");
                ReconstructionMetrics::incr(&self.metrics.events_dropped);
            }
        }

        if let TraceValidity::Invalid(violation) = pending.trace.validate() {
            warn!(
                trace_id,
                eoi = violation.eoi,
                expected = violation.expected,
                found = violation.found,
                "stack discipline violated"
            );
            self.close_invalid(trace_id, InvalidReason::StackSkip(violation))?;
        }

        self.advance_clock(event_tin);
        Ok(())
    }

    /// Drain all pending traces and stop accepting events.
    ///
    /// With `hard == false` every structurally valid pending trace is
    /// emitted as complete and the rest on the incomplete output; with
    /// `hard == true` pending state is dropped silently.
    pub fn terminate(&mut self, hard: bool) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.eviction_queue.clear();

        let mut pending: Vec<(i64, PendingTrace)> = self.pending.drain().collect();
        if hard {
            if !pending.is_empty() {
                debug!(count = pending.len(), "discarding pending traces");
            }
        } else {
            pending.sort_by_key(|(trace_id, _)| *trace_id);
            for (trace_id, entry) in pending {
                if !entry.reopened && entry.trace.validate() == TraceValidity::Valid {
                    self.emit_complete(trace_id, entry.trace);
                } else {
                    debug!(trace_id, "flushing pending trace as incomplete");
                    ReconstructionMetrics::incr(&self.metrics.traces_flushed);
                    self.incomplete_trace_output.emit(IncompleteTrace {
                        trace: entry.trace,
                        reason: IncompleteReason::Flushed,
                    });
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        info!(
            events = snapshot.events_received,
            valid = snapshot.traces_valid,
            invalid = snapshot.traces_invalid,
            timed_out = snapshot.traces_timed_out,
            flushed = snapshot.traces_flushed,
            "trace reconstruction terminated"
        );
    }

    fn emit_complete(&mut self, trace_id: i64, trace: ExecutionTrace) {
        match trace.to_message_trace() {
            Ok(message_trace) => {
                ReconstructionMetrics::incr(&self.metrics.traces_valid);
                debug!(trace_id, events = trace.len(), "trace complete");
                self.execution_trace_output.emit(trace);
                self.message_trace_output.emit(message_trace);
            }
            Err(err) => {
                error!(trace_id, %err, "valid trace failed message conversion");
                ReconstructionMetrics::incr(&self.metrics.traces_invalid);
                self.invalid_trace_output.emit(InvalidTrace {
                    trace,
                    reason: InvalidReason::Conversion(err),
                });
            }
        }
    }

    /// Remember the terminal outcome of an id so late events cannot revive
    /// it. The entry expires one duration window after the close, measured
    /// on the event clock.
    fn record_closed(&mut self, trace_id: i64, outcome: TraceOutcome, min_tin: i64) {
        let closed_at = self.clock.max(min_tin);
        if let Some(previous) = self
            .closed
            .insert(trace_id, ClosedTrace { outcome, closed_at })
        {
            self.closed_expiry.remove(&(previous.closed_at, trace_id));
        }
        self.closed_expiry.insert((closed_at, trace_id));
    }

    fn close_invalid(&mut self, trace_id: i64, reason: InvalidReason) -> Result<(), EngineError> {
        let Some(entry) = self.pending.remove(&trace_id) else {
            return Ok(());
        };
        self.eviction_queue.remove(&(entry.trace.min_tin(), trace_id));
        self.record_closed(trace_id, TraceOutcome::Invalid, entry.trace.min_tin());
        ReconstructionMetrics::incr(&self.metrics.traces_invalid);
        self.invalid_trace_output.emit(InvalidTrace {
            trace: entry.trace,
            reason,
        });

        if self.ignore_invalid_traces {
            Ok(())
        } else {
            error!(trace_id, "halting on invalid trace");
            self.terminated = true;
            Err(EngineError::InvalidTraceHalt { trace_id })
        }
    }

    /// Event-driven timeout sweep: any pending trace whose span measured
    /// against the newest tin exceeds the bound leaves the buffer - emitted
    /// as complete when structurally valid, as incomplete otherwise. Also
    /// expires terminal outcomes older than one retention window.
    fn advance_clock(&mut self, tin: i64) {
        if tin <= self.clock {
            return;
        }
        self.clock = tin;

        while let Some(&(min_tin, trace_id)) = self.eviction_queue.iter().next() {
            if self.clock - min_tin <= self.max_trace_duration_nanos {
                break;
            }
            self.eviction_queue.remove(&(min_tin, trace_id));
            let Some(entry) = self.pending.remove(&trace_id) else {
                continue;
            };
            if !entry.reopened && entry.trace.validate() == TraceValidity::Valid {
                self.record_closed(trace_id, TraceOutcome::Complete, min_tin);
                self.emit_complete(trace_id, entry.trace);
                continue;
            }
            self.record_closed(trace_id, TraceOutcome::TimedOut, min_tin);
            ReconstructionMetrics::incr(&self.metrics.traces_timed_out);
            debug!(
                trace_id,
                span = self.clock - min_tin,
                bound = self.max_trace_duration_nanos,
                "pending trace timed out"
            );
            self.incomplete_trace_output.emit(IncompleteTrace {
                trace: entry.trace,
                reason: IncompleteReason::TimedOut,
            });
        }

        while let Some(&(closed_at, trace_id)) = self.closed_expiry.iter().next() {
            if self.clock.saturating_sub(closed_at) <= self.max_trace_duration_nanos {
                break;
            }
            self.closed_expiry.remove(&(closed_at, trace_id));
            if let Some(entry) = self.closed.remove(&trace_id) {
                debug!(trace_id, outcome = ?entry.outcome, "terminal outcome expired");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_core::event::NO_SESSION_ID;
    use tokio::sync::mpsc::UnboundedReceiver;

    const TRACE_ID: i64 = 62298;
    const MILLION: i64 = 1_000_000;

    fn exec(
        trace_id: i64,
        component: &str,
        operation: &str,
        tin_millis: i64,
        tout_millis: i64,
        eoi: i32,
        ess: i32,
    ) -> ExecutionEvent {
        ExecutionEvent {
            trace_id,
            eoi,
            ess,
            session_id: NO_SESSION_ID.to_string(),
            hostname: "srv0".to_string(),
            component: component.to_string(),
            operation: operation.to_string(),
            tin: tin_millis * MILLION,
            tout: tout_millis * MILLION,
            failure: None,
        }
    }

    /// The well-known bookstore trace, in eoi order
    fn bookstore_events(trace_id: i64) -> Vec<ExecutionEvent> {
        vec![
            exec(trace_id, "bookstore", "searchBook()", 1, 10, 0, 0),
            exec(trace_id, "catalog", "getBook()", 2, 4, 1, 1),
            exec(trace_id, "crm", "getOrders()", 5, 8, 2, 1),
            exec(trace_id, "catalog", "getBook()", 6, 7, 3, 2),
        ]
    }

    struct Harness {
        engine: TraceReconstructionEngine,
        valid: UnboundedReceiver<ExecutionTrace>,
        messages: UnboundedReceiver<MessageTrace>,
        invalid: UnboundedReceiver<InvalidTrace>,
        incomplete: UnboundedReceiver<IncompleteTrace>,
    }

    fn harness(settings: ReconstructionSettings) -> Harness {
        let mut engine = TraceReconstructionEngine::new(&settings);
        Harness {
            valid: engine.subscribe_execution_traces(),
            messages: engine.subscribe_message_traces(),
            invalid: engine.subscribe_invalid_traces(),
            incomplete: engine.subscribe_incomplete_traces(),
            engine,
        }
    }

    fn default_harness() -> Harness {
        harness(ReconstructionSettings::default())
    }

    fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(value) = rx.try_recv() {
            out.push(value);
        }
        out
    }

    #[test]
    fn valid_trace_added_out_of_order_is_reconstructed_once() {
        let mut h = default_harness();
        let events = bookstore_events(TRACE_ID);
        for i in [3usize, 2, 0, 1] {
            h.engine.on_event(events[i].clone()).unwrap();
        }
        h.engine.terminate(false);

        let valid = drain(&mut h.valid);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].len(), 4);
        assert_eq!(valid[0].trace_id(), TRACE_ID);

        let messages = drain(&mut h.messages);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].len(), 8);

        assert!(drain(&mut h.invalid).is_empty());
        assert!(drain(&mut h.incomplete).is_empty());
    }

    #[test]
    fn root_first_feed_emits_one_full_valid_trace() {
        // a sorted replay delivers the root before its children; the engine
        // must not emit a one-event trace the moment the root validates
        let mut h = default_harness();
        for event in bookstore_events(TRACE_ID) {
            h.engine.on_event(event).unwrap();
            assert!(drain(&mut h.valid).is_empty());
        }
        h.engine.terminate(false);

        let valid = drain(&mut h.valid);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].len(), 4);
        assert_eq!(drain(&mut h.messages).len(), 1);
        assert!(drain(&mut h.incomplete).is_empty());
    }

    #[test]
    fn valid_trace_in_exit_order_is_reconstructed_once() {
        // probes record at exit, so the root arrives last
        let mut h = default_harness();
        let events = bookstore_events(TRACE_ID);
        for i in [1usize, 3, 2, 0] {
            h.engine.on_event(events[i].clone()).unwrap();
        }
        h.engine.terminate(false);

        assert_eq!(drain(&mut h.valid).len(), 1);
        assert_eq!(drain(&mut h.messages).len(), 1);
        assert!(drain(&mut h.invalid).is_empty());
    }

    #[test]
    fn completed_trace_is_emitted_by_the_sweep() {
        let settings = ReconstructionSettings {
            max_trace_duration_ms: 20,
            ..Default::default()
        };
        let mut h = harness(settings);
        for event in bookstore_events(TRACE_ID) {
            h.engine.on_event(event).unwrap();
        }
        assert!(drain(&mut h.valid).is_empty());

        // min_tin is 1ms; an event at 30ms pushes the span past the bound
        h.engine
            .on_event(exec(TRACE_ID + 1, "bookstore", "searchBook()", 30, 31, 0, 0))
            .unwrap();

        let valid = drain(&mut h.valid);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].trace_id(), TRACE_ID);
        assert_eq!(valid[0].len(), 4);
        assert!(drain(&mut h.incomplete).is_empty());
    }

    #[test]
    fn corrupted_ess_yields_exactly_one_invalid_trace() {
        let mut h = default_harness();
        let mut events = bookstore_events(TRACE_ID);
        events[1].ess = 3;
        for i in [3usize, 2, 0, 1] {
            h.engine.on_event(events[i].clone()).unwrap();
        }

        let invalid = drain(&mut h.invalid);
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].trace.len(), 4);
        assert_eq!(
            invalid[0].reason,
            InvalidReason::StackSkip(StackViolation {
                eoi: 1,
                expected: 1,
                found: 3
            })
        );

        assert!(drain(&mut h.valid).is_empty());
        assert!(drain(&mut h.messages).is_empty());
    }

    #[test]
    fn duplicate_eoi_is_surfaced_not_overwritten() {
        let mut h = default_harness();
        let metrics = h.engine.metrics();
        let events = bookstore_events(TRACE_ID);
        h.engine.on_event(events[1].clone()).unwrap();
        h.engine.on_event(events[2].clone()).unwrap();

        let mut duplicate = events[1].clone();
        duplicate.ess = 2;
        h.engine.on_event(duplicate).unwrap();

        let invalid = drain(&mut h.invalid);
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].reason, InvalidReason::DuplicateEoi { eoi: 1 });
        // the originally buffered event survived, the colliding one was dropped
        let kept: Vec<i32> = invalid[0].trace.events().map(|e| e.ess).collect();
        assert_eq!(kept, vec![1, 1]);
        assert_eq!(metrics.snapshot().events_dropped, 1);
    }

    #[test]
    fn incomplete_trace_times_out_on_later_event() {
        // bound chosen so the trigger event pushes the pending span past it
        let settings = ReconstructionSettings {
            max_trace_duration_ms: 20,
            ..Default::default()
        };
        let mut h = harness(settings);

        // no root: eois 1..3 only
        let events = bookstore_events(TRACE_ID);
        for ev in &events[1..] {
            h.engine.on_event(ev.clone()).unwrap();
        }
        assert!(drain(&mut h.incomplete).is_empty());

        // unrelated event inside the bound: nothing evicted yet
        h.engine
            .on_event(exec(TRACE_ID + 1, "bookstore", "searchBook()", 20, 21, 0, 0))
            .unwrap();
        assert!(drain(&mut h.incomplete).is_empty());

        // min_tin of the pending trace is 2ms; 23ms exceeds 2ms + 20ms
        h.engine
            .on_event(exec(TRACE_ID + 2, "bookstore", "searchBook()", 23, 24, 0, 0))
            .unwrap();

        let incomplete = drain(&mut h.incomplete);
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].reason, IncompleteReason::TimedOut);
        assert_eq!(incomplete[0].trace.trace_id(), TRACE_ID);
        assert_eq!(incomplete[0].trace.len(), 3);
    }

    #[test]
    fn eviction_waits_for_the_bound_to_be_exceeded() {
        let settings = ReconstructionSettings {
            max_trace_duration_ms: 20,
            ..Default::default()
        };
        let mut h = harness(settings);
        h.engine
            .on_event(exec(TRACE_ID, "catalog", "getBook()", 2, 4, 1, 1))
            .unwrap();

        // exactly at the bound: 22ms - 2ms == 20ms, not yet evicted
        h.engine
            .on_event(exec(TRACE_ID + 1, "bookstore", "searchBook()", 22, 23, 0, 0))
            .unwrap();
        assert!(drain(&mut h.incomplete).is_empty());
    }

    #[test]
    fn late_event_for_timed_out_id_never_completes() {
        // mirrors the classic reconstruction scenario: after the incomplete
        // trace times out, its missing root arrives and must not produce a
        // valid trace
        let settings = ReconstructionSettings {
            max_trace_duration_ms: 20,
            ..Default::default()
        };
        let mut h = harness(settings);

        let events = bookstore_events(TRACE_ID);
        for ev in &events[1..] {
            h.engine.on_event(ev.clone()).unwrap();
        }
        // trigger the sweep
        h.engine
            .on_event(exec(TRACE_ID + 1, "bookstore", "searchBook()", 30, 31, 0, 0))
            .unwrap();
        assert_eq!(drain(&mut h.incomplete).len(), 1);

        // the completing root arrives too late
        h.engine.on_event(events[0].clone()).unwrap();
        assert!(drain(&mut h.valid).is_empty());
        h.engine.terminate(false);

        // only the trigger trace completes; the reopened occurrence drains
        let valid = drain(&mut h.valid);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].trace_id(), TRACE_ID + 1);
        let flushed = drain(&mut h.incomplete);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].reason, IncompleteReason::Flushed);
        assert_eq!(flushed[0].trace.trace_id(), TRACE_ID);
        assert_eq!(flushed[0].trace.len(), 1);
    }

    #[test]
    fn reuse_after_completion_is_not_valid_again() {
        let settings = ReconstructionSettings {
            max_trace_duration_ms: 20,
            ..Default::default()
        };
        let mut h = harness(settings);
        for event in bookstore_events(TRACE_ID) {
            h.engine.on_event(event).unwrap();
        }
        // the sweep completes the trace
        h.engine
            .on_event(exec(TRACE_ID + 1, "bookstore", "searchBook()", 30, 31, 0, 0))
            .unwrap();
        assert_eq!(drain(&mut h.valid).len(), 1);

        // same id again, complete shape, inside the retention window
        h.engine
            .on_event(exec(TRACE_ID, "bookstore", "searchBook()", 40, 41, 0, 0))
            .unwrap();
        assert!(drain(&mut h.valid).is_empty());

        h.engine.terminate(false);
        // the trigger trace completes; the reopened occurrence is flushed
        assert_eq!(drain(&mut h.valid).len(), 1);
        let flushed = drain(&mut h.incomplete);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].reason, IncompleteReason::Flushed);
        assert_eq!(flushed[0].trace.trace_id(), TRACE_ID);
        assert_eq!(flushed[0].trace.len(), 1);
    }

    #[test]
    fn terminal_outcomes_expire_after_the_retention_window() {
        let settings = ReconstructionSettings {
            max_trace_duration_ms: 20,
            ..Default::default()
        };
        let mut h = harness(settings);
        let mut broken = bookstore_events(TRACE_ID);
        broken[1].ess = 3;
        for i in [3usize, 2, 0, 1] {
            h.engine.on_event(broken[i].clone()).unwrap();
        }
        assert_eq!(drain(&mut h.invalid).len(), 1);

        // advance the clock far past the close; the outcome is forgotten
        h.engine
            .on_event(exec(TRACE_ID + 1, "bookstore", "searchBook()", 100, 101, 0, 0))
            .unwrap();

        // the id now behaves as a brand-new trace and can complete
        h.engine
            .on_event(exec(TRACE_ID, "bookstore", "searchBook()", 200, 201, 0, 0))
            .unwrap();
        h.engine.terminate(false);

        let valid = drain(&mut h.valid);
        assert!(valid.iter().any(|t| t.trace_id() == TRACE_ID));
        assert!(drain(&mut h.incomplete).is_empty());
    }

    #[test]
    fn invalid_traces_do_not_affect_other_trace_ids() {
        let mut h = default_harness();
        let mut broken = bookstore_events(TRACE_ID);
        broken[1].ess = 3;
        let good = bookstore_events(TRACE_ID + 1);

        // interleave the two traces
        for i in 0..4 {
            h.engine.on_event(broken[3 - i].clone()).unwrap();
            h.engine.on_event(good[3 - i].clone()).unwrap();
        }
        h.engine.terminate(false);

        assert_eq!(drain(&mut h.invalid).len(), 1);
        let valid = drain(&mut h.valid);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].trace_id(), TRACE_ID + 1);
        assert!(drain(&mut h.incomplete).is_empty());
    }

    #[test]
    fn halting_mode_stops_on_first_invalid_trace() {
        let settings = ReconstructionSettings {
            ignore_invalid_traces: false,
            ..Default::default()
        };
        let mut h = harness(settings);
        let mut events = bookstore_events(TRACE_ID);
        events[1].ess = 3;

        h.engine.on_event(events[1].clone()).unwrap();
        let err = h.engine.on_event(events[0].clone()).unwrap_err();
        assert_eq!(err, EngineError::InvalidTraceHalt { trace_id: TRACE_ID });

        // the invalid trace was still reported
        assert_eq!(drain(&mut h.invalid).len(), 1);
        // and nothing further is accepted
        assert_eq!(
            h.engine.on_event(events[2].clone()).unwrap_err(),
            EngineError::Terminated
        );
    }

    #[test]
    fn graceful_terminate_flushes_pending_traces() {
        let mut h = default_harness();
        let events = bookstore_events(TRACE_ID);
        h.engine.on_event(events[1].clone()).unwrap();
        h.engine
            .on_event(exec(TRACE_ID + 1, "crm", "getOrders()", 3, 5, 2, 1))
            .unwrap();

        h.engine.terminate(false);
        let flushed = drain(&mut h.incomplete);
        assert_eq!(flushed.len(), 2);
        // deterministic flush order by trace id
        assert_eq!(flushed[0].trace.trace_id(), TRACE_ID);
        assert_eq!(flushed[1].trace.trace_id(), TRACE_ID + 1);
        assert!(flushed.iter().all(|t| t.reason == IncompleteReason::Flushed));
    }

    #[test]
    fn hard_terminate_discards_pending_traces() {
        let mut h = default_harness();
        h.engine
            .on_event(exec(TRACE_ID, "catalog", "getBook()", 2, 4, 1, 1))
            .unwrap();

        h.engine.terminate(true);
        assert!(drain(&mut h.incomplete).is_empty());
        assert_eq!(
            h.engine
                .on_event(exec(TRACE_ID, "crm", "getOrders()", 5, 8, 2, 1))
                .unwrap_err(),
            EngineError::Terminated
        );
    }

    #[test]
    fn metrics_track_outcomes() {
        let settings = ReconstructionSettings {
            max_trace_duration_ms: 20,
            ..Default::default()
        };
        let mut h = harness(settings);
        let metrics = h.engine.metrics();

        let good = bookstore_events(TRACE_ID);
        for i in [3usize, 2, 0, 1] {
            h.engine.on_event(good[i].clone()).unwrap();
        }
        let mut broken = bookstore_events(TRACE_ID + 1);
        broken[1].ess = 3;
        for i in [3usize, 2, 0, 1] {
            h.engine.on_event(broken[i].clone()).unwrap();
        }
        // a lone non-root event, then a far-future trigger to time it out
        h.engine
            .on_event(exec(TRACE_ID + 2, "catalog", "getBook()", 2, 4, 1, 1))
            .unwrap();
        h.engine
            .on_event(exec(TRACE_ID + 3, "bookstore", "searchBook()", 100, 101, 0, 0))
            .unwrap();
        h.engine.terminate(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_received, 10);
        assert_eq!(snapshot.traces_valid, 2); // bookstore + trigger
        assert_eq!(snapshot.traces_invalid, 1);
        assert_eq!(snapshot.traces_timed_out, 1);
        assert_eq!(snapshot.traces_flushed, 0);
    }
}
