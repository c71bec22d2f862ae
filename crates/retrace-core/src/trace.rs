//! Trace assembly - grouping execution events into ordered call trees
//!
//! An [`ExecutionTrace`] accumulates the flat [`ExecutionEvent`]s sharing one
//! trace id, in arbitrary arrival order, and exposes a view sorted by eoi.
//! [`ExecutionTrace::validate`] classifies the buffered set against the stack
//! discipline invariants; [`ExecutionTrace::to_message_trace`] converts a
//! structurally valid trace into the ordered call/reply [`MessageTrace`].

use crate::error::TraceError;
use crate::event::ExecutionEvent;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{BTreeMap, Entry};

/// Classification of a buffered event set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceValidity {
    /// Root present, eoi sequence contiguous, stack discipline holds
    Valid,
    /// Stack discipline violated; the trace is broken regardless of
    /// whether further events arrive
    Invalid(StackViolation),
    /// Root or intermediate events still missing
    Incomplete,
}

/// The position and nature of a stack discipline violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackViolation {
    /// eoi of the offending event
    pub eoi: i32,
    /// Maximum ess permitted at this position
    pub expected: i32,
    /// ess actually found
    pub found: i32,
}

/// Events of one trace, sortable by eoi
///
/// Insertion order is irrelevant; duplicate eois are rejected on `add`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    trace_id: i64,
    events: BTreeMap<i32, ExecutionEvent>,
    min_tin: i64,
    max_tout: i64,
}

impl ExecutionTrace {
    pub fn new(trace_id: i64) -> Self {
        Self {
            trace_id,
            events: BTreeMap::new(),
            min_tin: i64::MAX,
            max_tout: i64::MIN,
        }
    }

    pub fn trace_id(&self) -> i64 {
        self.trace_id
    }

    /// Insert an event into the trace.
    ///
    /// Fails if the event carries a foreign trace id or if an event with the
    /// same eoi is already present (the existing event is never overwritten).
    pub fn add(&mut self, event: ExecutionEvent) -> Result<(), TraceError> {
        if event.trace_id != self.trace_id {
            return Err(TraceError::TraceIdMismatch {
                trace_id: self.trace_id,
                event_trace_id: event.trace_id,
            });
        }
        match self.events.entry(event.eoi) {
            Entry::Occupied(_) => Err(TraceError::DuplicateEoi {
                trace_id: self.trace_id,
                eoi: event.eoi,
            }),
            Entry::Vacant(slot) => {
                self.min_tin = self.min_tin.min(event.tin);
                self.max_tout = self.max_tout.max(event.tout);
                slot.insert(event);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Read-only view of the events, sorted by eoi
    pub fn events(&self) -> impl Iterator<Item = &ExecutionEvent> {
        self.events.values()
    }

    /// Earliest entry timestamp over all contained events
    pub fn min_tin(&self) -> i64 {
        self.min_tin
    }

    /// Latest exit timestamp over all contained events
    pub fn max_tout(&self) -> i64 {
        self.max_tout
    }

    /// Span covered by the contained events, nanoseconds
    pub fn duration_nanos(&self) -> i64 {
        self.max_tout - self.min_tin
    }

    /// Classify the buffered event set.
    ///
    /// The result depends only on the set of events, not on arrival order.
    /// Structural violations take precedence over incompleteness: skip checks
    /// run on adjacent-eoi pairs, so they are meaningful on partial data where
    /// intermediate events are still missing.
    pub fn validate(&self) -> TraceValidity {
        if self.events.is_empty() {
            return TraceValidity::Incomplete;
        }

        for event in self.events.values() {
            if event.eoi == 0 && event.ess != 0 {
                return TraceValidity::Invalid(StackViolation {
                    eoi: 0,
                    expected: 0,
                    found: event.ess,
                });
            }
            // depth 0 is reserved for the single entry execution
            if event.eoi > 0 && event.ess <= 0 {
                return TraceValidity::Invalid(StackViolation {
                    eoi: event.eoi,
                    expected: 1,
                    found: event.ess,
                });
            }
        }

        let mut prev: Option<&ExecutionEvent> = None;
        for event in self.events.values() {
            if let Some(prev) = prev {
                // a directly following entry may descend at most one level
                if event.eoi == prev.eoi + 1 && event.ess > prev.ess + 1 {
                    return TraceValidity::Invalid(StackViolation {
                        eoi: event.eoi,
                        expected: prev.ess + 1,
                        found: event.ess,
                    });
                }
            }
            prev = Some(event);
        }

        if !self.events.contains_key(&0) {
            return TraceValidity::Incomplete;
        }
        let contiguous = self
            .events
            .keys()
            .next_back()
            .map(|max_eoi| *max_eoi as usize + 1 == self.events.len())
            .unwrap_or(false);
        if !contiguous {
            return TraceValidity::Incomplete;
        }

        TraceValidity::Valid
    }

    /// Convert the trace into its ordered call/reply message representation.
    ///
    /// Only meaningful on a [`TraceValidity::Valid`] trace; a missing root,
    /// an eoi gap, or a stack skip yields the corresponding [`TraceError`].
    pub fn to_message_trace(&self) -> Result<MessageTrace, TraceError> {
        if self.events.is_empty() {
            return Err(TraceError::MissingRoot {
                trace_id: self.trace_id,
            });
        }

        let mut messages = Vec::with_capacity(self.events.len() * 2);
        let mut stack: Vec<&ExecutionEvent> = Vec::new();
        let mut expected_eoi = 0;

        for event in self.events.values() {
            if event.eoi != expected_eoi {
                return Err(TraceError::EoiGap {
                    trace_id: self.trace_id,
                    expected: expected_eoi,
                    found: event.eoi,
                });
            }
            expected_eoi += 1;

            if event.eoi > 0 && event.ess <= 0 {
                return Err(TraceError::EssSkip {
                    trace_id: self.trace_id,
                    eoi: event.eoi,
                    expected: 1,
                    found: event.ess,
                });
            }

            // unwind calls that completed before this one started
            while let Some(top) = stack.last().copied() {
                if top.ess < event.ess {
                    break;
                }
                stack.pop();
                messages.push(Message::reply(top, stack.last().copied()));
            }

            let sender = stack.last().copied();
            let expected_ess = sender.map(|parent| parent.ess + 1).unwrap_or(0);
            if event.ess != expected_ess {
                return Err(TraceError::EssSkip {
                    trace_id: self.trace_id,
                    eoi: event.eoi,
                    expected: expected_ess,
                    found: event.ess,
                });
            }

            messages.push(Message::call(sender, event));
            stack.push(event);
        }

        while let Some(top) = stack.pop() {
            messages.push(Message::reply(top, stack.last().copied()));
        }

        Ok(MessageTrace {
            trace_id: self.trace_id,
            messages,
        })
    }
}

/// Derived, read-only call/reply tree of a validated trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTrace {
    pub trace_id: i64,
    pub messages: Vec<Message>,
}

impl MessageTrace {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// One synchronous call or reply edge in a message trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,

    /// Call messages carry the callee's tin, replies the callee's tout
    pub timestamp: i64,

    /// Sending execution; `None` is the origin outside the trace
    pub sender: Option<MessageEndpoint>,

    /// Receiving execution; `None` is the origin outside the trace
    pub receiver: Option<MessageEndpoint>,
}

impl Message {
    fn call(sender: Option<&ExecutionEvent>, receiver: &ExecutionEvent) -> Self {
        Self {
            kind: MessageKind::Call,
            timestamp: receiver.tin,
            sender: sender.map(MessageEndpoint::from_event),
            receiver: Some(MessageEndpoint::from_event(receiver)),
        }
    }

    fn reply(sender: &ExecutionEvent, receiver: Option<&ExecutionEvent>) -> Self {
        Self {
            kind: MessageKind::Reply,
            timestamp: sender.tout,
            sender: Some(MessageEndpoint::from_event(sender)),
            receiver: receiver.map(MessageEndpoint::from_event),
        }
    }
}

/// Direction of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Call,
    Reply,
}

/// An execution referenced from a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEndpoint {
    pub eoi: i32,
    pub component: String,
    pub operation: String,
}

impl MessageEndpoint {
    fn from_event(event: &ExecutionEvent) -> Self {
        Self {
            eoi: event.eoi,
            component: event.component.clone(),
            operation: event.operation.clone(),
        }
    }
}
