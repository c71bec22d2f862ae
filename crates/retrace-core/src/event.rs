//! Execution events - the flat records emitted by instrumentation probes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel trace id meaning "no trace bound"
pub const UNSET_TRACE_ID: i64 = -1;

/// Sentinel execution-order-index meaning "not yet entered"
pub const UNSET_EOI: i32 = -1;

/// Sentinel execution-stack-size meaning "not yet entered"
pub const UNSET_ESS: i32 = -1;

/// Session id used when no session is bound to the thread of execution
pub const NO_SESSION_ID: &str = "<no-session-id>";

/// An immutable record of one monitored operation execution.
///
/// Probes create exactly one event per completed call. The identity triple
/// `(trace_id, eoi, ess)` carries the correlation metadata the reconstruction
/// side needs to rebuild the call tree; `eoi` is unique within a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Trace this execution belongs to
    pub trace_id: i64,

    /// Execution order index: 0-based position in trace entry order
    pub eoi: i32,

    /// Execution stack size: call depth, root = 0
    pub ess: i32,

    /// Session id propagated from the entry point
    pub session_id: String,

    /// Host the execution ran on
    pub hostname: String,

    /// Component the operation belongs to (e.g. "catalog")
    pub component: String,

    /// Operation signature (e.g. "getBook(long)")
    pub operation: String,

    /// Entry timestamp, nanoseconds
    pub tin: i64,

    /// Exit timestamp, nanoseconds (`tin <= tout`)
    pub tout: i64,

    /// Failure cause if the operation terminated abnormally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ExecutionEvent {
    /// Whether this is the root execution of its trace
    pub fn is_entry_point(&self) -> bool {
        self.eoi == 0 && self.ess == 0
    }

    /// Whether the execution terminated abnormally
    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Duration of the execution in nanoseconds
    pub fn duration_nanos(&self) -> i64 {
        self.tout - self.tin
    }
}

impl fmt::Display for ExecutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}[{}:{}:{}] {}..{}",
            self.component, self.operation, self.trace_id, self.eoi, self.ess, self.tin, self.tout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(eoi: i32, ess: i32) -> ExecutionEvent {
        ExecutionEvent {
            trace_id: 7,
            eoi,
            ess,
            session_id: NO_SESSION_ID.to_string(),
            hostname: "host0".to_string(),
            component: "bookstore".to_string(),
            operation: "searchBook()".to_string(),
            tin: 100,
            tout: 250,
            failure: None,
        }
    }

    #[test]
    fn entry_point_detection() {
        assert!(event(0, 0).is_entry_point());
        assert!(!event(1, 1).is_entry_point());
        assert!(!event(0, 1).is_entry_point());
    }

    #[test]
    fn serde_round_trip() {
        let ev = event(2, 1);
        let json = serde_json::to_string(&ev).unwrap();
        let back: ExecutionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
        // failure is omitted when absent
        assert!(!json.contains("failure"));
    }
}
