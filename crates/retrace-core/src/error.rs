//! Error taxonomy shared by the probe and reconstruction sides

use thiserror::Error;

/// Errors raised while assembling or converting a trace
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error("trace {trace_id}: duplicate eoi {eoi}")]
    DuplicateEoi { trace_id: i64, eoi: i32 },

    #[error("trace {trace_id}: event belongs to trace {event_trace_id}")]
    TraceIdMismatch { trace_id: i64, event_trace_id: i64 },

    #[error("trace {trace_id}: expected eoi {expected} but found {found}")]
    EoiGap {
        trace_id: i64,
        expected: i32,
        found: i32,
    },

    #[error("trace {trace_id}: ess skip at eoi {eoi} (expected at most {expected}, found {found})")]
    EssSkip {
        trace_id: i64,
        eoi: i32,
        expected: i32,
        found: i32,
    },

    #[error("trace {trace_id}: missing entry execution (eoi 0, ess 0)")]
    MissingRoot { trace_id: i64 },
}

/// Errors raised while decoding a cross-process correlation header
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PropagationError {
    #[error("malformed correlation header: expected 4 fields, found {0}")]
    FieldCount(usize),

    #[error("malformed correlation header field {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}
