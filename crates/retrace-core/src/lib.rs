//! Retrace Core - Event model, trace assembly, and dataflow contracts
//!
//! This crate provides the foundational types for the Retrace trace
//! reconstruction toolkit:
//!
//! - **Events**: immutable operation execution records with correlation metadata
//! - **Traces**: per-trace-id assembly, structural validation, message trees
//! - **Ports**: the named input/output dataflow contract analysis stages plug into
//! - **Config**: TOML configuration shared by probe and reconstruction sides

pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod port;
pub mod time;
pub mod trace;

// Re-export commonly used types
pub use config::{MonitorConfig, ProbeSettings, ReconstructionSettings};
pub use error::{PropagationError, TraceError};
pub use event::{ExecutionEvent, NO_SESSION_ID, UNSET_EOI, UNSET_ESS, UNSET_TRACE_ID};
pub use port::{AnalysisStage, OutputPort};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use trace::{ExecutionTrace, Message, MessageTrace, StackViolation, TraceValidity};

/// Retrace version
pub const RETRACE_VERSION: &str = env!("CARGO_PKG_VERSION");
