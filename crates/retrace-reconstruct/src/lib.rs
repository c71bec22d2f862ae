//! Retrace Reconstruct - rebuilding call trees from flat event streams
//!
//! The [`TraceReconstructionEngine`] buffers in-flight traces by trace id,
//! closes structurally broken ones the moment the violation shows, and
//! decides completion when a trace leaves the buffer - at the timeout sweep
//! or at termination - routing each outcome to one of four output ports.
//! [`ReconstructionStage`] adapts the engine to the async dataflow port
//! contract.

pub mod engine;
pub mod stage;

pub use engine::{
    EngineError, IncompleteReason, IncompleteTrace, InvalidReason, InvalidTrace,
    TraceReconstructionEngine,
};
pub use stage::ReconstructionStage;
