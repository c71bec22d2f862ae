//! Retrace Probe - instrumentation-side trace correlation
//!
//! Call sites wrap monitored operations in a [`CallScope`] obtained from the
//! [`ProbeController`]. The scope drives the per-thread
//! [`CorrelationRegistry`], stamps entry/exit timestamps, and emits one
//! [`retrace_core::ExecutionEvent`] per completed call on every exit path.
//! [`propagation`] carries the correlation triple across process boundaries.

pub mod probe;
pub mod propagation;
pub mod registry;
pub mod session;

pub use probe::{CallScope, ProbeController};
pub use propagation::CorrelationContext;
pub use registry::{CallEntry, CorrelationRegistry, RegistryError};
pub use session::SessionRegistry;
