//! The enter/exit probe contract instrumentation call sites invoke
//!
//! [`ProbeController::enter`] records a call entry and returns a
//! [`CallScope`] guard. Dropping the guard records the exit, emits the
//! [`ExecutionEvent`], and performs the registry cleanup, so the bookkeeping
//! runs on every exit path of the monitored operation, panics included.

use crate::registry::{CallEntry, CorrelationRegistry, RegistryError};
use crate::session::SessionRegistry;
use retrace_core::config::ProbeSettings;
use retrace_core::event::ExecutionEvent;
use retrace_core::time::TimeSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Process-wide probe state: enabled flag, host identity, clock, event sink
pub struct ProbeController {
    enabled: AtomicBool,
    hostname: String,
    time: Arc<dyn TimeSource>,
    events: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ProbeController {
    /// Build a controller and the receiving end of its event stream
    pub fn new(
        settings: &ProbeSettings,
        time: Arc<dyn TimeSource>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let hostname = settings.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Arc::new(Self {
            enabled: AtomicBool::new(settings.enabled),
            hostname,
            time,
            events: tx,
        });
        (controller, rx)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Administratively disable monitoring for this process. Used when the
    /// correlation protocol breaks, to stop emitting bad data without
    /// affecting the monitored application.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::Relaxed) {
            warn!("monitoring disabled for this process");
        }
    }

    /// Record entry into a monitored operation.
    ///
    /// Returns `None` when monitoring is disabled or the correlation state is
    /// broken; the call site proceeds unmonitored either way.
    pub fn enter(
        self: &Arc<Self>,
        component: impl Into<String>,
        operation: impl Into<String>,
    ) -> Option<CallScope> {
        if !self.is_enabled() {
            return None;
        }
        let entry = match CorrelationRegistry::enter_call() {
            Ok(entry) => entry,
            Err(err @ RegistryError::BrokenContext { .. }) => {
                error!(%err, "correlation protocol error");
                self.disable();
                return None;
            }
        };
        Some(CallScope {
            controller: Arc::clone(self),
            component: component.into(),
            operation: operation.into(),
            session_id: SessionRegistry::recall_session(),
            entry,
            tin: self.time.now_nanos(),
            failure: None,
            finished: false,
        })
    }
}

/// Guard over one monitored call, emitting its event on drop
pub struct CallScope {
    controller: Arc<ProbeController>,
    component: String,
    operation: String,
    session_id: String,
    entry: CallEntry,
    tin: i64,
    failure: Option<String>,
    finished: bool,
}

impl CallScope {
    pub fn trace_id(&self) -> i64 {
        self.entry.trace_id
    }

    pub fn eoi(&self) -> i32 {
        self.entry.eoi
    }

    pub fn ess(&self) -> i32 {
        self.entry.ess
    }

    /// Record a normal exit
    pub fn exit(mut self) {
        self.finish();
    }

    /// Record an abnormal exit with its cause
    pub fn exit_failed(mut self, cause: impl Into<String>) {
        self.failure = Some(cause.into());
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let tout = self.controller.time.now_nanos();
        let event = ExecutionEvent {
            trace_id: self.entry.trace_id,
            eoi: self.entry.eoi,
            ess: self.entry.ess,
            session_id: std::mem::take(&mut self.session_id),
            hostname: self.controller.hostname.clone(),
            component: std::mem::take(&mut self.component),
            operation: std::mem::take(&mut self.operation),
            tin: self.tin,
            tout,
            failure: self.failure.take(),
        };
        if self.controller.events.send(event).is_err() {
            debug!("event sink closed, execution record dropped");
        }

        if self.entry.entrypoint {
            CorrelationRegistry::end_trace();
        } else {
            CorrelationRegistry::exit_call(self.entry.ess);
        }
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        self.finish();
    }
}
