//! Stage adapter - runs the reconstruction engine on an async input channel
//!
//! The engine itself is synchronous; [`ReconstructionStage`] owns it, feeds it
//! from a bounded event channel, and manages the run/terminate lifecycle.
//! Closing the input (dropping every sender) drains the engine gracefully, as
//! does a soft stop; a hard stop discards whatever is still pending.

use crate::engine::{IncompleteTrace, InvalidTrace, TraceReconstructionEngine};
use retrace_core::config::ReconstructionSettings;
use retrace_core::event::ExecutionEvent;
use retrace_core::metrics::ReconstructionMetrics;
use retrace_core::port::{AnalysisStage, StageError, StageResult};
use retrace_core::trace::{ExecutionTrace, MessageTrace};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{error, info};

/// Async front end of the [`TraceReconstructionEngine`]
pub struct ReconstructionStage {
    /// Present until `start` moves it into the processing task
    engine: Option<TraceReconstructionEngine>,
    metrics: Arc<ReconstructionMetrics>,
    input_tx: Option<mpsc::Sender<ExecutionEvent>>,
    input_rx: Option<mpsc::Receiver<ExecutionEvent>>,
    running: Arc<RwLock<bool>>,
    /// Shutdown signal; the payload is the `hard` flag
    shutdown_tx: Option<broadcast::Sender<bool>>,
}

impl ReconstructionStage {
    pub fn new(settings: &ReconstructionSettings) -> Self {
        let engine = TraceReconstructionEngine::new(settings);
        let metrics = engine.metrics();
        let (input_tx, input_rx) = mpsc::channel(settings.event_buffer_size);
        Self {
            engine: Some(engine),
            metrics,
            input_tx: Some(input_tx),
            input_rx: Some(input_rx),
            running: Arc::new(RwLock::new(false)),
            shutdown_tx: None,
        }
    }

    pub fn metrics(&self) -> Arc<ReconstructionMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Take the event sender feeding this stage. The stage keeps no clone, so
    /// dropping every handle closes the input and drains the engine.
    ///
    /// Returns `None` when the sender was already taken.
    pub fn take_input(&mut self) -> Option<mpsc::Sender<ExecutionEvent>> {
        self.input_tx.take()
    }

    /// Subscribe to completed, valid traces. `None` once the stage started.
    pub fn subscribe_execution_traces(&mut self) -> Option<mpsc::UnboundedReceiver<ExecutionTrace>> {
        self.engine
            .as_mut()
            .map(TraceReconstructionEngine::subscribe_execution_traces)
    }

    /// Subscribe to the message form of completed traces
    pub fn subscribe_message_traces(&mut self) -> Option<mpsc::UnboundedReceiver<MessageTrace>> {
        self.engine
            .as_mut()
            .map(TraceReconstructionEngine::subscribe_message_traces)
    }

    /// Subscribe to traces rejected by validation
    pub fn subscribe_invalid_traces(&mut self) -> Option<mpsc::UnboundedReceiver<InvalidTrace>> {
        self.engine
            .as_mut()
            .map(TraceReconstructionEngine::subscribe_invalid_traces)
    }

    /// Subscribe to traces evicted or flushed before completing
    pub fn subscribe_incomplete_traces(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<IncompleteTrace>> {
        self.engine
            .as_mut()
            .map(TraceReconstructionEngine::subscribe_incomplete_traces)
    }
}

#[async_trait]
impl AnalysisStage for ReconstructionStage {
    fn name(&self) -> &str {
        "trace-reconstruction"
    }

    async fn start(&mut self) -> StageResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(StageError::AlreadyRunning);
        }
        let mut engine = self
            .engine
            .take()
            .ok_or_else(|| StageError::Failed("engine already consumed".to_string()))?;
        let mut input_rx = self
            .input_rx
            .take()
            .ok_or_else(|| StageError::Failed("input already consumed".to_string()))?;
        *running = true;
        drop(running);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_event = input_rx.recv() => match maybe_event {
                        Some(event) => {
                            if let Err(err) = engine.on_event(event) {
                                error!(%err, "trace reconstruction halted");
                                break;
                            }
                        }
                        None => {
                            // all input senders dropped
                            engine.terminate(false);
                            break;
                        }
                    },
                    hard = shutdown_rx.recv() => {
                        engine.terminate(hard.unwrap_or(false));
                        break;
                    }
                }
            }

            *running.write().await = false;
            info!("trace reconstruction stage stopped");
        });

        Ok(())
    }

    async fn stop(&mut self, hard: bool) -> StageResult<()> {
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(hard);
        }

        // Wait for the processing task to wind down
        loop {
            if !*self.running.read().await {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::IncompleteReason;
    use std::time::Duration;
    use tokio::time::timeout;

    const TRACE_ID: i64 = 62298;
    const MILLION: i64 = 1_000_000;

    fn exec(
        component: &str,
        operation: &str,
        tin_millis: i64,
        tout_millis: i64,
        eoi: i32,
        ess: i32,
    ) -> ExecutionEvent {
        ExecutionEvent {
            trace_id: TRACE_ID,
            eoi,
            ess,
            session_id: "ZU1GHGKPDCFIAKJ5".to_string(),
            hostname: "srv0".to_string(),
            component: component.to_string(),
            operation: operation.to_string(),
            tin: tin_millis * MILLION,
            tout: tout_millis * MILLION,
            failure: None,
        }
    }

    fn bookstore_events() -> Vec<ExecutionEvent> {
        vec![
            exec("bookstore", "searchBook()", 1, 10, 0, 0),
            exec("catalog", "getBook()", 2, 4, 1, 1),
            exec("crm", "getOrders()", 5, 8, 2, 1),
            exec("catalog", "getBook()", 6, 7, 3, 2),
        ]
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("stage did not produce output in time")
    }

    #[tokio::test]
    async fn events_flow_through_to_the_trace_ports() {
        let mut stage = ReconstructionStage::new(&ReconstructionSettings::default());
        let mut executions = stage.subscribe_execution_traces().unwrap();
        let mut messages = stage.subscribe_message_traces().unwrap();
        let input = stage.take_input().unwrap();
        stage.start().await.unwrap();

        let events = bookstore_events();
        for i in [3usize, 2, 0, 1] {
            input.send(events[i].clone()).await.unwrap();
        }
        drop(input);

        let trace = recv(&mut executions).await.unwrap();
        assert_eq!(trace.trace_id(), TRACE_ID);
        assert_eq!(trace.len(), 4);
        let message_trace = recv(&mut messages).await.unwrap();
        assert_eq!(message_trace.messages.len(), 8);

        stage.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn closing_the_input_flushes_pending_traces() {
        let mut stage = ReconstructionStage::new(&ReconstructionSettings::default());
        let mut incomplete = stage.subscribe_incomplete_traces().unwrap();
        let input = stage.take_input().unwrap();
        stage.start().await.unwrap();

        // no root event, the trace can never complete
        for event in bookstore_events().into_iter().skip(1) {
            input.send(event).await.unwrap();
        }
        drop(input);

        let flushed = recv(&mut incomplete).await.unwrap();
        assert_eq!(flushed.reason, IncompleteReason::Flushed);
        assert_eq!(flushed.trace.len(), 3);

        stage.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn hard_stop_discards_pending_traces() {
        let mut stage = ReconstructionStage::new(&ReconstructionSettings::default());
        let mut incomplete = stage.subscribe_incomplete_traces().unwrap();
        let mut executions = stage.subscribe_execution_traces().unwrap();
        let input = stage.take_input().unwrap();
        stage.start().await.unwrap();

        for event in bookstore_events().into_iter().skip(1) {
            input.send(event).await.unwrap();
        }
        stage.stop(true).await.unwrap();
        drop(input);

        // the engine is gone and nothing was flushed on the way out
        assert!(recv(&mut incomplete).await.is_none());
        assert!(recv(&mut executions).await.is_none());
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let mut stage = ReconstructionStage::new(&ReconstructionSettings::default());
        stage.start().await.unwrap();
        assert!(matches!(
            stage.start().await,
            Err(StageError::AlreadyRunning)
        ));
        stage.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn subscriptions_close_after_start() {
        let mut stage = ReconstructionStage::new(&ReconstructionSettings::default());
        stage.start().await.unwrap();
        assert!(stage.subscribe_execution_traces().is_none());
        stage.stop(false).await.unwrap();
    }
}
