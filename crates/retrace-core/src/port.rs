//! Dataflow ports - the named connection contract analysis stages plug into
//!
//! A stage consumes values one at a time on its input and fans results out on
//! named output ports. Subscribers attach before the stage starts; emission
//! never blocks the producing stage.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Stage lifecycle errors
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage already running")]
    AlreadyRunning,

    #[error("stage not running")]
    NotRunning,

    #[error("stage failed: {0}")]
    Failed(String),
}

pub type StageResult<T> = Result<T, StageError>;

/// Run/terminate lifecycle of an analysis stage
#[async_trait]
pub trait AnalysisStage: Send {
    /// Stage name, for logging
    fn name(&self) -> &str;

    /// Start consuming from the input
    async fn start(&mut self) -> StageResult<()>;

    /// Stop the stage. `hard` discards in-flight state instead of flushing it.
    async fn stop(&mut self, hard: bool) -> StageResult<()>;
}

/// A named output fanning values out to any number of subscribers.
///
/// Unbounded senders keep `emit` non-blocking; a closed subscriber is
/// skipped silently so one slow or dropped consumer cannot stall the stage.
#[derive(Debug)]
pub struct OutputPort<T> {
    name: &'static str,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

impl<T: Clone> OutputPort<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Attach a new subscriber and return its receiving end
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver a value to every live subscriber
    pub fn emit(&self, value: T) {
        match self.subscribers.len() {
            0 => debug!(port = self.name, "no subscribers, value dropped"),
            1 => {
                if self.subscribers[0].send(value).is_err() {
                    debug!(port = self.name, "subscriber gone, value dropped");
                }
            }
            _ => {
                for tx in &self.subscribers {
                    if tx.send(value.clone()).is_err() {
                        debug!(port = self.name, "subscriber gone, value dropped");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_to_all_subscribers() {
        let mut port: OutputPort<u32> = OutputPort::new("numbers");
        let mut a = port.subscribe();
        let mut b = port.subscribe();

        port.emit(7);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_emission() {
        let mut port: OutputPort<u32> = OutputPort::new("numbers");
        let a = port.subscribe();
        let mut b = port.subscribe();
        drop(a);

        port.emit(1);
        port.emit(2);
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }
}
