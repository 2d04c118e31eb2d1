//! Consumers of the synthesized session event stream

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::{Result, SynthError};
use crate::event::Event;
use crate::queue::EventQueue;

/// Receiver of session-level events
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Accept one session-level event. A fatal error aborts the synthesizer.
    async fn submit_event(&self, event: Event) -> Result<()>;

    /// A source failed or the run was canceled.
    async fn report_error(&self, error: SynthError);

    /// Every source is exhausted; no further events will be submitted.
    async fn generator_complete(&self);
}

/// Feeds synthesized events into an [`EventQueue`] for a downstream workload driver
pub struct QueueConsumer {
    queue: Arc<EventQueue>,
    generator_done: watch::Sender<bool>,
    workload_done: watch::Sender<bool>,
    errors: Mutex<Vec<String>>,
}

impl QueueConsumer {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        let (generator_done, _) = watch::channel(false);
        let (workload_done, _) = watch::channel(false);
        Self {
            queue,
            generator_done,
            workload_done,
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Flips to `true` once the synthesizer has submitted its last event.
    pub fn subscribe_generator_complete(&self) -> watch::Receiver<bool> {
        self.generator_done.subscribe()
    }

    /// Flips to `true` once the workload driver has processed every event.
    pub fn subscribe_workload_complete(&self) -> watch::Receiver<bool> {
        self.workload_done.subscribe()
    }

    pub fn is_generator_complete(&self) -> bool {
        *self.generator_done.borrow()
    }

    /// Called by the workload driver when it has drained the queue.
    pub fn workload_complete(&self) {
        self.workload_done.send_replace(true);
        info!("Workload processing complete");
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

#[async_trait]
impl EventConsumer for QueueConsumer {
    async fn submit_event(&self, event: Event) -> Result<()> {
        self.queue.enqueue_event(event)
    }

    async fn report_error(&self, err: SynthError) {
        error!(error = %err, "Event generation error");
        self.errors.lock().push(err.to_string());
    }

    async fn generator_complete(&self) {
        self.generator_done.send_replace(true);
        info!(buffered = self.queue.len(), "Event generation complete");
    }
}
