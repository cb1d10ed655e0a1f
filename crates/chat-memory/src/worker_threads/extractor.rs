//! Extractor notification dispatch.
//!
//! Each extractor owns a bounded queue drained by its own worker task. The
//! write path only ever `try_send`s, so a slow or failing extractor can never
//! hold up `put_memory`; a full queue drops the event with a warning.
use crate::call_context::CallContext;
use crate::error::Result;
use crate::memory_db::schema::{Message, TenantScope};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// New messages written to a session. `event_id` is stable across
/// redeliveries so consumers can deduplicate.
#[derive(Debug, Clone)]
pub struct ExtractorEvent {
    pub event_id: Uuid,
    pub scope: TenantScope,
    pub session_id: String,
    pub new_messages: Vec<Message>,
}

impl ExtractorEvent {
    pub fn new(scope: TenantScope, session_id: impl Into<String>, new_messages: Vec<Message>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            scope,
            session_id: session_id.into(),
            new_messages,
        }
    }
}

/// Post-processing consumer of new messages (summarizer, embedder, ...)
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, ctx: &CallContext, event: &ExtractorEvent) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub queue_size: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub notify_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            queue_size: 256,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            notify_timeout: Duration::from_secs(60),
        }
    }
}

struct ExtractorQueue {
    name: String,
    sender: mpsc::Sender<Arc<ExtractorEvent>>,
}

pub struct ExtractorDispatcher {
    queues: Vec<ExtractorQueue>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExtractorDispatcher {
    /// Spawn one worker per extractor. Must be called inside a tokio runtime.
    pub fn new(extractors: Vec<Arc<dyn Extractor>>, settings: DispatcherSettings) -> Self {
        let shutdown = CancellationToken::new();
        let mut queues = Vec::with_capacity(extractors.len());
        let mut workers = Vec::with_capacity(extractors.len());

        for extractor in extractors {
            let (sender, receiver) = mpsc::channel(settings.queue_size.max(1));
            queues.push(ExtractorQueue {
                name: extractor.name().to_string(),
                sender,
            });
            workers.push(tokio::spawn(run_worker(
                extractor,
                receiver,
                settings.clone(),
                shutdown.child_token(),
            )));
        }

        info!("Extractor dispatcher started with {} extractor(s)", queues.len());
        Self {
            queues,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    /// Dispatcher with no extractors; every dispatch is a no-op
    pub fn disabled() -> Self {
        Self {
            queues: Vec::new(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn extractor_count(&self) -> usize {
        self.queues.len()
    }

    /// Enqueue `event` for every extractor without waiting. Returns how many
    /// queues accepted it.
    pub fn dispatch(&self, event: ExtractorEvent) -> usize {
        let event = Arc::new(event);
        let mut accepted = 0;
        for queue in &self.queues {
            match queue.sender.try_send(Arc::clone(&event)) {
                Ok(()) => accepted += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Extractor '{}' queue full, dropping event {} for session {}",
                        queue.name, event.event_id, event.session_id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Extractor '{}' is stopped, dropping event {}", queue.name, event.event_id);
                }
            }
        }
        accepted
    }

    /// Stop the workers; events still queued are abandoned
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Extractor worker ended abnormally: {}", e);
            }
        }
        info!("Extractor dispatcher stopped");
    }
}

async fn run_worker(
    extractor: Arc<dyn Extractor>,
    mut receiver: mpsc::Receiver<Arc<ExtractorEvent>>,
    settings: DispatcherSettings,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        deliver(extractor.as_ref(), &event, &settings, &shutdown).await;
    }
    debug!("Extractor worker '{}' exiting", extractor.name());
}

async fn deliver(
    extractor: &dyn Extractor,
    event: &ExtractorEvent,
    settings: &DispatcherSettings,
    shutdown: &CancellationToken,
) {
    let attempts = settings.max_attempts.max(1);
    for attempt in 1..=attempts {
        let ctx = CallContext::from_token(shutdown.child_token()).child_with_timeout(settings.notify_timeout);
        match ctx.run(extractor.notify(&ctx, event)).await {
            Ok(()) => {
                debug!(
                    "Extractor '{}' handled event {} ({} messages)",
                    extractor.name(),
                    event.event_id,
                    event.new_messages.len()
                );
                return;
            }
            Err(e) if shutdown.is_cancelled() => {
                debug!("Extractor '{}' interrupted by shutdown: {}", extractor.name(), e);
                return;
            }
            Err(e) if attempt < attempts => {
                warn!(
                    "Extractor '{}' failed on event {} (attempt {}/{}): {}",
                    extractor.name(),
                    event.event_id,
                    attempt,
                    attempts,
                    e
                );
                let delay = settings.initial_backoff.saturating_mul(2u32.saturating_pow(attempt - 1));
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                error!(
                    "Extractor '{}' gave up on event {} for session {}: {}",
                    extractor.name(),
                    event.event_id,
                    event.session_id,
                    e
                );
            }
        }
    }
}
