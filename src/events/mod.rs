//! Lifecycle events
//!
//! Every state transition and every finished stage produces a `JobEvent`.
//! Publishing is fire-and-forget: events are queued onto a channel and a
//! dispatcher task fans them out to one bounded queue per sink. Each sink
//! drains its queue in its own task with a per-event deadline, so a slow
//! sink only delays itself. Failures and drops are logged and counted,
//! never surfaced to the pipeline.

pub mod sinks;

use crate::core::job::{Job, JobId, JobType};
use crate::core::state::JobState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

pub use sinks::{JsonLinesSink, LogSink, MemorySink};

const SUBSCRIBER_CAPACITY: usize = 1024;

/// Events a sink can fall behind by before new ones are dropped for it
pub const SINK_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "job.created")]
    Created,
    #[serde(rename = "job.state.changed")]
    StateChanged,
    #[serde(rename = "job.stage.completed")]
    StageCompleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "job.created",
            EventType::StateChanged => "job.state.changed",
            EventType::StageCompleted => "job.stage.completed",
        }
    }
}

/// Event envelope published to every sink
///
/// `extra` is open-ended; consumers ignore keys they do not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub job_id: JobId,
    pub job_type: JobType,
    pub state: JobState,
    pub stage: Option<String>,
    pub progress: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl JobEvent {
    fn from_job(event_type: EventType, job: &Job) -> Self {
        let mut extra = Map::new();
        extra.insert("tenantId".to_string(), Value::String(job.tenant_id.clone()));
        Self {
            event_type,
            job_id: job.id,
            job_type: job.job_type,
            state: job.state,
            stage: job.stage.clone(),
            progress: job.progress,
            timestamp: Utc::now(),
            extra,
        }
    }

    pub fn created(job: &Job) -> Self {
        Self::from_job(EventType::Created, job)
    }

    pub fn state_changed(job: &Job, from: JobState) -> Self {
        let mut event = Self::from_job(EventType::StateChanged, job)
            .with_extra("from", Value::String(from.as_str().to_string()));
        if let Some(error) = &job.error {
            event = event.with_extra("error", Value::String(error.to_string()));
        }
        event
    }

    /// A stage finished; failures carry `success: false` and the error text
    pub fn stage_completed(job: &Job, stage: &str, success: bool, error: Option<&str>, duration: Duration) -> Self {
        let mut event = Self::from_job(EventType::StageCompleted, job)
            .with_extra("success", Value::Bool(success))
            .with_extra("durationMs", Value::from(duration.as_millis() as u64));
        event.stage = Some(stage.to_string());
        if let Some(error) = error {
            event = event.with_extra("error", Value::String(error.to_string()));
        }
        event
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// Destination for lifecycle events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Used in logs and the publish-failure metric
    fn name(&self) -> &str;

    async fn publish(&self, event: &JobEvent) -> anyhow::Result<()>;
}

enum Message {
    Event(Arc<JobEvent>),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct PublishStats {
    published: AtomicU64,
    failed: AtomicU64,
}

/// Non-blocking fan-out of events to sinks and in-process subscribers
#[derive(Clone)]
pub struct EventPublisher {
    sender: mpsc::UnboundedSender<Message>,
    subscribers: broadcast::Sender<JobEvent>,
    stats: Arc<PublishStats>,
}

impl EventPublisher {
    /// Spawn the dispatcher task; must be called inside a tokio runtime
    pub fn new(sinks: Vec<Arc<dyn EventSink>>, publish_timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let stats = Arc::new(PublishStats::default());

        tokio::spawn(dispatch(receiver, sinks, publish_timeout, stats.clone()));

        Self {
            sender,
            subscribers,
            stats,
        }
    }

    /// Publisher with no sinks; subscribers still receive events
    pub fn detached() -> Self {
        Self::new(Vec::new(), Duration::from_secs(5))
    }

    /// Queue an event; never blocks and never fails the caller
    pub fn publish(&self, event: JobEvent) {
        // No receivers is the normal case
        let _ = self.subscribers.send(event.clone());

        if self.sender.send(Message::Event(Arc::new(event))).is_err() {
            warn!("Event dispatcher has stopped; event dropped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.subscribers.subscribe()
    }

    /// Wait until every event queued so far has been offered to every sink
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Message::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Successful sink deliveries
    pub fn published_count(&self) -> u64 {
        self.stats.published.load(Ordering::Relaxed)
    }

    /// Sink deliveries that failed, timed out or were dropped
    pub fn failed_count(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }
}

async fn dispatch(
    mut receiver: mpsc::UnboundedReceiver<Message>,
    sinks: Vec<Arc<dyn EventSink>>,
    publish_timeout: Duration,
    stats: Arc<PublishStats>,
) {
    let queues: Vec<(String, mpsc::Sender<Message>)> = sinks
        .into_iter()
        .map(|sink| {
            let (sender, queue) = mpsc::channel(SINK_QUEUE_CAPACITY);
            let name = sink.name().to_string();
            tokio::spawn(deliver(sink, queue, publish_timeout, stats.clone()));
            (name, sender)
        })
        .collect();

    while let Some(message) = receiver.recv().await {
        match message {
            Message::Event(event) => {
                for (name, queue) in &queues {
                    let reason = match queue.try_send(Message::Event(event.clone())) {
                        Ok(()) => continue,
                        Err(TrySendError::Full(_)) => "sink queue is full",
                        Err(TrySendError::Closed(_)) => "sink task has stopped",
                    };
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_publish_failure(name);
                    warn!(
                        job_id = %event.job_id,
                        sink = %name,
                        "Dropped {} event: {}",
                        event.event_type.as_str(),
                        reason
                    );
                }
            }
            Message::Flush(done) => {
                let senders: Vec<mpsc::Sender<Message>> = queues.iter().map(|(_, q)| q.clone()).collect();
                tokio::spawn(async move {
                    for sender in senders {
                        let (ack, acked) = oneshot::channel();
                        if sender.send(Message::Flush(ack)).await.is_ok() {
                            let _ = acked.await;
                        }
                    }
                    let _ = done.send(());
                });
            }
        }
    }

    debug!("Event dispatcher stopped");
}

/// Feed one sink from its own queue so it cannot hold up the others
async fn deliver(
    sink: Arc<dyn EventSink>,
    mut queue: mpsc::Receiver<Message>,
    publish_timeout: Duration,
    stats: Arc<PublishStats>,
) {
    while let Some(message) = queue.recv().await {
        let event = match message {
            Message::Event(event) => event,
            Message::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        let outcome = tokio::time::timeout(publish_timeout, sink.publish(&event)).await;
        let failure = match outcome {
            Ok(Ok(())) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!("timed out after {}ms", publish_timeout.as_millis()),
        };

        stats.failed.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_publish_failure(sink.name());
        warn!(
            job_id = %event.job_id,
            sink = sink.name(),
            "Failed to publish {} event: {}",
            event.event_type.as_str(),
            failure
        );
    }

    debug!(sink = sink.name(), "Sink delivery stopped");
}
