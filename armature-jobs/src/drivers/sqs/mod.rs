//! AWS SQS driver.
//!
//! The listener long-polls the queue and inserts every decoded message into
//! the priority queue without deleting it. Ack deletes the message; a message
//! that is neither acked nor deleted becomes visible again once its
//! visibility timeout expires, and SQS counts the redelivery.

mod client;
mod item;

pub use client::{
    APPROXIMATE_RECEIVE_COUNT, Attribute, AwsSqs, NON_EXISTENT_QUEUE, ReceiveOptions, SqsApi,
    SqsMessage,
};
pub use item::{MAX_DELAY, SqsItem, Unpacked, check_delay, pack, unpack};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::DriverContext;
use crate::consumer::{Consumer, ListenerTask, Listeners, PipelineSlot};
use crate::error::{JobsError, JobsResult};
use crate::events::{EventHandler, EventKind, JobEvent};
use crate::job::Job;
use crate::pipeline::Pipeline;
use crate::priority_queue::JobQueue;
use crate::state::State;

const QUEUE: &str = "queue";
const PREFETCH: &str = "prefetch";
const VISIBILITY_TIMEOUT: &str = "visibility_timeout";
const WAIT_TIME_SECONDS: &str = "wait_time_seconds";
const ATTRIBUTES: &str = "attributes";
const TAGS: &str = "tags";

/// SQS needs about a second before a new queue is usable.
pub const QUEUE_CREATE_PAUSE: Duration = Duration::from_secs(2);

/// Pipeline level SQS settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqsSettings {
    pub queue: String,
    pub prefetch: i32,
    pub visibility_timeout: i32,
    pub wait_time_seconds: i32,
    pub attributes: HashMap<String, String>,
    pub tags: HashMap<String, String>,
}

impl SqsSettings {
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self {
            queue: pipeline.string(QUEUE, "default"),
            prefetch: pipeline.int(PREFETCH, 10).clamp(1, 10) as i32,
            visibility_timeout: pipeline.int(VISIBILITY_TIMEOUT, 0).clamp(0, 43_200) as i32,
            wait_time_seconds: pipeline.int(WAIT_TIME_SECONDS, 5).clamp(0, 20) as i32,
            attributes: pipeline.map(ATTRIBUTES),
            tags: pipeline.map(TAGS),
        }
    }

    fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: self.prefetch,
            wait_time_seconds: self.wait_time_seconds,
            visibility_timeout: (self.visibility_timeout > 0).then_some(self.visibility_timeout),
        }
    }
}

struct Inner {
    settings: SqsSettings,
    client: Arc<dyn SqsApi>,
    queue_url: RwLock<String>,
    pipeline: PipelineSlot,
    listeners: Listeners,
    listener: ListenerTask,
    stopped: CancellationToken,
    pq: Arc<JobQueue>,
    events: Arc<dyn EventHandler>,
}

impl Inner {
    fn queue_url(&self) -> String {
        self.queue_url.read().clone()
    }

    fn start_listener(self: &Arc<Self>) {
        let inner = self.clone();
        self.listener.start(move |token| async move {
            let opts = inner.settings.receive_options();
            loop {
                let url = inner.queue_url();
                let received = tokio::select! {
                    _ = token.cancelled() => break,
                    r = inner.client.receive(&url, opts) => r,
                };

                match received {
                    Ok(messages) => {
                        for msg in messages {
                            inner.handle(msg, &url).await;
                        }
                    }
                    Err(e) if matches!(e.root(), JobsError::QueueNotFound(_)) => {
                        error!(error = %e, queue = %inner.settings.queue, "queue is gone, recreating");
                        inner.recreate_queue().await;
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(QUEUE_CREATE_PAUSE) => {}
                        }
                    }
                    Err(e) => {
                        error!(error = %e, queue = %inner.settings.queue, "receive message");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
            warn!(queue = %inner.settings.queue, "sqs listener stopped");
        });
    }

    async fn recreate_queue(&self) {
        match self
            .client
            .create_queue(
                &self.settings.queue,
                &self.settings.attributes,
                &self.settings.tags,
            )
            .await
        {
            Ok(url) => *self.queue_url.write() = url,
            Err(e) => error!(error = %e, queue = %self.settings.queue, "create queue"),
        }
    }

    async fn handle(&self, msg: SqsMessage, url: &str) {
        let pipe = match self.pipeline.load() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "received a message for an unregistered consumer");
                return;
            }
        };

        let unpacked = match unpack(&msg, &pipe) {
            Ok(u) => u,
            Err(e) => {
                error!(error = %e, message_id = %msg.message_id, "message unpack, deleting");
                if let Err(e) = self.client.delete(url, &msg.receipt_handle).await {
                    error!(error = %e, "failed to delete the message from the queue");
                }
                return;
            }
        };

        if unpacked.exhausted() {
            debug!(
                id = %unpacked.job.ident,
                receive_count = unpacked.receive_count,
                max_attempts = unpacked.job.options.attempts,
                "retries exhausted, deleting"
            );
            if let Err(e) = self.client.delete(url, &msg.receipt_handle).await {
                error!(error = %e, "failed to delete an exhausted message");
            }
            return;
        }

        self.pq.insert(Box::new(SqsItem {
            job: unpacked.job,
            receive_count: unpacked.receive_count,
            receipt_handle: msg.receipt_handle,
            queue_url: url.to_string(),
            client: self.client.clone(),
        }));
    }

    fn event(&self, kind: EventKind) -> JobEvent {
        let (pipeline, driver) = self.pipeline.names();
        JobEvent::new(kind, driver, pipeline)
    }
}

/// SQS consumer.
pub struct SqsConsumer {
    inner: Arc<Inner>,
}

impl SqsConsumer {
    pub async fn from_pipeline(pipeline: &Pipeline, ctx: &DriverContext) -> JobsResult<Self> {
        let client = AwsSqs::connect(&ctx.config.sqs).await;
        Self::with_client(SqsSettings::from_pipeline(pipeline), Arc::new(client), ctx)
            .await
            .map_err(|e| e.with_op("new_sqs_consumer"))
    }

    /// Create the queue through `client` and wrap it in a consumer.
    pub async fn with_client(
        settings: SqsSettings,
        client: Arc<dyn SqsApi>,
        ctx: &DriverContext,
    ) -> JobsResult<Self> {
        let url = client
            .create_queue(&settings.queue, &settings.attributes, &settings.tags)
            .await?;
        tokio::time::sleep(QUEUE_CREATE_PAUSE).await;

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                client,
                queue_url: RwLock::new(url),
                pipeline: PipelineSlot::default(),
                listeners: Listeners::default(),
                listener: ListenerTask::default(),
                stopped: CancellationToken::new(),
                pq: ctx.pq.clone(),
                events: ctx.events.clone(),
            }),
        })
    }
}

#[async_trait]
impl Consumer for SqsConsumer {
    async fn push(&self, job: Job) -> JobsResult<()> {
        const OP: &str = "sqs_push";
        self.inner
            .pipeline
            .check(&job.options.pipeline)
            .map_err(|e| e.with_op(OP))?;
        if self.inner.stopped.is_cancelled() {
            return Err(JobsError::Stopped.with_op(OP));
        }

        let delay = check_delay(job.options.delay).map_err(|e| e.with_op(OP))?;
        let attrs = pack(&job).map_err(|e| e.with_op(OP))?;
        self.inner
            .client
            .send(&self.inner.queue_url(), &job.payload, delay, attrs)
            .await
            .map_err(|e| e.with_op(OP))
    }

    async fn register(&self, pipeline: Arc<Pipeline>) -> JobsResult<()> {
        self.inner.pipeline.store(pipeline);
        Ok(())
    }

    async fn run(&self, pipeline: Arc<Pipeline>) -> JobsResult<()> {
        let started = Instant::now();
        self.inner
            .pipeline
            .check(pipeline.name())
            .map_err(|e| e.with_op("sqs_run"))?;

        if !self.inner.listeners.activate() {
            warn!(pipeline = %pipeline.name(), "sqs listener already in the active state");
            return Ok(());
        }
        self.inner.start_listener();
        self.inner
            .events
            .push(self.inner.event(EventKind::PipeActive).since(started));
        Ok(())
    }

    async fn pause(&self, pipeline: &str) {
        let started = Instant::now();
        if let Err(e) = self.inner.pipeline.check(pipeline) {
            error!(error = %e, "no such pipeline");
            return;
        }
        if !self.inner.listeners.deactivate() {
            warn!(pipeline, "no active listeners, nothing to pause");
            return;
        }
        self.inner.listener.stop();
        self.inner
            .events
            .push(self.inner.event(EventKind::PipePaused).since(started));
    }

    async fn resume(&self, pipeline: &str) {
        let started = Instant::now();
        if let Err(e) = self.inner.pipeline.check(pipeline) {
            error!(error = %e, "no such pipeline");
            return;
        }
        if !self.inner.listeners.activate() {
            warn!(pipeline, "sqs listener already in the active state");
            return;
        }
        self.inner.start_listener();
        self.inner
            .events
            .push(self.inner.event(EventKind::PipeActive).since(started));
    }

    async fn stop(&self) -> JobsResult<()> {
        let started = Instant::now();
        self.inner.stopped.cancel();
        self.inner.listener.stop();
        self.inner.listeners.deactivate();
        self.inner
            .events
            .push(self.inner.event(EventKind::PipeStopped).since(started));
        Ok(())
    }

    async fn state(&self) -> JobsResult<State> {
        const OP: &str = "sqs_state";
        let pipe = self.inner.pipeline.load().map_err(|e| e.with_op(OP))?;
        let attrs = self
            .inner
            .client
            .queue_attributes(&self.inner.queue_url())
            .await
            .map_err(|e| e.with_op(OP))?;
        let count = |key: &str| {
            attrs
                .get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };

        Ok(State {
            pipeline: pipe.name().to_string(),
            driver: pipe.driver().to_string(),
            queue: self.inner.queue_url(),
            active: count("ApproximateNumberOfMessages"),
            delayed: count("ApproximateNumberOfMessagesDelayed"),
            reserved: count("ApproximateNumberOfMessagesNotVisible"),
            ready: self.inner.listeners.is_active(),
        })
    }
}
