//! In-memory driver.
//!
//! Jobs are buffered in a bounded local channel (`prefetch`, 100k by default)
//! and moved into the priority queue while the pipeline is active. Delayed
//! jobs sleep in their own task; at most [`MAX_DELAYED`] may wait at once.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::DriverContext;
use crate::consumer::{Consumer, ListenerTask, Listeners, PipelineSlot};
use crate::error::{JobsError, JobsResult};
use crate::events::{EventHandler, EventKind, JobEvent};
use crate::item::{Item, ItemContext};
use crate::job::{Headers, Job};
use crate::pipeline::Pipeline;
use crate::priority_queue::JobQueue;
use crate::state::State;

/// Default local buffer size.
pub const DEFAULT_PREFETCH: usize = 100_000;

/// Maximum number of delayed jobs waiting at the same time.
pub const MAX_DELAYED: i64 = 1000;

const PREFETCH: &str = "prefetch";

struct Inner {
    pipeline: PipelineSlot,
    listeners: Listeners,
    listener: ListenerTask,

    tx: mpsc::Sender<EphemeralItem>,
    rx: tokio::sync::Mutex<mpsc::Receiver<EphemeralItem>>,
    prefetch: usize,
    push_timeout: Duration,

    // items handed to the priority queue and not yet finalized
    active: AtomicI64,
    delayed: AtomicI64,
    stopped: CancellationToken,

    pq: Arc<JobQueue>,
    events: Arc<dyn EventHandler>,
}

impl Inner {
    async fn handle_item(self: &Arc<Self>, item: EphemeralItem) -> JobsResult<()> {
        if self.stopped.is_cancelled() {
            return Err(JobsError::Stopped);
        }

        if item.job.options.delay > 0 {
            if self.delayed.fetch_add(1, Ordering::AcqRel) >= MAX_DELAYED {
                self.delayed.fetch_sub(1, Ordering::AcqRel);
                return Err(JobsError::ResourceExhausted(format!(
                    "max number of delayed jobs reached: {MAX_DELAYED}"
                )));
            }

            let inner = self.clone();
            let delay = item.job.options.delay_duration();
            tokio::spawn(async move {
                tokio::select! {
                    _ = inner.stopped.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = inner.enqueue(item).await {
                            warn!(error = %e, "failed to enqueue delayed job");
                        }
                    }
                }
                inner.delayed.fetch_sub(1, Ordering::AcqRel);
            });
            return Ok(());
        }

        self.enqueue(item).await
    }

    async fn enqueue(&self, item: EphemeralItem) -> JobsResult<()> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => {
                match tokio::time::timeout(self.push_timeout, self.tx.send(item)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(JobsError::Stopped),
                    Err(_) => Err(JobsError::Timeout(format!(
                        "local pipeline is full, consider increasing prefetch, current limit: {}",
                        self.prefetch
                    ))),
                }
            }
            Err(TrySendError::Closed(_)) => Err(JobsError::Stopped),
        }
    }

    fn start_listener(self: &Arc<Self>) {
        let inner = self.clone();
        self.listener.start(move |token| async move {
            let mut rx = inner.rx.lock().await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    msg = rx.recv() => match msg {
                        Some(mut item) => {
                            item.owner = Arc::downgrade(&inner);
                            inner.active.fetch_add(1, Ordering::AcqRel);
                            inner.pq.insert(Box::new(item));
                        }
                        None => return,
                    },
                }
            }
        });
    }

    fn buffered(&self) -> i64 {
        (self.tx.max_capacity() - self.tx.capacity()) as i64
    }

    fn emit(&self, kind: EventKind, started: Instant) {
        let (pipeline, driver) = self.pipeline.names();
        self.events
            .push(JobEvent::new(kind, driver, pipeline).since(started));
    }
}

/// In-memory consumer.
pub struct EphemeralConsumer {
    inner: Arc<Inner>,
}

impl EphemeralConsumer {
    /// Create a consumer sized from the pipeline's `prefetch` key.
    pub fn from_pipeline(pipeline: &Pipeline, ctx: &DriverContext) -> Self {
        let prefetch = match pipeline.int(PREFETCH, DEFAULT_PREFETCH as i64) {
            n if n > 0 => n as usize,
            _ => DEFAULT_PREFETCH,
        };
        Self::new(prefetch, ctx)
    }

    /// Create a consumer with an explicit buffer size.
    pub fn new(prefetch: usize, ctx: &DriverContext) -> Self {
        let prefetch = prefetch.max(1);
        let (tx, rx) = mpsc::channel(prefetch);

        Self {
            inner: Arc::new(Inner {
                pipeline: PipelineSlot::default(),
                listeners: Listeners::default(),
                listener: ListenerTask::default(),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                prefetch,
                push_timeout: ctx.config.jobs.timeout_duration(),
                active: AtomicI64::new(0),
                delayed: AtomicI64::new(0),
                stopped: CancellationToken::new(),
                pq: ctx.pq.clone(),
                events: ctx.events.clone(),
            }),
        }
    }
}

#[async_trait]
impl Consumer for EphemeralConsumer {
    async fn push(&self, job: Job) -> JobsResult<()> {
        const OP: &str = "ephemeral_push";
        self.inner
            .pipeline
            .check(&job.options.pipeline)
            .map_err(|e| e.with_op(OP))?;

        self.inner
            .handle_item(EphemeralItem::from_job(job))
            .await
            .map_err(|e| e.with_op(OP))
    }

    async fn register(&self, pipeline: Arc<Pipeline>) -> JobsResult<()> {
        if let Ok(existing) = self.inner.pipeline.load() {
            return Err(JobsError::AlreadyRegistered(existing.name().to_string())
                .with_op("ephemeral_register"));
        }
        self.inner.pipeline.store(pipeline);
        Ok(())
    }

    async fn run(&self, pipeline: Arc<Pipeline>) -> JobsResult<()> {
        let started = Instant::now();
        self.inner
            .pipeline
            .check(pipeline.name())
            .map_err(|e| e.with_op("ephemeral_run"))?;

        if !self.inner.listeners.activate() {
            warn!(pipeline = %pipeline.name(), "listener already in the active state");
            return Ok(());
        }
        self.inner.start_listener();
        self.inner.emit(EventKind::PipeActive, started);
        Ok(())
    }

    async fn pause(&self, pipeline: &str) {
        let started = Instant::now();
        if let Err(e) = self.inner.pipeline.check(pipeline) {
            warn!(error = %e, "pause requested for a foreign pipeline");
            return;
        }
        if !self.inner.listeners.deactivate() {
            warn!(pipeline, "no active listeners, nothing to pause");
            return;
        }
        self.inner.listener.stop();
        self.inner.emit(EventKind::PipePaused, started);
    }

    async fn resume(&self, pipeline: &str) {
        let started = Instant::now();
        if let Err(e) = self.inner.pipeline.check(pipeline) {
            warn!(error = %e, "resume requested for a foreign pipeline");
            return;
        }
        if !self.inner.listeners.activate() {
            warn!(pipeline, "listener already in the active state");
            return;
        }
        self.inner.start_listener();
        self.inner.emit(EventKind::PipeActive, started);
    }

    async fn stop(&self) -> JobsResult<()> {
        let started = Instant::now();
        self.inner.stopped.cancel();
        self.inner.listener.stop();
        self.inner.listeners.deactivate();
        debug!(pipeline = %self.inner.pipeline.names().0, "ephemeral consumer stopped");
        self.inner.emit(EventKind::PipeStopped, started);
        Ok(())
    }

    async fn state(&self) -> JobsResult<State> {
        let pipe = self.inner.pipeline.load()?;
        Ok(State {
            pipeline: pipe.name().to_string(),
            driver: pipe.driver().to_string(),
            queue: pipe.name().to_string(),
            active: self.inner.active.load(Ordering::Acquire) + self.inner.buffered(),
            delayed: self.inner.delayed.load(Ordering::Acquire),
            reserved: 0,
            ready: self.inner.listeners.is_active(),
        })
    }
}

/// Job held in memory.
pub struct EphemeralItem {
    job: Job,
    owner: Weak<Inner>,
}

impl EphemeralItem {
    fn from_job(job: Job) -> Self {
        Self {
            job,
            owner: Weak::new(),
        }
    }

    fn finalize(&self) -> Option<Arc<Inner>> {
        let owner = self.owner.upgrade()?;
        owner.active.fetch_sub(1, Ordering::AcqRel);
        Some(owner)
    }
}

#[async_trait]
impl Item for EphemeralItem {
    fn id(&self) -> &str {
        &self.job.ident
    }

    fn priority(&self) -> i64 {
        self.job.options.priority
    }

    fn body(&self) -> &[u8] {
        self.job.payload.as_bytes()
    }

    fn context(&self) -> JobsResult<Vec<u8>> {
        ItemContext {
            id: self.job.ident.clone(),
            job: self.job.job.clone(),
            headers: self.job.headers.clone(),
            pipeline: self.job.options.pipeline.clone(),
        }
        .to_bytes()
    }

    async fn ack(&mut self) -> JobsResult<()> {
        self.finalize();
        Ok(())
    }

    async fn nack(&mut self) -> JobsResult<()> {
        self.finalize();
        Ok(())
    }

    async fn requeue(&mut self, headers: Headers, delay: i64) -> JobsResult<()> {
        let owner = self.finalize().ok_or(JobsError::Stopped)?;

        let mut job = self.job.clone();
        job.headers = headers;
        job.options.delay = delay;

        owner
            .handle_item(EphemeralItem::from_job(job))
            .await
            .map_err(|e| e.with_op("ephemeral_requeue"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use tokio::sync::broadcast;

    fn setup(prefetch: usize) -> (EphemeralConsumer, Arc<JobQueue>, broadcast::Receiver<JobEvent>) {
        let pq = Arc::new(JobQueue::new());
        let bus = EventBus::default();
        let rx = bus.subscribe();
        let ctx = DriverContext::new(pq.clone(), Arc::new(bus), Arc::new(Config::default()));
        (EphemeralConsumer::new(prefetch, &ctx), pq, rx)
    }

    fn pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::new("test-local", "ephemeral"))
    }

    async fn next_item(pq: &JobQueue) -> Box<dyn Item> {
        tokio::time::timeout(Duration::from_secs(30), pq.extract_min_async())
            .await
            .expect("item was not delivered")
    }

    fn drain_kinds(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(ev.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_push_and_consume() {
        let (consumer, pq, _rx) = setup(10);
        let pipe = pipeline();
        consumer.register(pipe.clone()).await.unwrap();
        consumer.run(pipe).await.unwrap();

        consumer
            .push(Job::new("mail.send", "payload").with_pipeline("test-local").with_priority(3))
            .await
            .unwrap();

        let mut item = next_item(&pq).await;
        assert_eq!(item.body(), b"payload");
        assert_eq!(item.priority(), 3);

        let ctx = ItemContext::from_bytes(&item.context().unwrap()).unwrap();
        assert_eq!(ctx.job, "mail.send");
        assert_eq!(ctx.pipeline, "test-local");

        assert_eq!(consumer.state().await.unwrap().active, 1);
        item.ack().await.unwrap();
        assert_eq!(consumer.state().await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_push_buffers_while_idle() {
        let (consumer, pq, _rx) = setup(10);
        let pipe = pipeline();
        consumer.register(pipe.clone()).await.unwrap();

        for i in 0..3 {
            consumer
                .push(Job::new("j", i.to_string()).with_pipeline("test-local"))
                .await
                .unwrap();
        }
        tokio::task::yield_now().await;
        assert!(pq.is_empty());

        let state = consumer.state().await.unwrap();
        assert_eq!(state.active, 3);
        assert!(!state.ready);

        consumer.run(pipe).await.unwrap();
        for _ in 0..3 {
            next_item(&pq).await;
        }
    }

    #[tokio::test]
    async fn test_push_to_foreign_pipeline() {
        let (consumer, _pq, _rx) = setup(10);
        consumer.register(pipeline()).await.unwrap();

        let err = consumer
            .push(Job::new("j", "p").with_pipeline("other"))
            .await
            .unwrap_err();
        assert!(matches!(err.root(), JobsError::NoSuchPipeline { .. }));
        assert!(err.to_string().starts_with("ephemeral_push: "));
    }

    #[tokio::test]
    async fn test_register_twice() {
        let (consumer, _pq, _rx) = setup(10);
        consumer.register(pipeline()).await.unwrap();
        let err = consumer.register(pipeline()).await.unwrap_err();
        assert!(matches!(err.root(), JobsError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn test_pause_resume_idempotent() {
        let (consumer, _pq, mut rx) = setup(10);
        let pipe = pipeline();
        consumer.register(pipe.clone()).await.unwrap();
        consumer.run(pipe).await.unwrap();
        assert!(consumer.state().await.unwrap().ready);

        consumer.pause("test-local").await;
        consumer.pause("test-local").await;
        assert_eq!(consumer.inner.listeners.count(), 0);
        assert!(!consumer.state().await.unwrap().ready);

        consumer.resume("test-local").await;
        consumer.resume("test-local").await;
        assert_eq!(consumer.inner.listeners.count(), 1);
        assert!(consumer.state().await.unwrap().ready);

        assert_eq!(
            drain_kinds(&mut rx),
            vec![EventKind::PipeActive, EventKind::PipePaused, EventKind::PipeActive]
        );
    }

    #[tokio::test]
    async fn test_paused_pipeline_keeps_jobs_local() {
        let (consumer, pq, _rx) = setup(10);
        let pipe = pipeline();
        consumer.register(pipe.clone()).await.unwrap();
        consumer.run(pipe).await.unwrap();
        consumer.pause("test-local").await;
        tokio::task::yield_now().await;

        consumer
            .push(Job::new("j", "p").with_pipeline("test-local"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pq.is_empty());

        consumer.resume("test-local").await;
        next_item(&pq).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_push() {
        let (consumer, pq, _rx) = setup(10);
        let pipe = pipeline();
        consumer.register(pipe.clone()).await.unwrap();
        consumer.run(pipe).await.unwrap();

        consumer
            .push(Job::new("j", "later").with_pipeline("test-local").with_delay(5))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(consumer.state().await.unwrap().delayed, 1);
        assert!(pq.is_empty());

        let item = next_item(&pq).await;
        assert_eq!(item.body(), b"later");
        assert_eq!(consumer.state().await.unwrap().delayed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_capacity() {
        let (consumer, _pq, _rx) = setup(10);
        consumer.register(pipeline()).await.unwrap();

        for _ in 0..MAX_DELAYED {
            consumer
                .push(Job::new("j", "p").with_pipeline("test-local").with_delay(60))
                .await
                .unwrap();
        }
        let err = consumer
            .push(Job::new("j", "p").with_pipeline("test-local").with_delay(60))
            .await
            .unwrap_err();
        assert!(matches!(err.root(), JobsError::ResourceExhausted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_times_out() {
        let (consumer, _pq, _rx) = setup(1);
        consumer.register(pipeline()).await.unwrap();

        consumer
            .push(Job::new("j", "1").with_pipeline("test-local"))
            .await
            .unwrap();
        let err = consumer
            .push(Job::new("j", "2").with_pipeline("test-local"))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_requeue_goes_back_to_queue() {
        let (consumer, pq, _rx) = setup(10);
        let pipe = pipeline();
        consumer.register(pipe.clone()).await.unwrap();
        consumer.run(pipe).await.unwrap();

        consumer
            .push(Job::new("j", "again").with_pipeline("test-local"))
            .await
            .unwrap();
        let mut item = next_item(&pq).await;

        let mut headers = Headers::new();
        headers.insert("attempt".into(), vec!["2".into()]);
        item.requeue(headers, 0).await.unwrap();

        let again = next_item(&pq).await;
        assert_eq!(again.id(), item.id());
        let ctx = ItemContext::from_bytes(&again.context().unwrap()).unwrap();
        assert_eq!(ctx.headers["attempt"], vec!["2"]);
    }

    #[tokio::test]
    async fn test_stop_rejects_pushes() {
        let (consumer, _pq, mut rx) = setup(10);
        let pipe = pipeline();
        consumer.register(pipe.clone()).await.unwrap();
        consumer.run(pipe).await.unwrap();
        consumer.stop().await.unwrap();

        let err = consumer
            .push(Job::new("j", "p").with_pipeline("test-local"))
            .await
            .unwrap_err();
        assert!(matches!(err.root(), JobsError::Stopped));
        assert_eq!(
            drain_kinds(&mut rx),
            vec![EventKind::PipeActive, EventKind::PipeStopped]
        );
    }
}
