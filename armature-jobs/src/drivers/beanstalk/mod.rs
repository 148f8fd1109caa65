//! Beanstalk driver.
//!
//! Jobs are JSON encoded and put into one tube. The listener reserves with
//! `reserve-with-timeout`, so pausing takes effect within `reserve_timeout`.
//! Connection errors on put, reserve and delete redial the pool and retry the
//! command once.

mod conn;
mod item;

pub use conn::{Conn, ConnPool, parse_addr, parse_stats};
pub use item::{BeanstalkItem, pack, unpack};

use async_trait::async_trait;
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

const TUBE: &str = "tube";
const TUBE_PRIORITY: &str = "tube_priority";
const RESERVE_TIMEOUT: &str = "reserve_timeout";

/// How long a redial may keep retrying.
pub const REDIAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Pipeline level beanstalk settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeanstalkSettings {
    pub addr: String,
    pub timeout: Duration,
    pub tube: String,
    pub tube_priority: u32,
    pub reserve_timeout: Duration,
    pub priority: i64,
    pub redial_timeout: Duration,
}

impl BeanstalkSettings {
    pub fn from_pipeline(pipeline: &Pipeline, addr: &str, timeout: Duration) -> Self {
        Self {
            addr: addr.to_string(),
            timeout,
            tube: pipeline.string(TUBE, "default"),
            tube_priority: pipeline.int(TUBE_PRIORITY, 1).clamp(0, i64::from(u32::MAX)) as u32,
            reserve_timeout: pipeline.duration(RESERVE_TIMEOUT, Duration::from_secs(5)),
            priority: pipeline.priority(),
            redial_timeout: REDIAL_TIMEOUT,
        }
    }
}

struct Inner {
    settings: BeanstalkSettings,
    pool: Arc<ConnPool>,
    pipeline: PipelineSlot,
    listeners: Listeners,
    listener: ListenerTask,
    stopped: CancellationToken,
    pq: Arc<JobQueue>,
    events: Arc<dyn EventHandler>,
}

impl Inner {
    fn ttr(&self, job: &Job) -> Duration {
        if job.options.timeout > 0 {
            job.options.timeout_duration()
        } else {
            self.settings.timeout
        }
    }

    fn start_listener(self: &Arc<Self>) {
        let inner = self.clone();
        self.listener.start(move |token| async move {
            while !token.is_cancelled() {
                match inner.pool.reserve(inner.settings.reserve_timeout).await {
                    Ok(Some((id, body))) => inner.handle(id, &body).await,
                    Ok(None) => {}
                    Err(e) if matches!(e.root(), JobsError::Stopped) => break,
                    Err(e) if e.is_connection_error() => {
                        error!(error = %e, tube = %inner.settings.tube, "beanstalk listener stopped");
                        inner.listeners.deactivate();
                        inner.events.push(inner.event(EventKind::PipeError).with_error(&e));
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "reserve failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            debug!(tube = %inner.settings.tube, "beanstalk listener exited");
        });
    }

    async fn handle(&self, id: u64, body: &[u8]) {
        let pipe = match self.pipeline.load() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "reserved a job for an unregistered consumer");
                return;
            }
        };

        match unpack(body, &pipe) {
            Ok(job) => {
                let ttr = self.ttr(&job);
                self.pq.insert(Box::new(BeanstalkItem {
                    id,
                    job,
                    pool: self.pool.clone(),
                    tube_priority: self.settings.tube_priority,
                    ttr,
                }));
            }
            Err(e) => {
                error!(error = %e, id, "failed to unpack job, deleting");
                if let Err(e) = self.pool.delete(id).await {
                    warn!(error = %e, id, "failed to delete broken job");
                }
            }
        }
    }

    fn event(&self, kind: EventKind) -> JobEvent {
        let (pipeline, driver) = self.pipeline.names();
        JobEvent::new(kind, driver, pipeline)
    }
}

/// Beanstalk consumer.
pub struct BeanstalkConsumer {
    inner: Arc<Inner>,
}

impl BeanstalkConsumer {
    pub async fn from_pipeline(pipeline: &Pipeline, ctx: &DriverContext) -> JobsResult<Self> {
        let global = &ctx.config.beanstalk;
        let settings =
            BeanstalkSettings::from_pipeline(pipeline, &global.addr, global.timeout_duration());
        Self::connect(settings, ctx)
            .await
            .map_err(|e| e.with_op("new_beanstalk_consumer"))
    }

    pub async fn connect(settings: BeanstalkSettings, ctx: &DriverContext) -> JobsResult<Self> {
        let pool =
            ConnPool::connect(
                &settings.addr,
                &settings.tube,
                settings.timeout,
                settings.redial_timeout,
            )
            .await?;
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                pool: Arc::new(pool),
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
impl Consumer for BeanstalkConsumer {
    async fn push(&self, job: Job) -> JobsResult<()> {
        const OP: &str = "beanstalk_push";
        self.inner
            .pipeline
            .check(&job.options.pipeline)
            .map_err(|e| e.with_op(OP))?;
        if self.inner.stopped.is_cancelled() {
            return Err(JobsError::Stopped.with_op(OP));
        }

        let body = pack(&job).map_err(|e| e.with_op(OP))?;
        self.inner
            .pool
            .put(
                &body,
                self.inner.settings.tube_priority,
                job.options.delay_duration(),
                self.inner.ttr(&job),
            )
            .await
            .map(|_| ())
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
            .map_err(|e| e.with_op("beanstalk_run"))?;

        if !self.inner.listeners.activate() {
            warn!(pipeline = %pipeline.name(), "listener already in the active state");
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
            warn!(pipeline, "listener already in the active state");
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
        self.inner.pool.close().await;
        self.inner
            .events
            .push(self.inner.event(EventKind::PipeStopped).since(started));
        Ok(())
    }

    async fn state(&self) -> JobsResult<State> {
        const OP: &str = "beanstalk_state";
        let pipe = self.inner.pipeline.load().map_err(|e| e.with_op(OP))?;
        let stats = self.inner.pool.stats().await.map_err(|e| e.with_op(OP))?;
        let count = |key: &str| {
            stats
                .get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };

        Ok(State {
            pipeline: pipe.name().to_string(),
            driver: pipe.driver().to_string(),
            queue: self.inner.settings.tube.clone(),
            active: count("current-jobs-ready"),
            delayed: count("current-jobs-delayed"),
            reserved: count("current-jobs-reserved"),
            ready: self.inner.listeners.is_active(),
        })
    }
}
