//! RabbitMQ driver.
//!
//! One connection carries a consume channel and a publish channel. The
//! publish channel lives in a single-slot [`ChannelPool`]; delayed jobs go
//! through per-delay dead-letter queues (see [`Publisher`]).
//!
//! When the broker reports a connection error, the listener stream breaks,
//! or a publish fails on a dead connection, the consumer redials under exponential backoff for up to five minutes. On
//! success the listener is restarted if it was active; on exhaustion the
//! consumer stays inert and only logs. Stopping the consumer cancels a
//! redial in progress.

mod channel;
mod item;

pub use channel::{ChannelPool, PublishChannel, Publisher};
pub use item::{AmqpItem, pack, unpack};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DriverContext;
use crate::backoff::ExponentialBackoff;
use crate::consumer::{Consumer, ListenerTask, Listeners, PipelineSlot};
use crate::error::{JobsError, JobsResult};
use crate::events::{EventHandler, EventKind, JobEvent};
use crate::job::Job;
use crate::pipeline::Pipeline;
use crate::priority_queue::JobQueue;
use crate::state::State;

const EXCHANGE: &str = "exchange";
const EXCHANGE_TYPE: &str = "exchange_type";
const QUEUE: &str = "queue";
const ROUTING_KEY: &str = "routing_key";
const PREFETCH: &str = "prefetch";
const EXCLUSIVE: &str = "exclusive";
const MULTIPLE_ACK: &str = "multiple_ack";
const REQUEUE_ON_FAIL: &str = "requeue_on_fail";

/// How long a redial may keep retrying.
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Pipeline level AMQP settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpSettings {
    pub addr: String,
    pub exchange: String,
    pub exchange_type: String,
    pub queue: String,
    pub routing_key: String,
    pub prefetch: u16,
    pub priority: i64,
    pub exclusive: bool,
    pub multiple_ack: bool,
    pub requeue_on_fail: bool,
    pub consumer_tag: String,
}

impl AmqpSettings {
    /// Read settings from a pipeline, using `addr` from the global section.
    pub fn from_pipeline(pipeline: &Pipeline, addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            exchange: pipeline.string(EXCHANGE, "amqp.default"),
            exchange_type: pipeline.string(EXCHANGE_TYPE, "direct"),
            queue: pipeline.string(QUEUE, "default"),
            routing_key: pipeline.string(ROUTING_KEY, ""),
            prefetch: pipeline.int(PREFETCH, 10).clamp(1, i64::from(u16::MAX)) as u16,
            priority: pipeline.priority(),
            exclusive: pipeline.bool(EXCLUSIVE, false),
            multiple_ack: pipeline.bool(MULTIPLE_ACK, false),
            requeue_on_fail: pipeline.bool(REQUEUE_ON_FAIL, false),
            consumer_tag: format!("armature-jobs-{}", uuid::Uuid::new_v4()),
        }
    }

    fn exchange_kind(&self) -> ExchangeKind {
        match self.exchange_type.to_lowercase().as_str() {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }
}

struct Dialed {
    generation: u64,
    connection: Connection,
    consume: Channel,
    publish: Channel,
}

pub(crate) struct Inner {
    settings: AmqpSettings,
    pipeline: PipelineSlot,
    listeners: Listeners,
    listener: ListenerTask,

    // guards every connection-affecting operation
    conn: tokio::sync::Mutex<Option<Connection>>,
    consume: parking_lot::Mutex<Option<Channel>>,
    publish: ChannelPool<Channel>,
    publisher: Publisher,

    delayed: Arc<AtomicI64>,
    redialing: AtomicBool,
    // dial counter and the generation of the installed connection, 0 when none
    dials: AtomicU64,
    current: AtomicU64,
    retry_timeout: Duration,
    stopped: CancellationToken,

    pq: Arc<JobQueue>,
    events: Arc<dyn EventHandler>,
}

impl Inner {
    fn new(settings: AmqpSettings, ctx: &DriverContext, retry_timeout: Duration) -> Arc<Self> {
        let publisher = Publisher::new(&settings.exchange, &settings.queue, &settings.routing_key);
        Arc::new(Self {
            settings,
            pipeline: PipelineSlot::default(),
            listeners: Listeners::default(),
            listener: ListenerTask::default(),
            conn: tokio::sync::Mutex::new(None),
            consume: parking_lot::Mutex::new(None),
            publish: ChannelPool::new(None),
            publisher,
            delayed: Arc::new(AtomicI64::new(0)),
            redialing: AtomicBool::new(false),
            dials: AtomicU64::new(0),
            current: AtomicU64::new(0),
            retry_timeout,
            stopped: CancellationToken::new(),
            pq: ctx.pq.clone(),
            events: ctx.events.clone(),
        })
    }

    async fn dial(self: &Arc<Self>) -> JobsResult<Dialed> {
        let s = &self.settings;
        let connection = Connection::connect(&s.addr, ConnectionProperties::default()).await?;

        let generation = self.dials.fetch_add(1, Ordering::AcqRel) + 1;
        let owner = Arc::downgrade(self);
        let runtime = tokio::runtime::Handle::current();
        connection.on_error(move |err: lapin::Error| {
            if let Some(inner) = owner.upgrade() {
                inner.on_connection_error(generation, err.to_string(), &runtime);
            }
        });

        let setup = connection.create_channel().await?;
        setup
            .exchange_declare(
                &s.exchange,
                s.exchange_kind(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        setup
            .queue_declare(
                &s.queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: s.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        setup
            .queue_bind(
                &s.queue,
                &s.exchange,
                &s.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        setup.close(200, "setup done").await?;

        let consume = connection.create_channel().await?;
        consume
            .basic_qos(s.prefetch, BasicQosOptions::default())
            .await?;
        let publish = connection.create_channel().await?;

        info!(addr = %redact(&s.addr), queue = %s.queue, exchange = %s.exchange, "connected to RabbitMQ");
        Ok(Dialed {
            generation,
            connection,
            consume,
            publish,
        })
    }

    /// Redial when the live connection reports an error. Errors from a
    /// connection that was already replaced are ignored.
    fn on_connection_error(
        self: Arc<Self>,
        generation: u64,
        reason: String,
        runtime: &tokio::runtime::Handle,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self.current.load(Ordering::Acquire) != generation {
            debug!(generation, reason = %reason, "stale connection error ignored");
            return None;
        }
        Some(runtime.spawn(self.redial(reason)))
    }

    /// Make `dialed` the live connection. The caller holds the conn lock.
    async fn install(&self, conn: &mut Option<Connection>, dialed: Dialed) {
        *conn = Some(dialed.connection);
        *self.consume.lock() = Some(dialed.consume);
        self.publish.checkin(dialed.publish).await;
        self.current.store(dialed.generation, Ordering::Release);
    }

    /// Drop the live connection and its channels. The caller holds the conn lock.
    async fn teardown(&self, conn: &mut Option<Connection>) -> Option<Connection> {
        self.current.store(0, Ordering::Release);
        drop(self.publish.drain().await);
        self.consume.lock().take();
        self.publisher.forget();
        conn.take()
    }

    pub(crate) async fn publish(self: &Arc<Self>, job: &Job) -> JobsResult<()> {
        let result = {
            let channel = self.publish.checkout().await?;
            self.publisher.publish(&*channel, job).await
        };

        match result {
            Ok(()) => {
                if job.options.delay > 0 {
                    self.delayed.fetch_add(1, Ordering::AcqRel);
                }
                Ok(())
            }
            Err(e) => {
                if e.is_connection_error() {
                    tokio::spawn(self.clone().redial(e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Subscribe on the consume channel and spawn the listener.
    async fn start_listener(self: &Arc<Self>) -> JobsResult<()> {
        let channel = self
            .consume
            .lock()
            .clone()
            .ok_or_else(|| JobsError::Connection("consume channel is not available".into()))?;

        let mut deliveries = channel
            .basic_consume(
                &self.settings.queue,
                &self.settings.consumer_tag,
                BasicConsumeOptions {
                    exclusive: self.settings.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let inner = self.clone();
        self.listener.start(move |token| async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    next = deliveries.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => inner.handle_delivery(delivery).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "delivery stream failed");
                        tokio::spawn(inner.clone().redial(e.to_string()));
                        return;
                    }
                    None => {
                        if !token.is_cancelled() {
                            tokio::spawn(inner.clone().redial("delivery stream closed".into()));
                        }
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_delivery(self: &Arc<Self>, delivery: lapin::message::Delivery) {
        let pipe = match self.pipeline.load() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "delivery for an unregistered consumer");
                return;
            }
        };

        let unpacked = unpack(delivery.properties.headers().as_ref(), &delivery.data, &pipe);
        match unpacked {
            Ok(job) => {
                let delayed = (job.options.delay > 0).then(|| self.delayed.clone());
                let item = AmqpItem {
                    job,
                    acker: delivery.acker,
                    multiple_ack: self.settings.multiple_ack,
                    requeue_on_fail: self.settings.requeue_on_fail,
                    delayed,
                    owner: Arc::downgrade(self),
                };
                self.pq.insert(Box::new(item));
            }
            Err(e) => {
                error!(error = %e, pipeline = %pipe.name(), "failed to unpack delivery, rejecting");
                if let Err(e) = delivery
                    .acker
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                {
                    warn!(error = %e, "failed to reject delivery");
                }
            }
        }
    }

    async fn cancel_consume(&self) {
        let channel = self.consume.lock().clone();
        if let Some(channel) = channel
            && let Err(e) = channel
                .basic_cancel(&self.settings.consumer_tag, BasicCancelOptions::default())
                .await
        {
            warn!(error = %e, "failed to cancel consumer");
        }
    }

    // boxed: the listener spawns redial, and redial restarts the listener
    fn redial(self: Arc<Self>, reason: String) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.do_redial(reason).await })
    }

    async fn do_redial(self: Arc<Self>, reason: String) {
        if self.stopped.is_cancelled() || self.redialing.swap(true, Ordering::AcqRel) {
            return;
        }
        let started = Instant::now();

        {
            let mut conn = self.conn.lock().await;
            if self.stopped.is_cancelled() {
                self.redialing.store(false, Ordering::Release);
                return;
            }
            drop(self.teardown(&mut conn).await);
        }
        self.events
            .push(self.event(EventKind::PipeError).with_error(&reason));
        warn!(reason = %reason, "connection lost, redialing");

        // dial without the conn lock so stop() is never stuck behind the backoff
        let backoff = ExponentialBackoff::with_max_elapsed(self.retry_timeout);
        let dialed = tokio::select! {
            _ = self.stopped.cancelled() => {
                debug!("consumer stopped during redial");
                self.redialing.store(false, Ordering::Release);
                return;
            }
            dialed = backoff.retry(|| self.dial()) => dialed,
        };
        let dialed = match dialed {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "redial retry timeout exceeded, consumer is inert");
                self.redialing.store(false, Ordering::Release);
                return;
            }
        };

        let mut conn = self.conn.lock().await;
        if self.stopped.is_cancelled() {
            if let Err(e) = dialed.connection.close(200, "consumer stopped").await {
                warn!(error = %e, "failed to close redialed connection");
            }
            self.redialing.store(false, Ordering::Release);
            return;
        }
        self.install(&mut conn, dialed).await;

        if self.listeners.is_active()
            && let Err(e) = self.start_listener().await
        {
            error!(error = %e, "failed to restart listener after redial");
        }

        self.redialing.store(false, Ordering::Release);
        info!(elapsed = ?started.elapsed(), "redial done");
        // emitted under the conn lock so it cannot follow PipeStopped
        self.events
            .push(self.event(EventKind::PipeActive).since(started));
    }

    fn event(&self, kind: EventKind) -> JobEvent {
        let (pipeline, driver) = self.pipeline.names();
        JobEvent::new(kind, driver, pipeline)
    }
}

/// RabbitMQ consumer.
pub struct AmqpConsumer {
    inner: Arc<Inner>,
}

impl AmqpConsumer {
    /// Connect and declare the pipeline's exchange and queue.
    pub async fn from_pipeline(pipeline: &Pipeline, ctx: &DriverContext) -> JobsResult<Self> {
        let settings = AmqpSettings::from_pipeline(pipeline, &ctx.config.amqp.addr);
        Self::connect(settings, ctx)
            .await
            .map_err(|e| e.with_op("new_amqp_consumer"))
    }

    /// Connect with explicit settings.
    pub async fn connect(settings: AmqpSettings, ctx: &DriverContext) -> JobsResult<Self> {
        let inner = Inner::new(settings, ctx, RETRY_TIMEOUT);
        let dialed = inner.dial().await?;
        {
            let mut conn = inner.conn.lock().await;
            inner.install(&mut conn, dialed).await;
        }
        Ok(Self { inner })
    }

    /// Settings in use.
    pub fn settings(&self) -> &AmqpSettings {
        &self.inner.settings
    }
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn push(&self, job: Job) -> JobsResult<()> {
        const OP: &str = "amqp_push";
        self.inner
            .pipeline
            .check(&job.options.pipeline)
            .map_err(|e| e.with_op(OP))?;
        if self.inner.stopped.is_cancelled() {
            return Err(JobsError::Stopped.with_op(OP));
        }
        self.inner.publish(&job).await.map_err(|e| e.with_op(OP))
    }

    async fn register(&self, pipeline: Arc<Pipeline>) -> JobsResult<()> {
        self.inner.pipeline.store(pipeline);
        Ok(())
    }

    async fn run(&self, pipeline: Arc<Pipeline>) -> JobsResult<()> {
        const OP: &str = "amqp_run";
        let started = Instant::now();
        self.inner
            .pipeline
            .check(pipeline.name())
            .map_err(|e| e.with_op(OP))?;

        if !self.inner.listeners.activate() {
            warn!(pipeline = %pipeline.name(), "listener already in the active state");
            return Ok(());
        }
        if let Err(e) = self.inner.start_listener().await {
            self.inner.listeners.deactivate();
            return Err(e.with_op(OP));
        }
        self.inner
            .events
            .push(self.inner.event(EventKind::PipeActive).since(started));
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

        let _conn = self.inner.conn.lock().await;
        self.inner.listener.stop();
        self.inner.cancel_consume().await;
        self.inner
            .events
            .push(self.inner.event(EventKind::PipePaused).since(started));
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

        let _conn = self.inner.conn.lock().await;
        if let Err(e) = self.inner.start_listener().await {
            self.inner.listeners.deactivate();
            error!(error = %e, pipeline, "failed to resume listener");
            return;
        }
        self.inner
            .events
            .push(self.inner.event(EventKind::PipeActive).since(started));
    }

    async fn stop(&self) -> JobsResult<()> {
        let started = Instant::now();
        self.inner.stopped.cancel();
        self.inner.listener.stop();
        self.inner.listeners.deactivate();

        let mut conn = self.inner.conn.lock().await;
        self.inner.current.store(0, Ordering::Release);
        if let Some(ch) = self.inner.publish.drain().await
            && let Err(e) = ch.close(200, "consumer stopped").await
        {
            warn!(error = %e, "failed to close publish channel");
        }
        let consume = self.inner.consume.lock().take();
        if let Some(ch) = consume
            && let Err(e) = ch.close(200, "consumer stopped").await
        {
            warn!(error = %e, "failed to close consume channel");
        }
        if let Some(c) = conn.take()
            && let Err(e) = c.close(200, "consumer stopped").await
        {
            warn!(error = %e, "failed to close connection");
        }

        debug!(queue = %self.inner.settings.queue, "amqp consumer stopped");
        self.inner
            .events
            .push(self.inner.event(EventKind::PipeStopped).since(started));
        Ok(())
    }

    async fn state(&self) -> JobsResult<State> {
        const OP: &str = "amqp_state";
        let pipe = self.inner.pipeline.load().map_err(|e| e.with_op(OP))?;

        let active = {
            let channel = self.inner.publish.checkout().await.map_err(|e| e.with_op(OP))?;
            let queue = channel
                .queue_declare(
                    &self.inner.settings.queue,
                    QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| JobsError::from(e).with_op(OP))?;
            i64::from(queue.message_count())
        };

        Ok(State {
            pipeline: pipe.name().to_string(),
            driver: pipe.driver().to_string(),
            queue: self.inner.settings.queue.clone(),
            active,
            delayed: self.inner.delayed.load(Ordering::Acquire).max(0),
            reserved: 0,
            ready: self.inner.listeners.is_active(),
        })
    }
}

/// Hide the password part of an AMQP URI.
fn redact(addr: &str) -> String {
    match (addr.find("://"), addr.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            let creds = &addr[scheme + 3..at];
            match creds.split_once(':') {
                Some((user, _)) => format!("{}{user}:***{}", &addr[..scheme + 3], &addr[at..]),
                None => addr.to_string(),
            }
        }
        _ => addr.to_string(),
    }
}
