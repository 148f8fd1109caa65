//! Pipeline registry and pollers.
//!
//! [`Registry`] builds one consumer per configured pipeline, routes pushed
//! jobs to them and runs the pollers that drain the shared priority queue
//! into a [`JobHandler`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::consumer::Consumer;
use crate::dispatcher::Dispatcher;
use crate::drivers::{self, DriverContext};
use crate::error::{JobsError, JobsResult};
use crate::events::EventHandler;
use crate::item::BoxedItem;
use crate::job::Job;
use crate::pipeline::Pipeline;
use crate::priority_queue::JobQueue;
use crate::state::State;

const IDLE_POLL: Duration = Duration::from_millis(10);

/// Executes job payloads pulled from the queue.
///
/// `context` is the JSON encoded [`ItemContext`](crate::item::ItemContext).
/// Returning an error nacks the item.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, context: Vec<u8>, body: Vec<u8>) -> JobsResult<()>;
}

/// [`JobHandler`] backed by an async closure.
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(Vec<u8>, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = JobsResult<()>> + Send,
{
    async fn handle(&self, context: Vec<u8>, body: Vec<u8>) -> JobsResult<()> {
        (self.0)(context, body).await
    }
}

/// Wrap an async closure as a shared [`JobHandler`].
///
/// ```
/// use armature_jobs::registry::handler_fn;
///
/// let handler = handler_fn(|_context, body| async move {
///     println!("running {} bytes", body.len());
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Vec<u8>, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobsResult<()>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Owns pipelines, consumers and pollers.
pub struct Registry {
    config: Arc<Config>,
    pq: Arc<JobQueue>,
    events: Arc<dyn EventHandler>,
    dispatcher: Dispatcher,
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
    consumers: RwLock<HashMap<String, Arc<dyn Consumer>>>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Registry {
    /// Create a registry from validated configuration.
    pub fn new(config: Config, events: Arc<dyn EventHandler>) -> JobsResult<Self> {
        let dispatcher = Dispatcher::new(&config.jobs.dispatch)?;
        let pipelines = config
            .jobs
            .pipelines
            .iter()
            .map(|(name, p)| (name.clone(), Arc::new(p.clone())))
            .collect();

        Ok(Self {
            config: Arc::new(config),
            pq: Arc::new(JobQueue::new()),
            events,
            dispatcher,
            pipelines: RwLock::new(pipelines),
            consumers: RwLock::new(HashMap::new()),
            pollers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Shared queue every consumer feeds.
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.pq
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn driver_context(&self) -> DriverContext {
        DriverContext::new(self.pq.clone(), self.events.clone(), self.config.clone())
    }

    /// Build a consumer for every pipeline, run the consumed ones and start
    /// the pollers.
    pub async fn serve(&self, handler: Arc<dyn JobHandler>) -> JobsResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(JobsError::Stopped);
        }

        let mut pipelines: Vec<Arc<Pipeline>> = self.pipelines.read().values().cloned().collect();
        pipelines.sort_by(|a, b| a.name().cmp(b.name()));

        for pipe in pipelines {
            if self.consumers.read().contains_key(pipe.name()) {
                continue;
            }
            self.start_pipeline(pipe).await?;
        }

        self.start_pollers(handler);
        Ok(())
    }

    async fn start_pipeline(&self, pipe: Arc<Pipeline>) -> JobsResult<()> {
        let consumer = drivers::build(&pipe, &self.driver_context())
            .await
            .map_err(|e| e.with_op("build_consumer"))?;
        self.install_consumer(pipe, consumer).await
    }

    /// Register `consumer`, track it and run it if consumed. A consumer that
    /// fails to start is stopped and dropped.
    async fn install_consumer(&self, pipe: Arc<Pipeline>, consumer: Arc<dyn Consumer>) -> JobsResult<()> {
        let name = pipe.name().to_string();
        let started = async {
            consumer.register(pipe.clone()).await?;
            self.consumers.write().insert(name.clone(), consumer.clone());
            if self.config.jobs.is_consumed(&name) {
                consumer.run(pipe.clone()).await?;
            }
            Ok::<(), JobsError>(())
        }
        .await;

        if let Err(e) = started {
            self.consumers.write().remove(&name);
            if let Err(stop_err) = self.stop_consumer(&name, consumer).await {
                warn!(pipeline = %name, error = %stop_err, "failed to stop consumer after a failed start");
            }
            return Err(e);
        }
        info!(pipeline = %name, driver = %pipe.driver(), "pipeline initialized");
        Ok(())
    }

    fn start_pollers(&self, handler: Arc<dyn JobHandler>) {
        let mut pollers = self.pollers.lock();
        if !pollers.is_empty() {
            warn!("pollers already running");
            return;
        }

        let n = self.config.jobs.num_pollers.max(1);
        for id in 0..n {
            let pq = self.pq.clone();
            let handler = handler.clone();
            let token = self.shutdown.clone();
            pollers.push(tokio::spawn(async move {
                loop {
                    let mut item = tokio::select! {
                        _ = token.cancelled() => break,
                        item = pq.extract_min_async() => item,
                    };
                    process(id, &mut item, handler.as_ref()).await;
                }
                debug!(poller = id, "poller stopped");
            }));
        }
        info!(pollers = n, "pollers started");
    }

    /// Fill routing defaults and resolve the target pipeline.
    ///
    /// A job without an explicit pipeline takes the options of its dispatch
    /// route. A job priority of 0 inherits the pipeline priority.
    pub fn route(&self, job: &mut Job) -> JobsResult<Arc<Pipeline>> {
        if job.options.pipeline.is_empty() {
            let route = self
                .dispatcher
                .match_job(&job.job)
                .ok_or_else(|| JobsError::NoRoute(job.job.clone()))?;
            job.options.merge(route);
            if job.options.pipeline.is_empty() {
                return Err(JobsError::NoRoute(job.job.clone()));
            }
        }

        let pipe = self
            .pipelines
            .read()
            .get(&job.options.pipeline)
            .cloned()
            .ok_or_else(|| JobsError::PipelineNotFound(job.options.pipeline.clone()))?;
        if job.options.priority == 0 {
            job.options.priority = pipe.priority();
        }
        Ok(pipe)
    }

    fn consumer(&self, name: &str) -> JobsResult<Arc<dyn Consumer>> {
        self.consumers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| JobsError::PipelineNotFound(name.to_string()))
    }

    /// Route a job and hand it to its pipeline's consumer.
    pub async fn push(&self, mut job: Job) -> JobsResult<()> {
        const OP: &str = "jobs_push";
        let pipe = self.route(&mut job).map_err(|e| e.with_op(OP))?;
        let consumer = self.consumer(pipe.name()).map_err(|e| e.with_op(OP))?;
        consumer.push(job).await
    }

    /// Push jobs in order, stopping at the first failure.
    pub async fn push_batch(&self, jobs: Vec<Job>) -> JobsResult<()> {
        for job in jobs {
            self.push(job).await?;
        }
        Ok(())
    }

    /// Pause consuming on the named pipelines.
    pub async fn pause(&self, pipelines: &[&str]) {
        for name in pipelines {
            match self.consumer(name) {
                Ok(c) => c.pause(name).await,
                Err(_) => warn!(pipeline = %name, "pause: no such pipeline"),
            }
        }
    }

    /// Resume consuming on the named pipelines.
    pub async fn resume(&self, pipelines: &[&str]) {
        for name in pipelines {
            match self.consumer(name) {
                Ok(c) => c.resume(name).await,
                Err(_) => warn!(pipeline = %name, "resume: no such pipeline"),
            }
        }
    }

    /// Names of all known pipelines, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Add a pipeline at runtime. It starts consuming if listed in `consume`.
    pub async fn declare(&self, pipeline: Pipeline) -> JobsResult<()> {
        const OP: &str = "jobs_declare";
        if pipeline.name().is_empty() || pipeline.driver().is_empty() {
            return Err(JobsError::Config("pipeline needs a name and a driver".into()).with_op(OP));
        }
        let pipe = Arc::new(pipeline);
        {
            let mut pipelines = self.pipelines.write();
            if pipelines.contains_key(pipe.name()) {
                return Err(JobsError::AlreadyRegistered(pipe.name().to_string()).with_op(OP));
            }
            pipelines.insert(pipe.name().to_string(), pipe.clone());
        }

        if let Err(e) = self.start_pipeline(pipe.clone()).await {
            self.pipelines.write().remove(pipe.name());
            return Err(e.with_op(OP));
        }
        Ok(())
    }

    /// Stop a pipeline's consumer and forget the pipeline.
    pub async fn destroy(&self, name: &str) -> JobsResult<()> {
        const OP: &str = "jobs_destroy";
        if self.pipelines.write().remove(name).is_none() {
            return Err(JobsError::PipelineNotFound(name.to_string()).with_op(OP));
        }
        let consumer = self.consumers.write().remove(name);
        if let Some(consumer) = consumer {
            self.stop_consumer(name, consumer).await.map_err(|e| e.with_op(OP))?;
        }
        Ok(())
    }

    /// Snapshot every running pipeline, sorted by name.
    pub async fn states(&self) -> JobsResult<Vec<State>> {
        let mut consumers: Vec<(String, Arc<dyn Consumer>)> = self
            .consumers
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        consumers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::with_capacity(consumers.len());
        for (_, consumer) in consumers {
            out.push(consumer.state().await.map_err(|e| e.with_op("jobs_state"))?);
        }
        Ok(out)
    }

    async fn stop_consumer(&self, name: &str, consumer: Arc<dyn Consumer>) -> JobsResult<()> {
        match tokio::time::timeout(self.config.jobs.timeout_duration(), consumer.stop()).await {
            Ok(result) => result,
            Err(_) => Err(JobsError::Timeout(format!("stopping pipeline `{name}`"))),
        }
    }

    /// Wait until the shared queue is empty or `timeout` passes.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.pq.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
        true
    }

    /// Stop every consumer, then the pollers. Jobs still in the queue are
    /// left to their brokers.
    pub async fn stop(&self) -> JobsResult<()> {
        let consumers: Vec<(String, Arc<dyn Consumer>)> = self.consumers.write().drain().collect();
        let mut first_err = None;
        for (name, consumer) in consumers {
            if let Err(e) = self.stop_consumer(&name, consumer).await {
                error!(error = %e, pipeline = %name, "failed to stop pipeline");
                first_err.get_or_insert(e);
            }
        }

        self.shutdown.cancel();
        let pollers: Vec<JoinHandle<()>> = self.pollers.lock().drain(..).collect();
        let grace = self.config.jobs.timeout_duration();
        for handle in pollers {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                abort.abort();
            }
        }
        info!("jobs registry stopped");

        match first_err {
            Some(e) => Err(e.with_op("jobs_stop")),
            None => Ok(()),
        }
    }
}

async fn process(poller: usize, item: &mut BoxedItem, handler: &dyn JobHandler) {
    let context = match item.context() {
        Ok(c) => c,
        Err(e) => {
            error!(poller, id = %item.id(), error = %e, "job context");
            if let Err(e) = item.nack().await {
                error!(poller, id = %item.id(), error = %e, "nack");
            }
            return;
        }
    };

    let result = handler.handle(context, item.body().to_vec()).await;
    let finalized = match result {
        Ok(()) => item.ack().await,
        Err(e) => {
            warn!(poller, id = %item.id(), error = %e, "job failed");
            item.nack().await
        }
    };
    if let Err(e) = finalized {
        error!(poller, id = %item.id(), error = %e, "failed to finalize job");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::item::{Item, ItemContext};
    use crate::job::Headers;
    use tokio::sync::mpsc;

    const CONFIG: &str = r#"
        [jobs]
        num_pollers = 2
        timeout = 5
        consume = ["local"]

        [jobs.pipelines.local]
        driver = "memory"
        priority = 3

        [jobs.pipelines.idle]
        driver = "memory"

        [jobs.dispatch."mail.*"]
        pipeline = "local"
        attempts = 4
    "#;

    fn registry() -> Registry {
        let config = Config::from_toml_str(CONFIG).unwrap();
        Registry::new(config, Arc::new(EventBus::default())).unwrap()
    }

    fn collector() -> (Arc<dyn JobHandler>, mpsc::UnboundedReceiver<(ItemContext, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |ctx, body| {
            let tx = tx.clone();
            async move {
                let ctx = ItemContext::from_bytes(&ctx)?;
                let body = String::from_utf8(body).map_err(|e| JobsError::Execution(e.to_string()))?;
                let _ = tx.send((ctx, body));
                Ok::<(), JobsError>(())
            }
        });
        (handler, rx)
    }

    struct Recorded {
        body: &'static [u8],
        fail_context: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Item for Recorded {
        fn id(&self) -> &str {
            "rec"
        }
        fn priority(&self) -> i64 {
            1
        }
        fn body(&self) -> &[u8] {
            self.body
        }
        fn context(&self) -> JobsResult<Vec<u8>> {
            if self.fail_context {
                return Err(JobsError::Unpack("broken".into()));
            }
            Ok(b"{}".to_vec())
        }
        async fn ack(&mut self) -> JobsResult<()> {
            self.log.lock().push("ack");
            Ok(())
        }
        async fn nack(&mut self) -> JobsResult<()> {
            self.log.lock().push("nack");
            Ok(())
        }
        async fn requeue(&mut self, _headers: Headers, _delay: i64) -> JobsResult<()> {
            self.log.lock().push("requeue");
            Ok(())
        }
    }

    #[test]
    fn test_route_by_dispatcher() {
        let reg = registry();

        let mut job = Job::new("mail.send", "hi");
        let pipe = reg.route(&mut job).unwrap();
        assert_eq!(pipe.name(), "local");
        assert_eq!(job.options.pipeline, "local");
        assert_eq!(job.options.attempts, 4);
        assert_eq!(job.options.priority, 3);

        let mut job = Job::new("mail.send", "hi").with_pipeline("idle").with_priority(1);
        assert_eq!(reg.route(&mut job).unwrap().name(), "idle");
        assert_eq!(job.options.priority, 1);
        assert_eq!(job.options.attempts, 0);
    }

    #[test]
    fn test_route_errors() {
        let reg = registry();
        let mut job = Job::new("report.build", "x");
        assert!(matches!(reg.route(&mut job), Err(JobsError::NoRoute(_))));

        let mut job = Job::new("x", "x").with_pipeline("missing");
        assert!(matches!(
            reg.route(&mut job),
            Err(JobsError::PipelineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_push_handle() {
        let reg = registry();
        let (handler, mut rx) = collector();
        reg.serve(handler).await.unwrap();
        assert_eq!(reg.list(), vec!["idle", "local"]);

        reg.push(Job::new("mail.send", "hello").with_id("1").with_header("k", "v"))
            .await
            .unwrap();

        let (ctx, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, "hello");
        assert_eq!(ctx.id, "1");
        assert_eq!(ctx.job, "mail.send");
        assert_eq!(ctx.pipeline, "local");
        assert_eq!(ctx.headers["k"], vec!["v"]);

        reg.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_before_serve() {
        let reg = registry();
        let err = reg.push(Job::new("mail.send", "x")).await.unwrap_err();
        assert!(matches!(err.root(), JobsError::PipelineNotFound(_)));
    }

    #[tokio::test]
    async fn test_pause_resume_states() {
        let reg = registry();
        let (handler, _rx) = collector();
        reg.serve(handler).await.unwrap();

        let states = reg.states().await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].pipeline, "idle");
        assert!(!states[0].ready);
        assert!(states[1].ready);

        reg.pause(&["local", "nope"]).await;
        assert!(!reg.states().await.unwrap()[1].ready);
        reg.resume(&["local", "idle"]).await;
        assert!(reg.states().await.unwrap().iter().all(|s| s.ready));

        reg.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_declare_and_destroy() {
        let reg = registry();
        let (handler, mut rx) = collector();
        reg.serve(handler).await.unwrap();

        reg.declare(Pipeline::new("extra", "memory")).await.unwrap();
        assert!(reg.list().contains(&"extra".to_string()));
        let err = reg.declare(Pipeline::new("extra", "memory")).await.unwrap_err();
        assert!(matches!(err.root(), JobsError::AlreadyRegistered(_)));
        let err = reg.declare(Pipeline::new("kafka", "kafka")).await.unwrap_err();
        assert!(matches!(err.root(), JobsError::UnknownDriver(_)));
        assert!(!reg.list().contains(&"kafka".to_string()));

        // declared pipelines are not consumed until resumed
        reg.push(Job::new("j", "later").with_pipeline("extra")).await.unwrap();
        reg.resume(&["extra"]).await;
        let (ctx, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.pipeline, "extra");

        reg.destroy("extra").await.unwrap();
        assert!(!reg.list().contains(&"extra".to_string()));
        let err = reg.destroy("extra").await.unwrap_err();
        assert!(matches!(err.root(), JobsError::PipelineNotFound(_)));

        reg.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_batch_stops_at_first_error() {
        let reg = registry();
        let (handler, mut rx) = collector();
        reg.serve(handler).await.unwrap();

        let err = reg
            .push_batch(vec![
                Job::new("mail.a", "1"),
                Job::new("unknown", "2"),
                Job::new("mail.b", "3"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err.root(), JobsError::NoRoute(_)));

        let (_, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, "1");
        assert!(reg.wait_idle(Duration::from_secs(1)).await);
        assert!(rx.try_recv().is_err());

        reg.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pollers_ack_and_nack() {
        let reg = registry();
        let handler = handler_fn(|_ctx, body| async move {
            if body == b"fail" {
                return Err(JobsError::Execution("boom".into()));
            }
            Ok(())
        });
        reg.serve(handler).await.unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        for (body, fail_context) in [(&b"ok"[..], false), (&b"fail"[..], false), (&b"ok"[..], true)] {
            reg.queue().insert(Box::new(Recorded {
                body,
                fail_context,
                log: log.clone(),
            }));
        }

        for _ in 0..200 {
            if log.lock().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut seen = log.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["ack", "nack", "nack"]);

        reg.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_rejects_serve() {
        let reg = registry();
        reg.stop().await.unwrap();
        let (handler, _rx) = collector();
        assert!(matches!(reg.serve(handler).await, Err(JobsError::Stopped)));
    }

    /// Consumer whose `run` always fails.
    #[derive(Default)]
    struct Unstartable {
        stopped: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Consumer for Unstartable {
        async fn push(&self, _job: Job) -> JobsResult<()> {
            Ok(())
        }
        async fn register(&self, _pipeline: Arc<Pipeline>) -> JobsResult<()> {
            Ok(())
        }
        async fn run(&self, _pipeline: Arc<Pipeline>) -> JobsResult<()> {
            Err(JobsError::Connection("broker unreachable".into()))
        }
        async fn pause(&self, _pipeline: &str) {}
        async fn resume(&self, _pipeline: &str) {}
        async fn stop(&self) -> JobsResult<()> {
            self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn state(&self) -> JobsResult<State> {
            Ok(State::default())
        }
    }

    #[tokio::test]
    async fn test_failed_start_stops_consumer() {
        let reg = registry();
        let consumer = Arc::new(Unstartable::default());
        let pipe = Arc::new(Pipeline::new("local", "memory"));

        let err = reg
            .install_consumer(pipe, consumer.clone())
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
        assert!(consumer.stopped.load(std::sync::atomic::Ordering::SeqCst));
        assert!(reg.consumers.read().is_empty());
    }
}
