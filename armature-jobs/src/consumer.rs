//! Driver contract and the small pieces of state every driver shares.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{JobsError, JobsResult};
use crate::job::Job;
use crate::pipeline::Pipeline;
use crate::state::State;

/// Per-pipeline driver adapter.
///
/// A consumer is bound to exactly one pipeline by [`Consumer::register`].
/// Listening is a gate: [`Consumer::run`] and [`Consumer::resume`] open it,
/// [`Consumer::pause`] closes it, and both are no-ops (with a warning) when
/// the gate is already in the requested position.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Submit a job. Fails when the job targets another pipeline.
    async fn push(&self, job: Job) -> JobsResult<()>;

    /// Bind the consumer to a pipeline.
    async fn register(&self, pipeline: Arc<Pipeline>) -> JobsResult<()>;

    /// Start listening.
    async fn run(&self, pipeline: Arc<Pipeline>) -> JobsResult<()>;

    /// Stop listening, keeping the connection.
    async fn pause(&self, pipeline: &str);

    /// Restart listening after a pause.
    async fn resume(&self, pipeline: &str);

    /// Release every resource. The consumer is unusable afterwards.
    async fn stop(&self) -> JobsResult<()>;

    /// Snapshot of the pipeline.
    async fn state(&self) -> JobsResult<State>;
}

/// Listener gate: 0 idle, 1 active.
#[derive(Debug, Default)]
pub struct Listeners(AtomicU32);

impl Listeners {
    /// Open the gate. Returns `false` if it was already open.
    pub fn activate(&self) -> bool {
        self.0
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Close the gate. Returns `false` if it was already closed.
    pub fn deactivate(&self) -> bool {
        self.0
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.count() > 0
    }
}

/// The pipeline a consumer is bound to.
#[derive(Debug, Default)]
pub struct PipelineSlot(RwLock<Option<Arc<Pipeline>>>);

impl PipelineSlot {
    /// Store a pipeline, returning the previous one.
    pub fn store(&self, pipeline: Arc<Pipeline>) -> Option<Arc<Pipeline>> {
        self.0.write().replace(pipeline)
    }

    /// Registered pipeline.
    pub fn load(&self) -> JobsResult<Arc<Pipeline>> {
        self.0.read().clone().ok_or(JobsError::NotRegistered)
    }

    /// Registered pipeline, provided its name is `name`.
    pub fn check(&self, name: &str) -> JobsResult<Arc<Pipeline>> {
        let pipe = self.load()?;
        if pipe.name() != name {
            return Err(JobsError::NoSuchPipeline {
                requested: name.to_string(),
                actual: pipe.name().to_string(),
            });
        }
        Ok(pipe)
    }

    /// Pipeline and driver names, empty when unregistered.
    pub fn names(&self) -> (String, String) {
        match self.0.read().as_ref() {
            Some(p) => (p.name().to_string(), p.driver().to_string()),
            None => (String::new(), String::new()),
        }
    }
}

/// Background listener task stopped through a cancellation token.
#[derive(Debug, Default)]
pub struct ListenerTask(Mutex<Option<(CancellationToken, JoinHandle<()>)>>);

impl ListenerTask {
    /// Spawn `listen`, cancelling any listener still running.
    pub fn start<F, Fut>(&self, listen: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(listen(token.clone()));
        if let Some((old, _)) = self.0.lock().replace((token, handle)) {
            old.cancel();
        }
    }

    /// Cancel the listener. Returns `false` when none was running.
    pub fn stop(&self) -> bool {
        match self.0.lock().take() {
            Some((token, _)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.0
            .lock()
            .as_ref()
            .is_some_and(|(token, handle)| !token.is_cancelled() && !handle.is_finished())
    }
}
