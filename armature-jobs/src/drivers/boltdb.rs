//! Embedded key-value store driver.
//!
//! Not functionally complete: the consumer takes part in the pipeline
//! lifecycle (register, run, pause, resume, stop, state and their events)
//! but `push` always fails with [`JobsError::NotImplemented`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use super::DriverContext;
use crate::consumer::{Consumer, Listeners, PipelineSlot};
use crate::error::{JobsError, JobsResult};
use crate::events::{EventHandler, EventKind, JobEvent};
use crate::job::Job;
use crate::pipeline::Pipeline;
use crate::state::State;

const FILE: &str = "file";

/// Lifecycle-only consumer for the `boltdb` driver.
pub struct BoltDbConsumer {
    file: String,
    pipeline: PipelineSlot,
    listeners: Listeners,
    events: Arc<dyn EventHandler>,
}

impl BoltDbConsumer {
    pub fn from_pipeline(pipeline: &Pipeline, ctx: &DriverContext) -> Self {
        Self {
            file: pipeline.string(FILE, "rr.db"),
            pipeline: PipelineSlot::default(),
            listeners: Listeners::default(),
            events: ctx.events.clone(),
        }
    }

    fn emit(&self, kind: EventKind, started: Instant) {
        let (pipeline, driver) = self.pipeline.names();
        self.events
            .push(JobEvent::new(kind, driver, pipeline).since(started));
    }
}

#[async_trait]
impl Consumer for BoltDbConsumer {
    async fn push(&self, job: Job) -> JobsResult<()> {
        const OP: &str = "boltdb_push";
        self.pipeline
            .check(&job.options.pipeline)
            .map_err(|e| e.with_op(OP))?;
        Err(JobsError::NotImplemented("boltdb push").with_op(OP))
    }

    async fn register(&self, pipeline: Arc<Pipeline>) -> JobsResult<()> {
        self.pipeline.store(pipeline);
        Ok(())
    }

    async fn run(&self, pipeline: Arc<Pipeline>) -> JobsResult<()> {
        let started = Instant::now();
        self.pipeline
            .check(pipeline.name())
            .map_err(|e| e.with_op("boltdb_run"))?;
        if self.listeners.activate() {
            self.emit(EventKind::PipeActive, started);
        }
        Ok(())
    }

    async fn pause(&self, pipeline: &str) {
        let started = Instant::now();
        if self.pipeline.check(pipeline).is_err() {
            return;
        }
        if !self.listeners.deactivate() {
            warn!(pipeline, "no active listeners, nothing to pause");
            return;
        }
        self.emit(EventKind::PipePaused, started);
    }

    async fn resume(&self, pipeline: &str) {
        let started = Instant::now();
        if self.pipeline.check(pipeline).is_err() {
            return;
        }
        if !self.listeners.activate() {
            warn!(pipeline, "listener already in the active state");
            return;
        }
        self.emit(EventKind::PipeActive, started);
    }

    async fn stop(&self) -> JobsResult<()> {
        let started = Instant::now();
        self.listeners.deactivate();
        self.emit(EventKind::PipeStopped, started);
        Ok(())
    }

    async fn state(&self) -> JobsResult<State> {
        let pipe = self.pipeline.load()?;
        Ok(State {
            pipeline: pipe.name().to_string(),
            driver: pipe.driver().to_string(),
            queue: self.file.clone(),
            ready: self.listeners.is_active(),
            ..Default::default()
        })
    }
}
