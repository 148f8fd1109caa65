//! Pipeline lifecycle events.
//!
//! Drivers report state changes through an [`EventHandler`]. The default
//! [`EventBus`] fans events out over a tokio broadcast channel so any number
//! of observers can subscribe.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Kind of pipeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    /// Listener started or resumed
    PipeActive,
    /// Listener paused
    PipePaused,
    /// Consumer stopped
    PipeStopped,
    /// Listener failed, usually a lost connection
    PipeError,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::PipeActive => "pipe_active",
            EventKind::PipePaused => "pipe_paused",
            EventKind::PipeStopped => "pipe_stopped",
            EventKind::PipeError => "pipe_error",
        };
        f.write_str(s)
    }
}

/// Event emitted by a driver.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub kind: EventKind,
    pub driver: String,
    pub pipeline: String,
    pub start: DateTime<Utc>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl JobEvent {
    /// Event that started now and took no time.
    pub fn new(kind: EventKind, driver: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            kind,
            driver: driver.into(),
            pipeline: pipeline.into(),
            start: Utc::now(),
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    /// Record how long the operation took since `started`.
    pub fn since(mut self, started: Instant) -> Self {
        let elapsed = started.elapsed();
        self.elapsed = elapsed;
        let took = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        self.start = Utc::now() - took;
        self
    }

    /// Attach an error description.
    pub fn with_error(mut self, err: impl fmt::Display) -> Self {
        self.error = Some(err.to_string());
        self
    }
}

/// Sink for driver events.
pub trait EventHandler: Send + Sync {
    fn push(&self, event: JobEvent);
}

/// Broadcast based event handler.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus keeping up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventHandler for EventBus {
    fn push(&self, event: JobEvent) {
        match event.kind {
            EventKind::PipeError => warn!(
                pipeline = %event.pipeline,
                driver = %event.driver,
                error = event.error.as_deref().unwrap_or_default(),
                "pipeline error"
            ),
            kind => debug!(
                pipeline = %event.pipeline,
                driver = %event.driver,
                event = %kind,
                elapsed = ?event.elapsed,
                "pipeline event"
            ),
        }
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}
