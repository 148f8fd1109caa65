//! Error types for job pipelines and drivers.

use thiserror::Error;

/// Result type for job operations.
pub type JobsResult<T> = Result<T, JobsError>;

/// Job-specific errors.
#[derive(Debug, Error)]
pub enum JobsError {
    /// Error raised inside a named operation (e.g. `amqp_push`).
    #[error("{op}: {source}")]
    Op {
        op: &'static str,
        #[source]
        source: Box<JobsError>,
    },

    /// Job was pushed to a consumer bound to another pipeline
    #[error("no such pipeline: {requested}, actual: {actual}")]
    NoSuchPipeline { requested: String, actual: String },

    /// Pipeline lookup by name failed
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    /// Consumer has no registered pipeline yet
    #[error("no pipeline registered")]
    NotRegistered,

    /// Pipeline was registered twice on a driver that forbids it
    #[error("pipeline {0} has already been registered")]
    AlreadyRegistered(String),

    /// No pipeline could be resolved for a job
    #[error("unable to locate pipeline for `{0}`")]
    NoRoute(String),

    /// Unknown or disabled driver
    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    /// Job delay is larger than the driver supports
    #[error("maximum possible delay is {max} seconds, provided: {provided}")]
    DelayTooLarge { max: i64, provided: i64 },

    /// Local buffer or delay slots are exhausted
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation did not complete before the deadline
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Broker connection failed or was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// Broker returned an error for an otherwise valid request
    #[error("broker error: {0}")]
    Broker(String),

    /// Broker side queue does not exist
    #[error("queue does not exist: {0}")]
    QueueNotFound(String),

    /// Message could not be decoded into a job
    #[error("unpack error: {0}")]
    Unpack(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Driver does not implement the operation
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Consumer or registry has been stopped
    #[error("stopped")]
    Stopped,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Job handler reported a failure
    #[error("job execution failed: {0}")]
    Execution(String),
}

impl JobsError {
    /// Tag the error with the operation that produced it.
    pub fn with_op(self, op: &'static str) -> Self {
        JobsError::Op {
            op,
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping operation tags.
    pub fn root(&self) -> &JobsError {
        match self {
            JobsError::Op { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is a deadline failure
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), JobsError::Timeout(_))
    }

    /// Check if this error indicates a lost broker connection
    pub fn is_connection_error(&self) -> bool {
        matches!(self.root(), JobsError::Connection(_) | JobsError::Io(_))
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for JobsError {
    fn from(err: lapin::Error) -> Self {
        match err.kind() {
            lapin::ErrorKind::IOError(_) => JobsError::Connection(err.to_string()),
            lapin::ErrorKind::InvalidConnectionState(_) => JobsError::Connection(err.to_string()),
            lapin::ErrorKind::InvalidChannelState(..) => JobsError::Connection(err.to_string()),
            _ => JobsError::Broker(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for JobsError {
    fn from(err: toml::de::Error) -> Self {
        JobsError::Config(err.to_string())
    }
}
