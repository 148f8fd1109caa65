//! Job drivers.
//!
//! Every driver implements [`Consumer`] for one pipeline and feeds the shared
//! [`JobQueue`]. Broker drivers are behind cargo features:
//!
//! | Driver      | Feature     | Crate               |
//! |-------------|-------------|---------------------|
//! | `ephemeral` | always      | -                   |
//! | `boltdb`    | always      | - (stub)            |
//! | `amqp`      | `amqp`      | `lapin`             |
//! | `beanstalk` | `beanstalk` | -                   |
//! | `sqs`       | `sqs`       | `aws-sdk-sqs`       |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::Config;
use crate::consumer::Consumer;
use crate::error::{JobsError, JobsResult};
use crate::events::EventHandler;
use crate::pipeline::Pipeline;
use crate::priority_queue::JobQueue;

pub mod boltdb;
pub mod ephemeral;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "beanstalk")]
pub mod beanstalk;

#[cfg(feature = "sqs")]
pub mod sqs;

/// Everything a driver needs from its host.
#[derive(Clone)]
pub struct DriverContext {
    /// Queue the listener inserts into
    pub pq: Arc<JobQueue>,
    /// Sink for lifecycle events
    pub events: Arc<dyn EventHandler>,
    /// Global driver sections (`amqp`, `beanstalk`, `sqs`)
    pub config: Arc<Config>,
}

impl DriverContext {
    pub fn new(pq: Arc<JobQueue>, events: Arc<dyn EventHandler>, config: Arc<Config>) -> Self {
        Self { pq, events, config }
    }
}

/// Known drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Ephemeral,
    Amqp,
    Beanstalk,
    Sqs,
    BoltDb,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Ephemeral => "ephemeral",
            DriverKind::Amqp => "amqp",
            DriverKind::Beanstalk => "beanstalk",
            DriverKind::Sqs => "sqs",
            DriverKind::BoltDb => "boltdb",
        }
    }
}

impl FromStr for DriverKind {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ephemeral" | "memory" => Ok(DriverKind::Ephemeral),
            "amqp" => Ok(DriverKind::Amqp),
            "beanstalk" => Ok(DriverKind::Beanstalk),
            "sqs" => Ok(DriverKind::Sqs),
            "boltdb" => Ok(DriverKind::BoltDb),
            other => Err(JobsError::UnknownDriver(other.to_string())),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build an unregistered consumer for `pipeline` using its `driver` key.
pub async fn build(pipeline: &Pipeline, ctx: &DriverContext) -> JobsResult<Arc<dyn Consumer>> {
    let kind: DriverKind = pipeline.driver().parse()?;

    let consumer: Arc<dyn Consumer> = match kind {
        DriverKind::Ephemeral => Arc::new(ephemeral::EphemeralConsumer::from_pipeline(pipeline, ctx)),
        DriverKind::BoltDb => Arc::new(boltdb::BoltDbConsumer::from_pipeline(pipeline, ctx)),

        #[cfg(feature = "amqp")]
        DriverKind::Amqp => Arc::new(amqp::AmqpConsumer::from_pipeline(pipeline, ctx).await?),
        #[cfg(feature = "beanstalk")]
        DriverKind::Beanstalk => {
            Arc::new(beanstalk::BeanstalkConsumer::from_pipeline(pipeline, ctx).await?)
        }
        #[cfg(feature = "sqs")]
        DriverKind::Sqs => Arc::new(sqs::SqsConsumer::from_pipeline(pipeline, ctx).await?),

        #[allow(unreachable_patterns)]
        disabled => {
            return Err(JobsError::Config(format!(
                "driver `{disabled}` is not enabled, rebuild with the `{disabled}` feature"
            )));
        }
    };

    Ok(consumer)
}
