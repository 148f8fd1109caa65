//! Broker-agnostic job pipelines for Armature.
//!
//! Producers push jobs tagged with a pipeline. Each pipeline is served by a
//! driver that moves jobs from wherever they are queued into one shared,
//! in-process priority queue, from which pollers hand them to a
//! [`JobHandler`] and then ack, nack or requeue them.
//!
//! - 🧠 `ephemeral` - in-memory buffer with delayed jobs
//! - 🐇 `amqp` - RabbitMQ, delayed jobs through dead-letter queues
//! - 🌱 `beanstalk` - beanstalkd tubes
//! - ☁️ `sqs` - AWS SQS with receive-count based retries
//! - 🗄️ `boltdb` - lifecycle only, pushing is not implemented yet
//!
//! ## Features
//!
//! - `amqp` - RabbitMQ driver (`lapin`)
//! - `beanstalk` - beanstalkd driver
//! - `sqs` - AWS SQS driver (`aws-sdk-sqs`)
//! - `full` - all drivers (the default)
//!
//! ## Jobs
//!
//! ```
//! use armature_jobs::Job;
//!
//! let job = Job::new("mail.send", r#"{"to":"user@example.com"}"#)
//!     .with_pipeline("emails")
//!     .with_priority(1)
//!     .with_delay(30)
//!     .with_header("tenant", "acme");
//!
//! assert_eq!(job.options.pipeline, "emails");
//! assert_eq!(job.options.delay_duration().as_secs(), 30);
//! ```
//!
//! ## Routing
//!
//! ```
//! use armature_jobs::{Dispatcher, Options};
//! use std::collections::HashMap;
//!
//! let routes = HashMap::from([
//!     ("mail.*".to_string(), Options::new("emails")),
//!     ("mail.bulk.*".to_string(), Options::new("bulk")),
//! ]);
//! let dispatcher = Dispatcher::new(&routes).unwrap();
//!
//! assert_eq!(dispatcher.match_job("mail.send").unwrap().pipeline, "emails");
//! assert_eq!(dispatcher.match_job("mail.bulk.news").unwrap().pipeline, "bulk");
//! assert!(dispatcher.match_job("report.build").is_none());
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use armature_jobs::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> JobsResult<()> {
//!     armature_jobs::logging::init_from_env()?;
//!
//!     let config = Config::from_toml_str(r#"
//!         [jobs]
//!         consume = ["local"]
//!
//!         [jobs.pipelines.local]
//!         driver = "memory"
//!
//!         [jobs.dispatch."mail.*"]
//!         pipeline = "local"
//!     "#)?;
//!
//!     let registry = Registry::new(config, Arc::new(EventBus::default()))?;
//!     registry
//!         .serve(handler_fn(|_context, body| async move {
//!             println!("{}", String::from_utf8_lossy(&body));
//!             Ok(())
//!         }))
//!         .await?;
//!
//!     registry.push(Job::new("mail.send", "hello")).await?;
//!     registry.stop().await
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod drivers;
pub mod error;
pub mod events;
pub mod item;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod priority_queue;
pub mod registry;
pub mod state;

pub use backoff::ExponentialBackoff;
pub use config::{AmqpConfig, BeanstalkConfig, Config, JobsConfig, SqsConfig};
pub use consumer::Consumer;
pub use dispatcher::Dispatcher;
pub use drivers::{DriverContext, DriverKind};
pub use error::{JobsError, JobsResult};
pub use events::{EventBus, EventHandler, EventKind, JobEvent};
pub use item::{BoxedItem, Item, ItemContext};
pub use job::{Headers, Job, Options};
pub use pipeline::Pipeline;
pub use priority_queue::{JobQueue, Prioritized, PriorityQueue};
pub use registry::{JobHandler, Registry, handler_fn};
pub use state::State;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::consumer::Consumer;
    pub use crate::error::{JobsError, JobsResult};
    pub use crate::events::{EventBus, EventHandler, EventKind, JobEvent};
    pub use crate::item::{Item, ItemContext};
    pub use crate::job::{Headers, Job, Options};
    pub use crate::pipeline::Pipeline;
    pub use crate::registry::{JobHandler, Registry, handler_fn};
    pub use crate::state::State;
}
