//! Producer-facing job record and its delivery options.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Job headers, each key can carry several values.
pub type Headers = HashMap<String, Vec<String>>;

/// Wire header carrying the job identifier.
pub const RR_ID: &str = "rr_id";
/// Wire header carrying the job name.
pub const RR_JOB: &str = "rr_job";
/// Wire header carrying JSON encoded job headers.
pub const RR_HEADERS: &str = "rr_headers";
/// Wire header carrying the pipeline name.
pub const RR_PIPELINE: &str = "rr_pipeline";
/// Wire header carrying the delay in seconds.
pub const RR_DELAY: &str = "rr_delay";
/// Wire header carrying the job priority.
pub const RR_PRIORITY: &str = "rr_priority";
/// Wire header carrying the execution timeout in seconds.
pub const RR_TIMEOUT: &str = "rr_timeout";
/// Wire header carrying the maximum number of attempts.
pub const RR_MAX_ATTEMPTS: &str = "rr_max_attempts";

/// Default execution timeout when none is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Options carry information about how to handle a given job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Job priority, lower values are extracted first. 0 means "inherit from pipeline".
    pub priority: i64,

    /// Pipeline the job is pushed to.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pipeline: String,

    /// Seconds to wait before the job becomes visible.
    #[serde(skip_serializing_if = "is_zero")]
    pub delay: i64,

    /// Seconds the job may run before the broker treats it as failed (0 = 30 minutes).
    #[serde(skip_serializing_if = "is_zero")]
    pub timeout: i64,

    /// Maximum number of attempts. 0 and 1 both mean "run once".
    #[serde(alias = "max_attempts", skip_serializing_if = "is_zero")]
    pub attempts: i64,

    /// Seconds to wait between retries.
    #[serde(skip_serializing_if = "is_zero")]
    pub retry_delay: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Options {
    /// Create options bound to a pipeline.
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            ..Default::default()
        }
    }

    /// Fill unset fields from another set of options.
    pub fn merge(&mut self, from: &Options) {
        if self.pipeline.is_empty() {
            self.pipeline = from.pipeline.clone();
        }
        if self.attempts == 0 {
            self.attempts = from.attempts;
        }
        if self.timeout == 0 {
            self.timeout = from.timeout;
        }
        if self.retry_delay == 0 {
            self.retry_delay = from.retry_delay;
        }
        if self.delay == 0 {
            self.delay = from.delay;
        }
    }

    /// Whether a job on its `attempt`-th (zero based) try may run again.
    pub fn can_retry(&self, attempt: i64) -> bool {
        self.attempts > attempt + 1
    }

    /// Delay as a duration; negative delays count as none.
    pub fn delay_duration(&self) -> Duration {
        Duration::from_secs(self.delay.max(0) as u64)
    }

    /// Retry delay as a duration.
    pub fn retry_duration(&self) -> Duration {
        Duration::from_secs(self.retry_delay.max(0) as u64)
    }

    /// Execution timeout, defaulting to 30 minutes.
    pub fn timeout_duration(&self) -> Duration {
        if self.timeout <= 0 {
            return DEFAULT_TIMEOUT;
        }
        Duration::from_secs(self.timeout as u64)
    }
}

/// A job submitted by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job name, used for routing and by the executor.
    pub job: String,

    /// Unique identifier.
    #[serde(rename = "id")]
    pub ident: String,

    /// Opaque payload, usually JSON.
    pub payload: String,

    /// Key/values attached to the job.
    #[serde(default)]
    pub headers: Headers,

    /// Delivery options.
    #[serde(default)]
    pub options: Options,
}

impl Job {
    /// Create a job with a generated identifier.
    pub fn new(job: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            ident: Uuid::new_v4().to_string(),
            payload: payload.into(),
            headers: Headers::new(),
            options: Options::default(),
        }
    }

    /// Set an explicit identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.ident = id.into();
        self
    }

    /// Route the job to a pipeline.
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.options.pipeline = pipeline.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.options.priority = priority;
        self
    }

    /// Delay visibility by `seconds`.
    pub fn with_delay(mut self, seconds: i64) -> Self {
        self.options.delay = seconds;
        self
    }

    /// Set the maximum number of attempts.
    pub fn with_attempts(mut self, attempts: i64) -> Self {
        self.options.attempts = attempts;
        self
    }

    /// Set the execution timeout in seconds.
    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.options.timeout = seconds;
        self
    }

    /// Append a header value.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Replace all options.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_builder() {
        let job = Job::new("mail.send", r#"{"to":"a@b.c"}"#)
            .with_pipeline("emails")
            .with_priority(3)
            .with_delay(5)
            .with_header("trace", "abc")
            .with_header("trace", "def");

        assert_eq!(job.job, "mail.send");
        assert!(!job.ident.is_empty());
        assert_eq!(job.options.pipeline, "emails");
        assert_eq!(job.options.priority, 3);
        assert_eq!(job.options.delay_duration(), Duration::from_secs(5));
        assert_eq!(job.headers["trace"], vec!["abc", "def"]);
    }

    #[test]
    fn test_options_merge_fills_only_empty_fields() {
        let mut opts = Options {
            delay: 7,
            ..Default::default()
        };
        let route = Options {
            pipeline: "default".into(),
            delay: 60,
            attempts: 3,
            timeout: 10,
            retry_delay: 2,
            priority: 99,
        };

        opts.merge(&route);

        assert_eq!(opts.pipeline, "default");
        assert_eq!(opts.delay, 7);
        assert_eq!(opts.attempts, 3);
        assert_eq!(opts.timeout, 10);
        assert_eq!(opts.retry_delay, 2);
        // priority is resolved from the pipeline, not merged
        assert_eq!(opts.priority, 0);
    }

    #[test]
    fn test_can_retry() {
        let opts = Options {
            attempts: 3,
            ..Default::default()
        };
        assert!(opts.can_retry(0));
        assert!(opts.can_retry(1));
        assert!(!opts.can_retry(2));

        assert!(!Options::default().can_retry(0));
        let once = Options {
            attempts: 1,
            ..Default::default()
        };
        assert!(!once.can_retry(0));
    }

    #[test]
    fn test_timeout_default() {
        assert_eq!(Options::default().timeout_duration(), DEFAULT_TIMEOUT);
        let opts = Options {
            timeout: 15,
            ..Default::default()
        };
        assert_eq!(opts.timeout_duration(), Duration::from_secs(15));
    }

    #[test]
    fn test_job_deserialize_with_missing_options() {
        let job: Job = serde_json::from_str(r#"{"job":"a","id":"1","payload":"p"}"#).unwrap();
        assert_eq!(job.ident, "1");
        assert!(job.headers.is_empty());
        assert_eq!(job.options, Options::default());
    }
}
