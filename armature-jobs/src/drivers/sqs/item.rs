//! SQS message attributes and received items.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::client::{APPROXIMATE_RECEIVE_COUNT, Attribute, SqsApi, SqsMessage};
use crate::error::{JobsError, JobsResult};
use crate::item::{Item, ItemContext};
use crate::job::{
    Headers, Job, Options, RR_DELAY, RR_HEADERS, RR_ID, RR_JOB, RR_MAX_ATTEMPTS, RR_PRIORITY,
    RR_TIMEOUT,
};
use crate::pipeline::Pipeline;

/// SQS accepts delays of at most 15 minutes.
pub const MAX_DELAY: i64 = 900;

const REQUIRED: [&str; 6] = [
    RR_JOB,
    RR_DELAY,
    RR_TIMEOUT,
    RR_PRIORITY,
    RR_MAX_ATTEMPTS,
    RR_HEADERS,
];

/// Reject delays SQS would refuse.
pub fn check_delay(delay: i64) -> JobsResult<i32> {
    if delay > MAX_DELAY {
        return Err(JobsError::DelayTooLarge {
            max: MAX_DELAY,
            provided: delay,
        });
    }
    Ok(delay.max(0) as i32)
}

/// Encode a job as message attributes. The payload travels as the body.
pub fn pack(job: &Job) -> JobsResult<HashMap<String, Attribute>> {
    let o = &job.options;
    let mut attrs = HashMap::with_capacity(REQUIRED.len() + 1);
    attrs.insert(RR_ID.to_string(), Attribute::String(job.ident.clone()));
    attrs.insert(RR_JOB.to_string(), Attribute::String(job.job.clone()));
    attrs.insert(RR_DELAY.to_string(), Attribute::String(o.delay.to_string()));
    attrs.insert(RR_TIMEOUT.to_string(), Attribute::String(o.timeout.to_string()));
    attrs.insert(RR_PRIORITY.to_string(), Attribute::Number(o.priority.to_string()));
    attrs.insert(
        RR_MAX_ATTEMPTS.to_string(),
        Attribute::Number(o.attempts.to_string()),
    );
    attrs.insert(
        RR_HEADERS.to_string(),
        Attribute::Binary(serde_json::to_vec(&job.headers)?),
    );
    Ok(attrs)
}

/// Decoded message together with its delivery count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    pub job: Job,
    pub receive_count: i64,
}

impl Unpacked {
    /// The message was delivered as many times as the job allows.
    pub fn exhausted(&self) -> bool {
        let max = self.job.options.attempts;
        max > 0 && self.receive_count >= max && self.receive_count > 1
    }
}

fn int_attr(msg: &SqsMessage, key: &str) -> JobsResult<i64> {
    msg.message_attributes
        .get(key)
        .and_then(Attribute::as_str)
        .ok_or_else(|| JobsError::Unpack(format!("missing queue attribute: {key}")))?
        .trim()
        .parse()
        .map_err(|e| JobsError::Unpack(format!("{key}: {e}")))
}

/// Decode a received message. Every `rr_*` attribute is required.
pub fn unpack(msg: &SqsMessage, pipeline: &Pipeline) -> JobsResult<Unpacked> {
    let receive_count = msg
        .attributes
        .get(APPROXIMATE_RECEIVE_COUNT)
        .ok_or_else(|| {
            JobsError::Unpack(format!("missing {APPROXIMATE_RECEIVE_COUNT} attribute"))
        })?
        .parse::<i64>()
        .map_err(|e| JobsError::Unpack(format!("{APPROXIMATE_RECEIVE_COUNT}: {e}")))?;

    for key in REQUIRED {
        if !msg.message_attributes.contains_key(key) {
            return Err(JobsError::Unpack(format!("missing queue attribute: {key}")));
        }
    }

    let name = msg
        .message_attributes
        .get(RR_JOB)
        .and_then(Attribute::as_str)
        .ok_or_else(|| JobsError::Unpack(format!("{RR_JOB} must be a string")))?
        .to_string();
    let headers: Headers = msg
        .message_attributes
        .get(RR_HEADERS)
        .and_then(Attribute::as_bytes)
        .map(serde_json::from_slice::<Headers>)
        .transpose()
        .map_err(|e| JobsError::Unpack(format!("{RR_HEADERS}: {e}")))?
        .unwrap_or_default();
    let ident = msg
        .message_attributes
        .get(RR_ID)
        .and_then(Attribute::as_str)
        .filter(|id| !id.is_empty())
        .unwrap_or(msg.message_id.as_str())
        .to_string();

    let mut priority = int_attr(msg, RR_PRIORITY)?;
    if priority == 0 {
        priority = pipeline.priority();
    }

    Ok(Unpacked {
        job: Job {
            job: name,
            ident,
            payload: msg.body.clone(),
            headers,
            options: Options {
                priority,
                pipeline: pipeline.name().to_string(),
                delay: int_attr(msg, RR_DELAY)?,
                timeout: int_attr(msg, RR_TIMEOUT)?,
                attempts: int_attr(msg, RR_MAX_ATTEMPTS)?,
                retry_delay: 0,
            },
        },
        receive_count,
    })
}

/// Job received from an SQS queue.
pub struct SqsItem {
    pub(super) job: Job,
    pub(super) receive_count: i64,
    pub(super) receipt_handle: String,
    pub(super) queue_url: String,
    pub(super) client: Arc<dyn SqsApi>,
}

impl SqsItem {
    /// Whether the broker may deliver the job again.
    pub fn can_retry(&self) -> bool {
        let max = self.job.options.attempts;
        max > 1 && max > self.receive_count + 1
    }
}

#[async_trait]
impl Item for SqsItem {
    fn id(&self) -> &str {
        &self.job.ident
    }

    fn priority(&self) -> i64 {
        self.job.options.priority
    }

    fn body(&self) -> &[u8] {
        self.job.payload.as_bytes()
    }

    fn context(&self) -> JobsResult<Vec<u8>> {
        ItemContext {
            id: self.job.ident.clone(),
            job: self.job.job.clone(),
            headers: self.job.headers.clone(),
            pipeline: self.job.options.pipeline.clone(),
        }
        .to_bytes()
    }

    async fn ack(&mut self) -> JobsResult<()> {
        self.client
            .delete(&self.queue_url, &self.receipt_handle)
            .await
            .map_err(|e| e.with_op("sqs_ack"))
    }

    async fn nack(&mut self) -> JobsResult<()> {
        // left in place, it becomes visible again after the visibility timeout
        if self.can_retry() {
            return Ok(());
        }
        self.client
            .delete(&self.queue_url, &self.receipt_handle)
            .await
            .map_err(|e| e.with_op("sqs_nack"))
    }

    async fn requeue(&mut self, headers: Headers, delay: i64) -> JobsResult<()> {
        const OP: &str = "sqs_requeue";
        let mut job = self.job.clone();
        job.headers = headers;
        job.options.delay = delay;

        let delay_seconds = check_delay(delay).map_err(|e| e.with_op(OP))?;
        let attrs = pack(&job).map_err(|e| e.with_op(OP))?;
        self.client
            .send(&self.queue_url, &job.payload, delay_seconds, attrs)
            .await
            .map_err(|e| e.with_op(OP))?;
        self.client
            .delete(&self.queue_url, &self.receipt_handle)
            .await
            .map_err(|e| e.with_op(OP))
    }
}
