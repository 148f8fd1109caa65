//! AMQP wire format and delivered items.

use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::types::{AMQPValue, FieldTable};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use super::Inner;
use crate::error::{JobsError, JobsResult};
use crate::item::{Item, ItemContext};
use crate::job::{
    Headers, Job, Options, RR_DELAY, RR_HEADERS, RR_ID, RR_JOB, RR_PIPELINE, RR_PRIORITY,
};
use crate::pipeline::Pipeline;

/// Encode job metadata as message headers.
pub fn pack(job: &Job) -> JobsResult<FieldTable> {
    let mut table = FieldTable::default();
    table.insert(RR_ID.into(), AMQPValue::LongString(job.ident.clone().into()));
    table.insert(RR_JOB.into(), AMQPValue::LongString(job.job.clone().into()));
    table.insert(
        RR_PIPELINE.into(),
        AMQPValue::LongString(job.options.pipeline.clone().into()),
    );
    table.insert(
        RR_HEADERS.into(),
        AMQPValue::LongString(serde_json::to_string(&job.headers)?.into()),
    );
    table.insert(RR_DELAY.into(), AMQPValue::LongLongInt(job.options.delay));
    table.insert(
        RR_PRIORITY.into(),
        AMQPValue::LongLongInt(job.options.priority),
    );
    Ok(table)
}

/// Decode a delivered message back into a job.
///
/// `rr_id` and `rr_job` are required; a missing `rr_priority` falls back to
/// the pipeline priority.
pub fn unpack(headers: Option<&FieldTable>, body: &[u8], pipeline: &Pipeline) -> JobsResult<Job> {
    let empty = FieldTable::default();
    let headers = headers.unwrap_or(&empty);
    let get = |key: &str| {
        headers
            .inner()
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v)
    };

    let ident = get(RR_ID)
        .and_then(as_string)
        .ok_or_else(|| JobsError::Unpack(format!("missing header `{RR_ID}`")))?;
    let name = get(RR_JOB)
        .and_then(as_string)
        .ok_or_else(|| JobsError::Unpack(format!("missing header `{RR_JOB}`")))?;

    let job_headers = match get(RR_HEADERS).and_then(as_string) {
        Some(raw) if !raw.is_empty() => serde_json::from_str::<Headers>(&raw)
            .map_err(|e| JobsError::Unpack(format!("`{RR_HEADERS}`: {e}")))?,
        _ => Headers::new(),
    };

    let payload = String::from_utf8(body.to_vec())
        .map_err(|e| JobsError::Unpack(format!("payload is not UTF-8: {e}")))?;

    Ok(Job {
        job: name,
        ident,
        payload,
        headers: job_headers,
        options: Options {
            priority: get(RR_PRIORITY)
                .and_then(as_i64)
                .unwrap_or_else(|| pipeline.priority()),
            pipeline: pipeline.name().to_string(),
            delay: get(RR_DELAY).and_then(as_i64).unwrap_or(0),
            ..Default::default()
        },
    })
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(s.to_string()),
        AMQPValue::ShortString(s) => Some(s.to_string()),
        _ => None,
    }
}

fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongString(s) => s.to_string().trim().parse().ok(),
        _ => None,
    }
}

/// Job delivered by RabbitMQ.
pub struct AmqpItem {
    pub(super) job: Job,
    pub(super) acker: Acker,
    pub(super) multiple_ack: bool,
    pub(super) requeue_on_fail: bool,
    // set when the job went through a delay queue
    pub(super) delayed: Option<Arc<AtomicI64>>,
    pub(super) owner: Weak<Inner>,
}

impl AmqpItem {
    fn release_delayed(&mut self) {
        if let Some(counter) = self.delayed.take() {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[async_trait]
impl Item for AmqpItem {
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
        self.release_delayed();
        self.acker
            .ack(BasicAckOptions {
                multiple: self.multiple_ack,
            })
            .await
            .map(|_| ())?;
        Ok(())
    }

    async fn nack(&mut self) -> JobsResult<()> {
        self.release_delayed();
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: self.requeue_on_fail,
            })
            .await
            .map(|_| ())?;
        Ok(())
    }

    async fn requeue(&mut self, headers: Headers, delay: i64) -> JobsResult<()> {
        const OP: &str = "amqp_requeue";
        self.release_delayed();
        let owner = self.owner.upgrade().ok_or(JobsError::Stopped)?;

        let mut job = self.job.clone();
        job.headers = headers;
        job.options.delay = delay;

        match owner.publish(&job).await {
            Ok(()) => {
                self.acker
                    .ack(BasicAckOptions { multiple: false })
                    .await
                    .map(|_| ())?;
                Ok(())
            }
            Err(e) => {
                self.acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    })
                    .await
                    .map(|_| ())?;
                Err(e.with_op(OP))
            }
        }
    }
}
