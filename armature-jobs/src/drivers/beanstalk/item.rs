//! Reserved beanstalk jobs.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::conn::ConnPool;
use crate::error::{JobsError, JobsResult};
use crate::item::{Item, ItemContext};
use crate::job::{Headers, Job};
use crate::pipeline::Pipeline;

/// Encode a job as the beanstalk message body.
pub fn pack(job: &Job) -> JobsResult<Vec<u8>> {
    Ok(serde_json::to_vec(job)?)
}

/// Decode a message body, filling pipeline defaults.
pub fn unpack(body: &[u8], pipeline: &Pipeline) -> JobsResult<Job> {
    let mut job: Job =
        serde_json::from_slice(body).map_err(|e| JobsError::Unpack(e.to_string()))?;
    if job.options.pipeline.is_empty() {
        job.options.pipeline = pipeline.name().to_string();
    }
    if job.options.priority == 0 {
        job.options.priority = pipeline.priority();
    }
    Ok(job)
}

/// Job reserved from a tube.
pub struct BeanstalkItem {
    pub(super) id: u64,
    pub(super) job: Job,
    pub(super) pool: Arc<ConnPool>,
    pub(super) tube_priority: u32,
    pub(super) ttr: Duration,
}

#[async_trait]
impl Item for BeanstalkItem {
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
        self.pool
            .delete(self.id)
            .await
            .map_err(|e| e.with_op("beanstalk_ack"))
    }

    async fn nack(&mut self) -> JobsResult<()> {
        self.pool
            .delete(self.id)
            .await
            .map_err(|e| e.with_op("beanstalk_nack"))
    }

    async fn requeue(&mut self, headers: Headers, delay: i64) -> JobsResult<()> {
        const OP: &str = "beanstalk_requeue";
        let mut job = self.job.clone();
        job.headers = headers;
        job.options.delay = delay;

        let body = pack(&job).map_err(|e| e.with_op(OP))?;
        self.pool
            .put(&body, self.tube_priority, job.options.delay_duration(), self.ttr)
            .await
            .map_err(|e| e.with_op(OP))?;
        self.pool.delete(self.id).await.map_err(|e| e.with_op(OP))
    }
}
