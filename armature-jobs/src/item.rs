//! In-flight unit of work handed out by the priority queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobsResult;
use crate::job::Headers;

/// Job context handed to the executor next to the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemContext {
    pub id: String,
    pub job: String,
    pub headers: Headers,
    pub pipeline: String,
}

impl ItemContext {
    /// Encode as JSON.
    pub fn to_bytes(&self) -> JobsResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON.
    pub fn from_bytes(data: &[u8]) -> JobsResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A job received by a driver and waiting to be executed.
///
/// Items are created by a driver listener, owned by the priority queue until
/// extracted, and finalized exactly once with [`Item::ack`], [`Item::nack`]
/// or [`Item::requeue`].
#[async_trait]
pub trait Item: Send + Sync {
    /// Job identifier.
    fn id(&self) -> &str;

    /// Priority, lower values are more urgent.
    fn priority(&self) -> i64;

    /// Raw payload.
    fn body(&self) -> &[u8];

    /// JSON encoded [`ItemContext`].
    fn context(&self) -> JobsResult<Vec<u8>>;

    /// Confirm successful execution.
    async fn ack(&mut self) -> JobsResult<()>;

    /// Report failed execution.
    async fn nack(&mut self) -> JobsResult<()>;

    /// Deliver the job again with new headers and delay.
    async fn requeue(&mut self, headers: Headers, delay: i64) -> JobsResult<()>;
}

/// Boxed item as stored in the shared queue.
pub type BoxedItem = Box<dyn Item>;
