//! Pipeline state snapshots.

use serde::{Deserialize, Serialize};

/// Point-in-time view of a pipeline as reported by its driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Pipeline name
    pub pipeline: String,
    /// Driver name
    pub driver: String,
    /// Broker side queue, tube or topic
    pub queue: String,
    /// Jobs waiting to be consumed
    pub active: i64,
    /// Jobs waiting for their delay to expire
    pub delayed: i64,
    /// Jobs taken by a consumer but not finalized
    pub reserved: i64,
    /// Whether a listener is running
    pub ready: bool,
}
