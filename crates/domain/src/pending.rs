//! Query results from the stream log's pending-entries list and consumer
//! listing.

use std::time::Duration;

/// One entry in a consumer group's pending-entries list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRef {
    pub id: String,
    pub owning_consumer: String,
    pub idle: Duration,
}

/// One consumer registered against a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDescriptor {
    pub name: String,
    pub pending_count: i64,
    pub idle: Duration,
}
