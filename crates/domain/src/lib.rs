pub mod entry;
pub mod envelope;
pub mod pending;

pub use entry::StreamEntry;
pub use envelope::{AckMessage, Envelope, MessagePayload, RedisPayload, RedisRef};
pub use pending::{ConsumerDescriptor, PendingRef};
