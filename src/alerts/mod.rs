pub mod failure;
pub mod sink;

pub use failure::{FailureKind, FailureNotifier, LogFailureNotifier};
pub use sink::{AlertSink, QueueSink, QueuedAlert};
