//! Error classification and retry scheduling.

mod classifier;
mod policy;
mod scheduler;

pub use classifier::{FailureClassifier, PostPersistHook};
pub use policy::{RetryDecision, RetryPolicy};
pub use scheduler::{RecordingRetryScheduler, RetryScheduler, ScheduledRetry};
