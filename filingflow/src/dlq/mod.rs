//! Dead-letter store for terminally failed work.
//!
//! Entries are created once per fatal failure, move from `pending` to
//! `requeued` to `completed`, and are never deleted by the pipeline.

mod payload;
mod store;
mod types;

pub use payload::{normalize_payload, payload_of, Payload, RAW_KEY};
pub use store::DeadLetterStore;
pub use types::{DeadLetterEntry, DeadLetterFilter, DeadLetterStatus, NewDeadLetter};
