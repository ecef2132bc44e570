//! Persistence ports and their implementations.
//!
//! A [`Session`] is one unit of work: a transaction owned by the task entry
//! point for its whole lifetime. Stages write through it and never open
//! their own. Stage-local undo uses [`UnitOfWork::begin_stage`] /
//! [`UnitOfWork::rollback_stage`], which map to savepoints in SQL backends.

mod memory;
mod sqlite;

pub use memory::{MemorySession, MemoryStore};
pub use sqlite::{SqliteSession, SqliteSessionFactory};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::core::{AnalysisStatus, Filing, FilingStatus};
use crate::dlq::{DeadLetterEntry, DeadLetterFilter, DeadLetterStatus};
use crate::errors::StoreError;

/// Transaction control.
///
/// After `commit` or `rollback` the session is closed and every further call
/// returns [`StoreError::Closed`].
#[async_trait]
pub trait UnitOfWork: Send {
    /// Marks the start of one stage's writes.
    async fn begin_stage(&mut self) -> Result<(), StoreError>;

    /// Keeps the writes made since `begin_stage`.
    async fn commit_stage(&mut self) -> Result<(), StoreError>;

    /// Discards the writes made since `begin_stage`.
    async fn rollback_stage(&mut self) -> Result<(), StoreError>;

    /// Commits the whole unit of work.
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discards the whole unit of work.
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Filing records and per-filing artifacts.
#[async_trait]
pub trait FilingRepository: Send {
    /// Loads a filing by receipt number.
    async fn load_filing(&mut self, id: &str) -> Result<Option<Filing>, StoreError>;

    /// Inserts a filing or refreshes its descriptive fields.
    ///
    /// Statuses of an existing filing are left alone. Returns true if the
    /// filing was newly inserted.
    async fn upsert_filing(&mut self, filing: &Filing) -> Result<bool, StoreError>;

    /// Stores (or replaces) an artifact of `kind` for a filing.
    async fn save_artifact(
        &mut self,
        filing_id: &str,
        kind: &str,
        value: &Value,
    ) -> Result<(), StoreError>;

    /// Loads an artifact.
    async fn load_artifact(
        &mut self,
        filing_id: &str,
        kind: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Writes the final document and analysis status.
    async fn set_filing_status(
        &mut self,
        filing_id: &str,
        status: FilingStatus,
        analysis: AnalysisStatus,
    ) -> Result<(), StoreError>;
}

/// Dead-letter rows.
#[async_trait]
pub trait DeadLetterRepository: Send {
    /// Inserts a new entry.
    async fn insert_dead_letter(&mut self, entry: &DeadLetterEntry) -> Result<(), StoreError>;

    /// Lists entries matching `filter`, newest first.
    async fn fetch_dead_letters(
        &mut self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Fetches one entry.
    async fn fetch_dead_letter(&mut self, id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Persists status and timestamp changes of an existing entry.
    async fn update_dead_letter(&mut self, entry: &DeadLetterEntry) -> Result<(), StoreError>;

    /// Counts entries per status. Statuses with no rows may be absent.
    async fn count_dead_letters(&mut self) -> Result<BTreeMap<DeadLetterStatus, u64>, StoreError>;
}

/// One unit of work over every repository.
pub trait Session: UnitOfWork + FilingRepository + DeadLetterRepository {}

impl<T> Session for T where T: UnitOfWork + FilingRepository + DeadLetterRepository + ?Sized {}

/// Opens units of work.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Starts a new unit of work.
    async fn open(&self) -> Result<Box<dyn Session>, StoreError>;
}
