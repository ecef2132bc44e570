//! In-process store with the same transactional semantics as SQLite.
//!
//! Each session reads from a private working copy and journals its writes.
//! A stage marker remembers where the journal stood when the stage began,
//! so a stage rollback restores the copy and truncates the journal. Commit
//! replays the journal onto the shared state under one lock.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::{DeadLetterRepository, FilingRepository, Session, SessionFactory, UnitOfWork};
use crate::core::{AnalysisStatus, Filing, FilingStatus};
use crate::dlq::{DeadLetterEntry, DeadLetterFilter, DeadLetterStatus};
use crate::errors::StoreError;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    filings: HashMap<String, Filing>,
    artifacts: HashMap<(String, String), Value>,
    dead_letters: Vec<DeadLetterEntry>,
}

#[derive(Debug, Clone)]
enum Op {
    UpsertFiling(Filing),
    SaveArtifact {
        filing_id: String,
        kind: String,
        value: Value,
    },
    SetStatus {
        filing_id: String,
        status: FilingStatus,
        analysis: AnalysisStatus,
    },
    InsertDeadLetter(DeadLetterEntry),
    UpdateDeadLetter(DeadLetterEntry),
}

impl MemoryState {
    fn apply(&mut self, op: &Op) {
        match op {
            Op::UpsertFiling(filing) => match self.filings.get_mut(&filing.id) {
                Some(existing) => {
                    existing.corp_code = filing.corp_code.clone();
                    existing.ticker = filing.ticker.clone();
                    existing.title = filing.title.clone();
                    existing.source_path = filing.source_path.clone();
                }
                None => {
                    self.filings.insert(filing.id.clone(), filing.clone());
                }
            },
            Op::SaveArtifact {
                filing_id,
                kind,
                value,
            } => {
                self.artifacts
                    .insert((filing_id.clone(), kind.clone()), value.clone());
            }
            Op::SetStatus {
                filing_id,
                status,
                analysis,
            } => {
                if let Some(filing) = self.filings.get_mut(filing_id) {
                    filing.status = *status;
                    filing.analysis_status = *analysis;
                }
            }
            Op::InsertDeadLetter(entry) => self.dead_letters.push(entry.clone()),
            Op::UpdateDeadLetter(entry) => {
                if let Some(existing) = self.dead_letters.iter_mut().find(|e| e.id == entry.id) {
                    *existing = entry.clone();
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MemoryState>,
    fail_dead_letter_writes: AtomicBool,
}

/// Shared in-memory database. Cloning yields another handle to the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a unit of work.
    #[must_use]
    pub fn session(&self) -> MemorySession {
        MemorySession {
            shared: Arc::clone(&self.shared),
            working: self.shared.state.lock().clone(),
            journal: Vec::new(),
            stage_mark: None,
            closed: false,
        }
    }

    /// Inserts a filing directly, outside any unit of work.
    pub fn insert_filing(&self, filing: Filing) {
        self.shared
            .state
            .lock()
            .filings
            .insert(filing.id.clone(), filing);
    }

    /// Returns the committed filing.
    #[must_use]
    pub fn filing(&self, id: &str) -> Option<Filing> {
        self.shared.state.lock().filings.get(id).cloned()
    }

    /// Returns a committed artifact.
    #[must_use]
    pub fn artifact(&self, filing_id: &str, kind: &str) -> Option<Value> {
        self.shared
            .state
            .lock()
            .artifacts
            .get(&(filing_id.to_string(), kind.to_string()))
            .cloned()
    }

    /// Returns committed dead letters in insertion order.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.shared.state.lock().dead_letters.clone()
    }

    /// Makes every dead-letter insert fail, to exercise persistence errors.
    pub fn set_fail_dead_letter_writes(&self, fail: bool) {
        self.shared
            .fail_dead_letter_writes
            .store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionFactory for MemoryStore {
    async fn open(&self) -> Result<Box<dyn Session>, StoreError> {
        Ok(Box::new(self.session()))
    }
}

/// One unit of work over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Shared>,
    working: MemoryState,
    journal: Vec<Op>,
    stage_mark: Option<(MemoryState, usize)>,
    closed: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn record(&mut self, op: Op) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.working.apply(&op);
        self.journal.push(op);
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemorySession {
    async fn begin_stage(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.stage_mark = Some((self.working.clone(), self.journal.len()));
        Ok(())
    }

    async fn commit_stage(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.stage_mark = None;
        Ok(())
    }

    async fn rollback_stage(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if let Some((snapshot, len)) = self.stage_mark.take() {
            self.working = snapshot;
            self.journal.truncate(len);
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.closed = true;
        self.stage_mark = None;
        let mut state = self.shared.state.lock();
        for op in self.journal.drain(..) {
            state.apply(&op);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.closed = true;
        self.stage_mark = None;
        self.journal.clear();
        Ok(())
    }
}

#[async_trait]
impl FilingRepository for MemorySession {
    async fn load_filing(&mut self, id: &str) -> Result<Option<Filing>, StoreError> {
        self.ensure_open()?;
        Ok(self.working.filings.get(id).cloned())
    }

    async fn upsert_filing(&mut self, filing: &Filing) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let inserted = !self.working.filings.contains_key(&filing.id);
        self.record(Op::UpsertFiling(filing.clone()))?;
        Ok(inserted)
    }

    async fn save_artifact(
        &mut self,
        filing_id: &str,
        kind: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        self.record(Op::SaveArtifact {
            filing_id: filing_id.to_string(),
            kind: kind.to_string(),
            value: value.clone(),
        })
    }

    async fn load_artifact(
        &mut self,
        filing_id: &str,
        kind: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .working
            .artifacts
            .get(&(filing_id.to_string(), kind.to_string()))
            .cloned())
    }

    async fn set_filing_status(
        &mut self,
        filing_id: &str,
        status: FilingStatus,
        analysis: AnalysisStatus,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        if !self.working.filings.contains_key(filing_id) {
            return Err(StoreError::NotFound(format!("filing {filing_id}")));
        }
        self.record(Op::SetStatus {
            filing_id: filing_id.to_string(),
            status,
            analysis,
        })
    }
}

#[async_trait]
impl DeadLetterRepository for MemorySession {
    async fn insert_dead_letter(&mut self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.shared.fail_dead_letter_writes.load(Ordering::SeqCst) {
            return Err(StoreError::corrupt("dead_letters", "writes disabled"));
        }
        self.record(Op::InsertDeadLetter(entry.clone()))
    }

    async fn fetch_dead_letters(
        &mut self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.ensure_open()?;
        let mut entries: Vec<DeadLetterEntry> = self
            .working
            .dead_letters
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        // Stable sort keeps later inserts first among equal timestamps.
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(filter.limit);
        Ok(entries)
    }

    async fn fetch_dead_letter(&mut self, id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .working
            .dead_letters
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn update_dead_letter(&mut self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        self.ensure_open()?;
        if !self.working.dead_letters.iter().any(|e| e.id == entry.id) {
            return Err(StoreError::NotFound(format!("dead letter {}", entry.id)));
        }
        self.record(Op::UpdateDeadLetter(entry.clone()))
    }

    async fn count_dead_letters(&mut self) -> Result<BTreeMap<DeadLetterStatus, u64>, StoreError> {
        self.ensure_open()?;
        let mut counts = BTreeMap::new();
        for entry in &self.working.dead_letters {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
