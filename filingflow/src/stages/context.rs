//! Execution context handed to each stage.

use crate::config::PipelineConfig;
use crate::core::{Chunk, Filing};
use crate::dlq::NewDeadLetter;
use crate::store::Session;

/// Per-run scratch space shared by the stages of one document.
#[derive(Debug, Clone, Default)]
pub struct FilingWorkspace {
    /// Chunks extracted so far.
    pub chunks: Vec<Chunk>,
}

impl FilingWorkspace {
    /// Creates an empty workspace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All chunk content joined by blank lines.
    #[must_use]
    pub fn combined_text(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.content.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Total characters of chunk content.
    #[must_use]
    pub fn text_len(&self) -> usize {
        self.chunks.iter().map(|c| c.content.chars().count()).sum()
    }
}

/// What a stage can see and touch.
///
/// The session belongs to the task entry point. Stages write through it and
/// never commit; the executor decides whether a stage's writes survive.
pub struct StageContext<'a> {
    filing: &'a Filing,
    workspace: &'a mut FilingWorkspace,
    session: &'a mut dyn Session,
    config: &'a PipelineConfig,
    deferred: Vec<NewDeadLetter>,
}

impl<'a> StageContext<'a> {
    /// Creates a context.
    pub fn new(
        filing: &'a Filing,
        workspace: &'a mut FilingWorkspace,
        session: &'a mut dyn Session,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            filing,
            workspace,
            session,
            config,
            deferred: Vec::new(),
        }
    }

    /// The filing being processed.
    #[must_use]
    pub fn filing(&self) -> &Filing {
        self.filing
    }

    /// The shared workspace.
    #[must_use]
    pub fn workspace(&self) -> &FilingWorkspace {
        self.workspace
    }

    /// The shared workspace, mutably.
    pub fn workspace_mut(&mut self) -> &mut FilingWorkspace {
        self.workspace
    }

    /// The caller's unit of work.
    pub fn session(&mut self) -> &mut dyn Session {
        &mut *self.session
    }

    /// Process configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        self.config
    }

    /// Queues a dead letter to be written after this stage's rollback.
    pub fn defer_dead_letter(&mut self, dead_letter: NewDeadLetter) {
        self.deferred.push(dead_letter);
    }

    /// Takes the queued dead letters.
    pub fn take_dead_letters(&mut self) -> Vec<NewDeadLetter> {
        std::mem::take(&mut self.deferred)
    }
}

impl std::fmt::Debug for StageContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("filing", &self.filing.id)
            .field("chunks", &self.workspace.chunks.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}
