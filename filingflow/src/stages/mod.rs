//! Stage trait and implementations.
//!
//! Stages are the units of work the executor runs, in order, against one
//! filing. A stage reports what happened as a [`StageOutcome`]; it never
//! panics or returns an error to signal a skip.

mod context;
mod filing;
mod result;

pub use context::{FilingWorkspace, StageContext};
pub use filing::{
    ClassifyCategoryStage, ExtractFactsStage, ExtractTablesStage, IngestChunksStage,
    SummarizeAndNotifyStage, CLASSIFY_CATEGORY, EXTRACT_FACTS, EXTRACT_TABLES, INGEST_CHUNKS,
    SUMMARIZE_AND_NOTIFY, TABLE_EXTRACTION_TASK,
};
pub use result::StageResult;

use async_trait::async_trait;
use std::fmt::Debug;

use crate::core::StageOutcome;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Executes the stage.
    ///
    /// Writes made through `ctx.session()` are kept on
    /// [`StageOutcome::Success`] and rolled back otherwise.
    async fn execute(&self, ctx: &mut StageContext<'_>) -> StageOutcome;
}

/// A stage backed by a synchronous closure.
pub struct FnStage<F>
where
    F: Fn(&mut StageContext<'_>) -> StageOutcome + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&mut StageContext<'_>) -> StageOutcome + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&mut StageContext<'_>) -> StageOutcome + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&mut StageContext<'_>) -> StageOutcome + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> StageOutcome {
        (self.func)(ctx)
    }
}
