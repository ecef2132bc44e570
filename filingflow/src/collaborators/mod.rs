//! Boundaries to the external systems the pipeline drives.
//!
//! Extraction, OCR, analysis, notification, and market-data providers are
//! implemented elsewhere; the pipeline only sees these traits. Each call
//! returns a [`CollaboratorError`] on failure, which callers translate into
//! the task-level taxonomy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::core::{Chunk, Filing};
use crate::errors::{CollaboratorError, TableExtractionError};

/// Structured output of an analysis collaborator.
pub type AnalysisMap = Map<String, Value>;

/// Extracts text chunks from downloaded source documents.
#[async_trait]
pub trait SourceExtractor: Send + Sync {
    /// Extracts chunks from the documents under `path`.
    ///
    /// Returns [`CollaboratorError::NoSources`] when nothing exists there.
    async fn extract(&self, path: &str) -> Result<Vec<Chunk>, CollaboratorError>;
}

/// OCR fallback for scanned documents.
#[async_trait]
pub trait OcrExtractor: Send + Sync {
    /// Runs OCR over at most `max_pages` pages.
    async fn extract_ocr(&self, path: &str, max_pages: u32)
        -> Result<Vec<Chunk>, CollaboratorError>;
}

/// Result of a table extraction run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableExtraction {
    /// Tables stored.
    pub stored: u32,
    /// Stale tables deleted.
    pub deleted: u32,
    /// Elapsed time reported by the extractor.
    pub elapsed_ms: u64,
    /// Table content, appended to the filing's chunks.
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

/// Extracts tables from a filing.
#[async_trait]
pub trait TableExtractor: Send + Sync {
    /// Extracts tables from the documents under `path`.
    async fn extract_tables(
        &self,
        filing: &Filing,
        path: &str,
    ) -> Result<TableExtraction, TableExtractionError>;
}

/// Classification, fact extraction, and summarization over combined text.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Classifies the filing into a category.
    async fn classify(&self, text: &str) -> Result<AnalysisMap, CollaboratorError>;

    /// Extracts key facts.
    async fn extract_facts(&self, text: &str) -> Result<AnalysisMap, CollaboratorError>;

    /// Produces a summary.
    async fn summarize(&self, text: &str) -> Result<AnalysisMap, CollaboratorError>;
}

/// Delivers a summary to subscribers.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a notification about `filing`.
    async fn notify(&self, filing: &Filing, summary: &AnalysisMap) -> Result<(), CollaboratorError>;
}

/// Source of recently published filings.
#[async_trait]
pub trait FilingFeed: Send + Sync {
    /// Fetches filings published in the last `days_back` days.
    async fn fetch_recent(&self, days_back: u32) -> Result<Vec<Filing>, CollaboratorError>;
}

/// Market data synchronisation.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Syncs daily prices for the last `days_back` days. Returns rows written.
    async fn sync_prices(&self, days_back: u32) -> Result<usize, CollaboratorError>;

    /// Syncs listing metadata. Returns rows written.
    async fn sync_metadata(&self) -> Result<usize, CollaboratorError>;
}

/// Every collaborator the pipeline and tasks need.
#[derive(Clone)]
pub struct Collaborators {
    /// Source extraction.
    pub extractor: Arc<dyn SourceExtractor>,
    /// OCR fallback.
    pub ocr: Arc<dyn OcrExtractor>,
    /// Table extraction.
    pub tables: Arc<dyn TableExtractor>,
    /// Analysis.
    pub analyzer: Arc<dyn Analyzer>,
    /// Notification.
    pub notifier: Arc<dyn Notifier>,
    /// Filing feed.
    pub feed: Arc<dyn FilingFeed>,
    /// Market data.
    pub market: Arc<dyn MarketData>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
