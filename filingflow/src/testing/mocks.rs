//! Collaborator fakes.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::collaborators::{
    AnalysisMap, Analyzer, FilingFeed, MarketData, Notifier, OcrExtractor, SourceExtractor,
    TableExtraction, TableExtractor,
};
use crate::core::{Chunk, Filing};
use crate::errors::{CollaboratorError, TableExtractionError};

#[derive(Debug, Clone)]
enum Failure {
    NoSources,
    Transient(String),
    Fatal(String),
}

impl Failure {
    fn to_error(&self) -> CollaboratorError {
        match self {
            Self::NoSources => CollaboratorError::NoSources("no files under source path".into()),
            Self::Transient(msg) => CollaboratorError::connection(msg.clone()),
            Self::Fatal(msg) => CollaboratorError::unrecoverable(msg.clone()),
        }
    }
}

/// Source extractor returning fixed chunks or a fixed failure.
#[derive(Debug)]
pub struct StaticExtractor {
    chunks: Vec<Chunk>,
    failure: Option<Failure>,
    calls: AtomicUsize,
}

impl StaticExtractor {
    /// Returns `chunks` on every call.
    #[must_use]
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Reports that no source documents exist.
    #[must_use]
    pub fn no_sources() -> Self {
        Self {
            failure: Some(Failure::NoSources),
            ..Self::new(Vec::new())
        }
    }

    /// Fails every call with a transient error.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(Failure::Transient(message.into())),
            ..Self::new(Vec::new())
        }
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceExtractor for StaticExtractor {
    async fn extract(&self, _path: &str) -> Result<Vec<Chunk>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(failure) => Err(failure.to_error()),
            None => Ok(self.chunks.clone()),
        }
    }
}

/// OCR fallback returning fixed chunks.
#[derive(Debug)]
pub struct StaticOcr {
    chunks: Vec<Chunk>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticOcr {
    /// Returns `chunks` on every call.
    #[must_use]
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails every call.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrExtractor for StaticOcr {
    async fn extract_ocr(&self, _path: &str, max_pages: u32) -> Result<Vec<Chunk>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CollaboratorError::connection("ocr engine unavailable"));
        }
        Ok(self
            .chunks
            .iter()
            .filter(|c| c.page.map_or(true, |p| p <= max_pages))
            .cloned()
            .collect())
    }
}

/// Table extractor returning a fixed extraction.
#[derive(Debug, Default)]
pub struct StaticTables {
    extraction: TableExtraction,
}

impl StaticTables {
    /// Returns `extraction` on every call.
    #[must_use]
    pub fn new(extraction: TableExtraction) -> Self {
        Self { extraction }
    }
}

#[async_trait]
impl TableExtractor for StaticTables {
    async fn extract_tables(
        &self,
        _filing: &Filing,
        _path: &str,
    ) -> Result<TableExtraction, TableExtractionError> {
        Ok(self.extraction.clone())
    }
}

/// Table extractor that always fails.
#[derive(Debug)]
pub struct FailingTables {
    message: String,
}

impl FailingTables {
    /// Fails with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl TableExtractor for FailingTables {
    async fn extract_tables(
        &self,
        _filing: &Filing,
        _path: &str,
    ) -> Result<TableExtraction, TableExtractionError> {
        Err(TableExtractionError::new(self.message.clone()))
    }
}

/// Analyzer returning canned maps. Empty input is an error, like the real
/// models.
#[derive(Debug, Default)]
pub struct StaticAnalyzer {
    failure: Option<String>,
    calls: AtomicUsize,
}

impl StaticAnalyzer {
    /// Fails every call with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Total calls across all three operations.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self, text: &str, key: &str, value: serde_json::Value) -> Result<AnalysisMap, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(CollaboratorError::Other(anyhow::anyhow!("{message}")));
        }
        if text.trim().is_empty() {
            return Err(CollaboratorError::EmptyInput("text is empty".into()));
        }
        let mut map = AnalysisMap::new();
        map.insert(key.to_string(), value);
        Ok(map)
    }
}

#[async_trait]
impl Analyzer for StaticAnalyzer {
    async fn classify(&self, text: &str) -> Result<AnalysisMap, CollaboratorError> {
        self.answer(text, "category", json!("earnings"))
    }

    async fn extract_facts(&self, text: &str) -> Result<AnalysisMap, CollaboratorError> {
        self.answer(text, "facts", json!([{"name": "operating_profit", "change": "up"}]))
    }

    async fn summarize(&self, text: &str) -> Result<AnalysisMap, CollaboratorError> {
        let words = text.split_whitespace().count();
        self.answer(text, "summary", json!(format!("{words} words reviewed")))
    }
}

/// Notifier recording which filings it was asked about.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    /// Filing ids notified so far.
    #[must_use]
    pub fn notified(&self) -> Vec<String> {
        self.notified.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, filing: &Filing, _summary: &AnalysisMap) -> Result<(), CollaboratorError> {
        self.notified.lock().push(filing.id.clone());
        Ok(())
    }
}

/// Feed returning fixed filings.
#[derive(Debug, Default)]
pub struct StaticFeed {
    filings: Vec<Filing>,
}

impl StaticFeed {
    /// Returns `filings` on every call.
    #[must_use]
    pub fn new(filings: Vec<Filing>) -> Self {
        Self { filings }
    }
}

#[async_trait]
impl FilingFeed for StaticFeed {
    async fn fetch_recent(&self, _days_back: u32) -> Result<Vec<Filing>, CollaboratorError> {
        Ok(self.filings.clone())
    }
}

/// Feed that fails transiently a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct FlakyFeed {
    remaining_failures: AtomicUsize,
    filings: Vec<Filing>,
}

impl FlakyFeed {
    /// Fails the first `failures` calls.
    #[must_use]
    pub fn new(failures: usize, filings: Vec<Filing>) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
            filings,
        }
    }
}

#[async_trait]
impl FilingFeed for FlakyFeed {
    async fn fetch_recent(&self, _days_back: u32) -> Result<Vec<Filing>, CollaboratorError> {
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(CollaboratorError::connection("feed timed out"))
        } else {
            Ok(self.filings.clone())
        }
    }
}

/// Market data returning fixed row counts or a fixed failure.
#[derive(Debug)]
pub struct StaticMarket {
    prices: usize,
    metadata: usize,
    failure: Option<Failure>,
}

impl StaticMarket {
    /// Reports `prices` and `metadata` rows written.
    #[must_use]
    pub fn new(prices: usize, metadata: usize) -> Self {
        Self {
            prices,
            metadata,
            failure: None,
        }
    }

    /// Fails every call with a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            failure: Some(Failure::Transient(message.into())),
            ..Self::new(0, 0)
        }
    }

    /// Fails every call with an unrecoverable error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            failure: Some(Failure::Fatal(message.into())),
            ..Self::new(0, 0)
        }
    }

    fn answer(&self, rows: usize) -> Result<usize, CollaboratorError> {
        match &self.failure {
            Some(failure) => Err(failure.to_error()),
            None => Ok(rows),
        }
    }
}

#[async_trait]
impl MarketData for StaticMarket {
    async fn sync_prices(&self, _days_back: u32) -> Result<usize, CollaboratorError> {
        self.answer(self.prices)
    }

    async fn sync_metadata(&self) -> Result<usize, CollaboratorError> {
        self.answer(self.metadata)
    }
}

/// Market data that panics on every call.
#[derive(Debug)]
pub struct PanickingMarket {
    message: String,
}

impl PanickingMarket {
    /// Panics with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl MarketData for PanickingMarket {
    async fn sync_prices(&self, _days_back: u32) -> Result<usize, CollaboratorError> {
        panic!("{}", self.message);
    }

    async fn sync_metadata(&self) -> Result<usize, CollaboratorError> {
        panic!("{}", self.message);
    }
}
