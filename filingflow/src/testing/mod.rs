//! Testing utilities for filingflow.
//!
//! This module provides:
//! - Collaborator fakes (static, failing, flaky, panicking)
//! - Sample filings and chunks
//! - A task harness over the in-memory store

mod fixtures;
mod mocks;

pub use fixtures::{collaborators, sample_chunk, sample_filing, sample_filings, Harness};
pub use mocks::{
    FailingTables, FlakyFeed, PanickingMarket, RecordingNotifier, StaticAnalyzer,
    StaticExtractor, StaticFeed, StaticMarket, StaticOcr, StaticTables,
};
