//! Core domain model types for filingflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Filing and analysis status enums
//! - The task outcome label
//! - The stage outcome returned by every stage
//! - The filing record and its extracted chunks

mod filing;
mod outcome;
mod status;

pub use filing::{Chunk, Correlation, Filing};
pub use outcome::StageOutcome;
pub use status::{AnalysisStatus, FilingStatus, TaskOutcome};
