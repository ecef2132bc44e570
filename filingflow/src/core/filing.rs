//! Filing records and extracted content chunks.

use serde::{Deserialize, Serialize};

use super::{AnalysisStatus, FilingStatus};

/// A source filing, referenced by its receipt number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filing {
    /// Receipt number; the stable identifier retries re-read by.
    pub id: String,
    /// Issuer code.
    #[serde(default)]
    pub corp_code: Option<String>,
    /// Listed ticker, if any.
    #[serde(default)]
    pub ticker: Option<String>,
    /// Report title.
    #[serde(default)]
    pub title: Option<String>,
    /// Location of the downloaded source documents.
    #[serde(default)]
    pub source_path: Option<String>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: FilingStatus,
    /// Analysis status.
    #[serde(default)]
    pub analysis_status: AnalysisStatus,
}

impl Filing {
    /// Creates a pending filing.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            corp_code: None,
            ticker: None,
            title: None,
            source_path: None,
            status: FilingStatus::Pending,
            analysis_status: AnalysisStatus::Pending,
        }
    }

    /// Sets the issuer code.
    #[must_use]
    pub fn with_corp_code(mut self, corp_code: impl Into<String>) -> Self {
        self.corp_code = Some(corp_code.into());
        self
    }

    /// Sets the ticker.
    #[must_use]
    pub fn with_ticker(mut self, ticker: impl Into<String>) -> Self {
        self.ticker = Some(ticker.into());
        self
    }

    /// Sets the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Sets the source path.
    #[must_use]
    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    /// Returns the correlation identifiers for this filing.
    #[must_use]
    pub fn correlation(&self) -> Correlation {
        Correlation {
            receipt_no: Some(self.id.clone()),
            corp_code: self.corp_code.clone(),
            ticker: self.ticker.clone(),
        }
    }
}

/// Operator search fields attached to dead letters and log lines.
///
/// Never used for uniqueness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    /// Filing receipt number.
    pub receipt_no: Option<String>,
    /// Issuer code.
    pub corp_code: Option<String>,
    /// Ticker.
    pub ticker: Option<String>,
}

impl Correlation {
    /// Correlation known only by receipt number.
    #[must_use]
    pub fn for_receipt(receipt_no: impl Into<String>) -> Self {
        Self {
            receipt_no: Some(receipt_no.into()),
            ..Self::default()
        }
    }
}

/// One unit of extracted content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Content type (`text`, `table`, `ocr`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Extracted content.
    pub content: String,
    /// Source file the content came from.
    pub source: String,
    /// Page number, when the source is paginated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

impl Chunk {
    /// Creates a text chunk.
    #[must_use]
    pub fn text(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            content: content.into(),
            source: source.into(),
            page: None,
        }
    }

    /// Sets the page number.
    #[must_use]
    pub fn on_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    /// Overrides the content type.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}
