use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Processed => "PROCESSED",
            DocumentStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DocumentStatus::Pending),
            "PROCESSING" => Ok(DocumentStatus::Processing),
            "PROCESSED" => Ok(DocumentStatus::Processed),
            "FAILED" => Ok(DocumentStatus::Failed),
            other => Err(format!("unknown document status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub user_id: i64,
    pub file_path: String,
    pub original_filename: String,
    pub status: DocumentStatus,
    /// Template used by the last completed extraction run.
    pub template_id: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub processed_at: Option<String>,
}

/// Extracted scalar value for one (document, field) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrData {
    pub id: i64,
    pub document_id: i64,
    pub field_id: i64,
    pub field_name: String,
    pub predicted_value: Option<String>,
    pub actual_value: Option<String>,
    pub confidence: Option<f64>,
    pub conversion_error: Option<String>,
}

impl OcrData {
    /// Human correction wins over the extracted value.
    pub fn effective_value(&self) -> Option<&str> {
        self.actual_value.as_deref().or(self.predicted_value.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrLineItem {
    pub id: i64,
    pub document_id: i64,
    pub field_id: i64,
    pub field_name: String,
    pub row_index: i64,
    pub values: Vec<OcrLineItemValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrLineItemValue {
    pub id: i64,
    pub line_item_id: i64,
    pub sub_field_id: i64,
    pub column_name: String,
    pub predicted_value: Option<String>,
    pub actual_value: Option<String>,
    pub confidence: Option<f64>,
    pub conversion_error: Option<String>,
}

impl OcrLineItemValue {
    pub fn effective_value(&self) -> Option<&str> {
        self.actual_value.as_deref().or(self.predicted_value.as_deref())
    }
}

/// Token identifying the extraction attempt that owns a PROCESSING document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptToken(pub String);

impl AttemptToken {
    pub fn generate() -> Self {
        AttemptToken(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Rows produced by one extraction attempt, written in a single commit.
#[derive(Debug, Clone, Default)]
pub struct PendingIngestion {
    pub scalars: Vec<NewOcrData>,
    pub line_items: Vec<NewLineItem>,
}

#[derive(Debug, Clone)]
pub struct NewOcrData {
    pub field_id: i64,
    pub predicted_value: Option<String>,
    pub confidence: Option<f64>,
    pub conversion_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewLineItem {
    pub field_id: i64,
    pub row_index: i64,
    pub values: Vec<NewCellValue>,
}

#[derive(Debug, Clone)]
pub struct NewCellValue {
    pub sub_field_id: i64,
    pub predicted_value: Option<String>,
    pub confidence: Option<f64>,
    pub conversion_error: Option<String>,
}
