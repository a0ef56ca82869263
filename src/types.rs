use crate::models::{CreditTransaction, DataType, Document, DocumentStatus, OcrData, OcrLineItem};
use chrono::NaiveDate;
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A converted value. Serializes as a bare JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Decimal(Decimal),
    Date(NaiveDate),
    Boolean(bool),
    /// Raw text kept because it did not convert to the declared type.
    Raw(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FieldValue::Decimal(d) => Some(*d),
            FieldValue::Integer(i) => Some(Decimal::from(*i)),
            FieldValue::Float(f) => Decimal::try_from(*f).ok(),
            FieldValue::Text(s) | FieldValue::Raw(s) => s.trim().replace(',', "").parse().ok(),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Text(s) | FieldValue::Raw(s) => f.write_str(s),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::Decimal(d) => write!(f, "{}", d),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            FieldValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// Field- or cell-level problem collected during ingestion or read-back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub raw_value: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableColumn {
    pub name: String,
    pub data_type: DataType,
    pub sub_field_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableResult {
    pub field_id: i64,
    pub columns: Vec<TableColumn>,
    pub rows: Vec<IndexMap<String, FieldValue>>,
    pub row_count: usize,
}

/// Ingestion output in template declared order; what sinks consume.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedResult {
    pub document_id: i64,
    pub template_id: i64,
    pub fields: IndexMap<String, FieldValue>,
    pub tables: IndexMap<String, TableResult>,
    pub errors: Vec<FieldError>,
}

impl NormalizedResult {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        let key = crate::models::normalize_key(name);
        self.fields
            .iter()
            .find(|(k, _)| crate::models::normalize_key(k) == key)
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub document_id: i64,
    pub status: DocumentStatus,
    pub processed_at: Option<String>,
    pub result: NormalizedResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResults {
    pub document: Document,
    pub result: NormalizedResult,
    pub ocr_data: Vec<OcrData>,
    pub line_items: Vec<OcrLineItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatusReport {
    pub document_id: i64,
    pub status: DocumentStatus,
    pub template_id: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub processed_at: Option<String>,
    pub has_ocr_data: bool,
    pub ocr_data_count: i64,
    pub line_items_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrectionReceipt {
    pub document_id: i64,
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub predicted_value: Option<String>,
    pub actual_value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditCheck {
    pub user_id: i64,
    pub required: i64,
    pub current_balance: i64,
    pub sufficient: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditSummary {
    pub user_id: i64,
    pub current_balance: i64,
    /// Manual additions only; refunds are counted separately.
    pub total_added: i64,
    pub total_spent: i64,
    pub total_refunded: i64,
    pub transaction_count: usize,
    pub recent_transactions: Vec<CreditTransaction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentCreditUsage {
    pub document_id: i64,
    /// Charges minus refunds, as a positive number.
    pub net_cost: i64,
    pub has_refund: bool,
    pub transactions: Vec<CreditTransaction>,
}

/// Names and type tags a template definition may use.
#[derive(Debug, Clone, Serialize)]
pub struct FieldVocabulary {
    pub field_names: Vec<&'static str>,
    pub field_types: Vec<&'static str>,
    pub column_types: Vec<&'static str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplatePayload {
    pub name: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldPayload {
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub field_order: Option<i64>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub options: Vec<OptionPayload>,
    #[serde(default)]
    pub sub_fields: Vec<SubFieldPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubFieldPayload {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub column_order: Option<i64>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub options: Vec<OptionPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionPayload {
    pub value: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn field_values_serialize_as_bare_scalars() {
        let mut fields = IndexMap::new();
        fields.insert("invoice_number".to_string(), FieldValue::Text("INV-001".into()));
        fields.insert("total_amount".to_string(), FieldValue::Decimal(Decimal::from_str("1234.56").unwrap()));
        fields.insert("paid".to_string(), FieldValue::Boolean(false));
        fields.insert("due_date".to_string(), FieldValue::Null);
        let json = serde_json::to_value(&fields).unwrap();
        assert_eq!(json["invoice_number"], "INV-001");
        assert_eq!(json["total_amount"], "1234.56");
        assert_eq!(json["paid"], false);
        assert!(json["due_date"].is_null());
    }

    #[test]
    fn display_is_canonical() {
        let d = NaiveDate::from_ymd_opt(2025, 8, 27).unwrap();
        assert_eq!(FieldValue::Date(d).to_string(), "2025-08-27");
        assert_eq!(FieldValue::Null.to_string(), "");
        assert_eq!(FieldValue::Integer(42).as_decimal(), Some(Decimal::from(42)));
        assert_eq!(FieldValue::Raw("1,500".into()).as_decimal(), Some(Decimal::from(1500)));
    }
}
