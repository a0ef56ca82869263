//! Ingestion engine: extraction output reconciled against a template schema.
//!
//! Per-document flow for one attempt:
//!
//! 1. claim the document (`PROCESSING`, fresh attempt token; reprocess also purges)
//! 2. one extraction call for every field and column
//! 3. convert each field and cell; failures become [`FieldError`]s, not aborts
//! 4. commit all rows and `PROCESSED` in one transaction, guarded by the token
//!
//! An adapter failure in step 2 marks the document `FAILED` and writes no rows.

use crate::convert::{convert_cell, convert_field};
use crate::db::Db;
use crate::error::{IntakeError, Result};
use crate::models::{
    normalize_key, AttemptToken, Document, NewCellValue, NewLineItem, NewOcrData,
    PendingIngestion, TemplateField, TemplateSchema,
};
use crate::ocr::{ExtractionOutput, ExtractionRequest, Extractor, RawField, RawScalar, RAW_RESPONSE_KEY};
use crate::services::schema_registry::SchemaRegistry;
use crate::types::{
    DocumentResults, DocumentStatusReport, FieldError, FieldValue, NormalizedResult,
    ProcessOutcome, TableColumn, TableResult,
};
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionMode {
    /// Replaces prior rows at commit time; they survive a failed attempt.
    Process,
    /// Purges prior rows when the attempt starts.
    Reprocess,
}

/// State threaded through one extraction attempt.
struct IngestionContext {
    document: Document,
    schema: Arc<TemplateSchema>,
    attempt: AttemptToken,
    mode: IngestionMode,
}

/// Rows to persist plus the normalized view of the same data.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub pending: PendingIngestion,
    pub result: NormalizedResult,
}

pub struct IngestionEngine {
    db: Arc<Db>,
    registry: Arc<SchemaRegistry>,
    extractor: Arc<dyn Extractor>,
    processing_timeout: Duration,
}

impl IngestionEngine {
    pub fn new(
        db: Arc<Db>,
        registry: Arc<SchemaRegistry>,
        extractor: Arc<dyn Extractor>,
        processing_timeout: Duration,
    ) -> Self {
        Self {
            db,
            registry,
            extractor,
            processing_timeout,
        }
    }

    pub fn process(&self, document_id: i64, template_id: i64) -> Result<ProcessOutcome> {
        self.run(document_id, template_id, IngestionMode::Process)
    }

    /// Discards every prior result for the document, then extracts again,
    /// possibly under a different template.
    pub fn reprocess(&self, document_id: i64, template_id: i64) -> Result<ProcessOutcome> {
        self.run(document_id, template_id, IngestionMode::Reprocess)
    }

    fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.processing_timeout).unwrap_or_else(|_| chrono::Duration::weeks(52))
    }

    fn run(&self, document_id: i64, template_id: i64, mode: IngestionMode) -> Result<ProcessOutcome> {
        let document = self.db.get_document(document_id)?;
        let schema = self.registry.schema(template_id)?;
        if schema.fields.is_empty() {
            return Err(IntakeError::Validation(format!(
                "template {} has no fields to extract",
                template_id
            )));
        }

        let attempt = self
            .db
            .begin_processing(document_id, self.stale_after(), mode == IngestionMode::Reprocess)?;
        let ctx = IngestionContext {
            document,
            schema,
            attempt,
            mode,
        };
        info!(document_id, template_id, mode = ?ctx.mode, "extraction started");

        let request = ExtractionRequest::from_schema(&ctx.document.file_path, &ctx.schema);
        let output = match self.extractor.extract(&request) {
            Ok(output) => output,
            Err(err) => {
                warn!(document_id, kind = err.kind(), retryable = err.is_retryable(), error = %err, "extraction failed");
                self.db.mark_failed(document_id, &ctx.attempt, &err.to_string())?;
                return Err(err.into());
            }
        };

        let reconciled = reconcile(&ctx.schema, &output, document_id);
        let processed_at = match self.db.commit_ingestion(
            document_id,
            &ctx.attempt,
            ctx.schema.id(),
            &reconciled.pending,
        ) {
            Ok(ts) => ts,
            Err(IntakeError::State(msg)) => return Err(IntakeError::State(msg)),
            Err(err) => {
                if let Err(mark_err) = self.db.mark_failed(document_id, &ctx.attempt, &err.to_string()) {
                    warn!(document_id, error = %mark_err, "could not record failed commit");
                }
                return Err(err);
            }
        };

        info!(
            document_id,
            template_id,
            fields = reconciled.pending.scalars.len(),
            line_items = reconciled.pending.line_items.len(),
            errors = reconciled.result.errors.len(),
            "extraction committed"
        );
        let document = self.db.get_document(document_id)?;
        Ok(ProcessOutcome {
            document_id,
            status: document.status,
            processed_at: Some(processed_at),
            result: reconciled.result,
        })
    }

    /// Normalized view of the stored rows, corrections applied.
    pub fn results(&self, document_id: i64) -> Result<DocumentResults> {
        let document = self.db.get_document(document_id)?;
        let template_id = document.template_id.ok_or_else(|| {
            IntakeError::State(format!("document {} has no extraction results", document_id))
        })?;
        let schema = self.registry.schema(template_id)?;
        let ocr_data = self.db.load_ocr_data(document_id)?;
        let line_items = self.db.load_line_items(document_id)?;

        let mut result = NormalizedResult {
            document_id,
            template_id,
            fields: IndexMap::new(),
            tables: IndexMap::new(),
            errors: Vec::new(),
        };
        for field in schema.scalar_fields() {
            let Some(row) = ocr_data.iter().find(|r| r.field_id == field.id) else {
                continue;
            };
            let raw = row.effective_value();
            let value = match convert_field(field, raw) {
                Ok(v) => v,
                Err(e) => {
                    result.errors.push(FieldError {
                        field: field.name.to_string(),
                        row_index: None,
                        column: None,
                        raw_value: raw.map(String::from),
                        message: e.to_string(),
                    });
                    FieldValue::Raw(raw.unwrap_or_default().to_string())
                }
            };
            result.fields.insert(field.name.to_string(), value);
        }
        for field in schema.table_fields() {
            let mut rows = Vec::new();
            for item in line_items.iter().filter(|li| li.field_id == field.id) {
                let mut out = IndexMap::new();
                for column in &field.sub_fields {
                    let raw = item
                        .values
                        .iter()
                        .find(|v| v.sub_field_id == column.id)
                        .and_then(|v| v.effective_value());
                    let value = match convert_cell(field, column, raw) {
                        Ok(v) => v,
                        Err(e) => {
                            result.errors.push(FieldError {
                                field: field.name.to_string(),
                                row_index: Some(item.row_index),
                                column: Some(column.name.clone()),
                                raw_value: raw.map(String::from),
                                message: e.to_string(),
                            });
                            FieldValue::Raw(raw.unwrap_or_default().to_string())
                        }
                    };
                    out.insert(column.name.clone(), value);
                }
                rows.push(out);
            }
            result.tables.insert(field.name.to_string(), table_result(field, rows));
        }

        Ok(DocumentResults {
            document,
            result,
            ocr_data,
            line_items,
        })
    }

    pub fn status(&self, document_id: i64) -> Result<DocumentStatusReport> {
        let document = self.db.get_document(document_id)?;
        let (ocr_data_count, line_items_count) = self.db.count_results(document_id)?;
        Ok(DocumentStatusReport {
            document_id,
            status: document.status,
            template_id: document.template_id,
            error_message: document.error_message,
            created_at: document.created_at,
            updated_at: document.updated_at,
            processed_at: document.processed_at,
            has_ocr_data: ocr_data_count > 0 || line_items_count > 0,
            ocr_data_count,
            line_items_count,
        })
    }

    /// Fails documents whose extraction attempt outlived the processing timeout.
    pub fn sweep_stale(&self) -> Result<Vec<i64>> {
        let ids = self.db.fail_stale_processing(self.stale_after())?;
        if !ids.is_empty() {
            warn!(count = ids.len(), ?ids, "stale extraction attempts marked failed");
        }
        Ok(ids)
    }
}

fn table_result(field: &TemplateField, rows: Vec<IndexMap<String, FieldValue>>) -> TableResult {
    TableResult {
        field_id: field.id,
        columns: field
            .sub_fields
            .iter()
            .map(|s| TableColumn {
                name: s.name.clone(),
                data_type: s.data_type,
                sub_field_id: s.id,
            })
            .collect(),
        row_count: rows.len(),
        rows,
    }
}

fn lookup_cell<'a>(row: &'a IndexMap<String, RawScalar>, column: &str) -> Option<&'a RawScalar> {
    if let Some(cell) = row.get(column) {
        return Some(cell);
    }
    let key = normalize_key(column);
    row.iter().find(|(k, _)| normalize_key(k) == key).map(|(_, v)| v)
}

/// Maps extraction output onto the schema. Pure; rows are produced in
/// declared field order and, for tables, in returned row order.
pub fn reconcile(schema: &TemplateSchema, output: &ExtractionOutput, document_id: i64) -> Reconciled {
    let mut pending = PendingIngestion::default();
    let mut result = NormalizedResult {
        document_id,
        template_id: schema.id(),
        fields: IndexMap::new(),
        tables: IndexMap::new(),
        errors: Vec::new(),
    };

    if let Some(raw) = output.raw_response.as_deref() {
        result.errors.push(FieldError {
            field: RAW_RESPONSE_KEY.to_string(),
            row_index: None,
            column: None,
            raw_value: Some(crate::error::truncate(raw, 500).to_string()),
            message: "extraction response could not be parsed into fields".to_string(),
        });
    }

    for field in &schema.fields {
        let name = field.name.to_string();
        if field.is_table() {
            let rows: &[IndexMap<String, RawScalar>] = match output.get(&name) {
                Some(RawField::Table(rows)) => rows,
                Some(RawField::Scalar(s)) if s.value.is_some() => {
                    result.errors.push(FieldError {
                        field: name.clone(),
                        row_index: None,
                        column: None,
                        raw_value: s.value.clone(),
                        message: "expected table rows, got a single value".to_string(),
                    });
                    &[]
                }
                _ => &[],
            };
            let mut out_rows = Vec::with_capacity(rows.len());
            for (idx, row) in rows.iter().enumerate() {
                let row_index = idx as i64;
                let mut values = Vec::with_capacity(field.sub_fields.len());
                let mut out = IndexMap::new();
                for column in &field.sub_fields {
                    let cell = lookup_cell(row, &column.name);
                    let raw = cell.and_then(|c| c.value.as_deref());
                    let confidence = cell.and_then(|c| c.confidence);
                    let (value, conversion_error) = match convert_cell(field, column, raw) {
                        Ok(v) => (v, None),
                        Err(e) => {
                            warn!(document_id, field = %name, row_index, column = %column.name, error = %e, "cell did not convert");
                            result.errors.push(FieldError {
                                field: name.clone(),
                                row_index: Some(row_index),
                                column: Some(column.name.clone()),
                                raw_value: raw.map(String::from),
                                message: e.to_string(),
                            });
                            (FieldValue::Raw(raw.unwrap_or_default().to_string()), Some(e.reason))
                        }
                    };
                    values.push(NewCellValue {
                        sub_field_id: column.id,
                        predicted_value: raw.map(String::from),
                        confidence,
                        conversion_error,
                    });
                    out.insert(column.name.clone(), value);
                }
                for (key, cell) in row {
                    if field.column(key).is_none() {
                        result.errors.push(FieldError {
                            field: name.clone(),
                            row_index: Some(row_index),
                            column: Some(key.clone()),
                            raw_value: cell.value.clone(),
                            message: format!("column '{}' is not defined for '{}'", key, name),
                        });
                    }
                }
                pending.line_items.push(NewLineItem {
                    field_id: field.id,
                    row_index,
                    values,
                });
                out_rows.push(out);
            }
            result.tables.insert(name, table_result(field, out_rows));
        } else {
            let (raw, confidence, shape_error) = match output.get(&name) {
                Some(RawField::Scalar(s)) => (s.value.clone(), s.confidence, None),
                Some(RawField::Table(rows)) => (
                    serde_json::to_string(rows).ok(),
                    None,
                    Some("expected a single value, got table rows".to_string()),
                ),
                None => (None, None, None),
            };
            let converted = match shape_error {
                Some(msg) => Err(msg),
                None => convert_field(field, raw.as_deref()).map_err(|e| {
                    warn!(document_id, field = %name, error = %e, "field did not convert");
                    e.to_string()
                }),
            };
            let (value, conversion_error) = match converted {
                Ok(v) => (v, None),
                Err(message) => {
                    result.errors.push(FieldError {
                        field: name.clone(),
                        row_index: None,
                        column: None,
                        raw_value: raw.clone(),
                        message: message.clone(),
                    });
                    (FieldValue::Raw(raw.clone().unwrap_or_default()), Some(message))
                }
            };
            pending.scalars.push(NewOcrData {
                field_id: field.id,
                predicted_value: raw,
                confidence,
                conversion_error,
            });
            result.fields.insert(name, value);
        }
    }

    Reconciled { pending, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataType, FieldName, FieldType, SubTemplateField, Template};
    use crate::ocr::parse_response;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn schema() -> TemplateSchema {
        let field = |id: i64, name: &str, field_type: FieldType| TemplateField {
            id,
            template_id: 1,
            name: FieldName::parse(name).unwrap(),
            field_order: id,
            field_type,
            instructions: None,
            sub_fields: vec![],
            options: vec![],
        };
        let mut items = field(3, "line_items", FieldType::Table);
        items.sub_fields = vec![
            SubTemplateField {
                id: 31,
                field_id: 3,
                name: "item_description".into(),
                data_type: DataType::String,
                instructions: None,
                column_order: 1,
                options: vec![],
            },
            SubTemplateField {
                id: 32,
                field_id: 3,
                name: "quantity".into(),
                data_type: DataType::Integer,
                instructions: None,
                column_order: 2,
                options: vec![],
            },
        ];
        TemplateSchema {
            template: Template {
                id: 1,
                user_id: 1,
                name: "t".into(),
                instructions: None,
                created_at: String::new(),
                updated_at: String::new(),
            },
            fields: vec![
                field(1, "InvoiceNumber", FieldType::Text),
                field(2, "TotalAmount", FieldType::Number),
                items,
            ],
        }
    }

    #[test]
    fn bad_field_is_recorded_not_fatal() {
        let output = parse_response(r#"{"invoice_number": "INV-001", "TotalAmount": "N/A"}"#);
        let rec = reconcile(&schema(), &output, 7);
        assert_eq!(rec.pending.scalars.len(), 2);
        assert_eq!(rec.pending.scalars[0].predicted_value.as_deref(), Some("INV-001"));
        assert!(rec.pending.scalars[0].conversion_error.is_none());
        assert_eq!(rec.pending.scalars[1].predicted_value.as_deref(), Some("N/A"));
        assert!(rec.pending.scalars[1].conversion_error.is_some());
        assert_eq!(rec.result.fields["total_amount"], FieldValue::Raw("N/A".into()));
        assert_eq!(rec.result.errors.len(), 1);
        assert_eq!(rec.result.errors[0].field, "total_amount");
    }

    #[test]
    fn missing_fields_still_get_rows() {
        let output = parse_response("{}");
        let rec = reconcile(&schema(), &output, 7);
        assert_eq!(rec.pending.scalars.len(), 2);
        assert!(rec.pending.scalars.iter().all(|s| s.predicted_value.is_none()));
        assert!(rec.pending.line_items.is_empty());
        assert_eq!(rec.result.tables["line_items"].row_count, 0);
        assert!(rec.result.errors.is_empty());
    }

    #[test]
    fn rows_are_positional_and_complete() {
        let output = parse_response(
            r#"{"line_items": [
                {"item_description": "Bolt", "quantity": "4"},
                {},
                {"Item Description": "Nut", "quantity": "x", "colour": "red"}
            ]}"#,
        );
        let rec = reconcile(&schema(), &output, 7);
        let indexes: Vec<_> = rec.pending.line_items.iter().map(|li| li.row_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(rec.pending.line_items.iter().all(|li| li.values.len() == 2));
        assert!(rec.pending.line_items[1].values.iter().all(|v| v.predicted_value.is_none()));

        let table = &rec.result.tables["line_items"];
        assert_eq!(table.row_count, 3);
        assert_eq!(table.rows[0]["quantity"], FieldValue::Integer(4));
        assert_eq!(table.rows[2]["item_description"], FieldValue::Text("Nut".into()));
        assert_eq!(table.rows[2]["quantity"], FieldValue::Raw("x".into()));

        let columns: Vec<_> = rec.result.errors.iter().map(|e| e.column.clone().unwrap_or_default()).collect();
        assert_eq!(columns, vec!["quantity".to_string(), "colour".to_string()]);
        assert!(rec.result.errors.iter().all(|e| e.row_index == Some(2)));
    }

    #[test]
    fn shape_mismatches_are_errors() {
        let output = parse_response(r#"{"line_items": "see attached", "invoice_number": [{"a": 1}]}"#);
        let rec = reconcile(&schema(), &output, 7);
        assert!(rec.pending.line_items.is_empty());
        assert_eq!(rec.result.errors.len(), 2);
        assert!(rec.pending.scalars[0].conversion_error.is_some());
    }

    #[test]
    fn unparseable_response_is_flagged() {
        let output = parse_response("sorry, no idea");
        let rec = reconcile(&schema(), &output, 7);
        assert_eq!(rec.result.errors[0].field, RAW_RESPONSE_KEY);
        assert_eq!(rec.pending.scalars.len(), 2);
    }

    #[test]
    fn reconcile_is_deterministic() {
        let text = r#"{"invoice_number": "A", "TotalAmount": "1,234.5", "line_items": [{"quantity": 1}, {"quantity": 2}]}"#;
        let a = reconcile(&schema(), &parse_response(text), 1);
        let b = reconcile(&schema(), &parse_response(text), 1);
        assert_eq!(
            serde_json::to_value(&a.result).unwrap(),
            serde_json::to_value(&b.result).unwrap()
        );
        assert_eq!(a.result.fields["total_amount"], FieldValue::Float(1234.5));
        assert_eq!(FieldValue::Float(1234.5).as_decimal(), Some(Decimal::from_str("1234.5").unwrap()));
    }
}
