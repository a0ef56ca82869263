use crate::db::Db;
use crate::error::Result;
use crate::types::CorrectionReceipt;
use std::sync::Arc;
use tracing::info;

/// Point edits to ingested values. The extracted value is kept; the
/// correction is stored alongside it and wins on every read.
pub struct CorrectionService {
    db: Arc<Db>,
}

impl CorrectionService {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn update_field_value(&self, document_id: i64, field_name: &str, new_value: &str) -> Result<CorrectionReceipt> {
        let receipt = self.db.correct_field_value(document_id, field_name, new_value)?;
        info!(document_id, field = %receipt.field, "field corrected");
        Ok(receipt)
    }

    pub fn update_table_cell_value(
        &self,
        document_id: i64,
        field_name: &str,
        row_index: i64,
        column_name: &str,
        new_value: &str,
    ) -> Result<CorrectionReceipt> {
        let receipt = self
            .db
            .correct_table_cell(document_id, field_name, row_index, column_name, new_value)?;
        info!(document_id, field = %receipt.field, row_index, column = column_name, "cell corrected");
        Ok(receipt)
    }
}
