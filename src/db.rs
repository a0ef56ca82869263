use crate::error::{IntakeError, Result};
use crate::models::{
    normalize_key, AttemptToken, CreditReference, CreditTransaction, DataType, Document, DocumentStatus, FieldDraft, FieldName,
    FieldOption, FieldType, OcrData, OcrLineItem, OcrLineItemValue, PendingIngestion,
    SubFieldDraft, SubTemplateField, Template, TemplateDraft, TemplateField, TemplateSchema,
};
use crate::types::CorrectionReceipt;
use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Ordered schema migrations. Each runs once, inside its own transaction.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS templates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            instructions TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS template_fields (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            template_id INTEGER NOT NULL,
            field_name TEXT NOT NULL,
            field_order INTEGER NOT NULL,
            field_type TEXT NOT NULL,
            instructions TEXT,
            FOREIGN KEY (template_id) REFERENCES templates(id) ON DELETE CASCADE,
            UNIQUE(template_id, field_order),
            UNIQUE(template_id, field_name)
        );
        CREATE TABLE IF NOT EXISTS sub_template_fields (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            field_id INTEGER NOT NULL,
            field_name TEXT NOT NULL,
            data_type TEXT NOT NULL,
            instructions TEXT,
            column_order INTEGER NOT NULL,
            FOREIGN KEY (field_id) REFERENCES template_fields(id) ON DELETE CASCADE,
            UNIQUE(field_id, field_name)
        );
        CREATE TABLE IF NOT EXISTS field_options (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            field_id INTEGER NOT NULL,
            value TEXT NOT NULL,
            label TEXT NOT NULL,
            option_order INTEGER NOT NULL,
            FOREIGN KEY (field_id) REFERENCES template_fields(id) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS sub_field_options (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sub_field_id INTEGER NOT NULL,
            value TEXT NOT NULL,
            label TEXT NOT NULL,
            option_order INTEGER NOT NULL,
            FOREIGN KEY (sub_field_id) REFERENCES sub_template_fields(id) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            file_path TEXT NOT NULL,
            original_filename TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            template_id INTEGER,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            processed_at TEXT,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
            FOREIGN KEY (template_id) REFERENCES templates(id) ON DELETE SET NULL
        );
        CREATE INDEX IF NOT EXISTS idx_templates_user ON templates(user_id);
        CREATE INDEX IF NOT EXISTS idx_documents_user ON documents(user_id);
        ",
    ),
    (
        2,
        "
        CREATE TABLE IF NOT EXISTS ocr_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            field_id INTEGER NOT NULL,
            predicted_value TEXT,
            actual_value TEXT,
            confidence REAL,
            conversion_error TEXT,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE,
            FOREIGN KEY (field_id) REFERENCES template_fields(id) ON DELETE CASCADE,
            UNIQUE(document_id, field_id)
        );
        CREATE TABLE IF NOT EXISTS ocr_line_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            field_id INTEGER NOT NULL,
            row_index INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE,
            FOREIGN KEY (field_id) REFERENCES template_fields(id) ON DELETE CASCADE,
            UNIQUE(document_id, field_id, row_index)
        );
        CREATE TABLE IF NOT EXISTS ocr_line_item_values (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            line_item_id INTEGER NOT NULL,
            sub_field_id INTEGER NOT NULL,
            predicted_value TEXT,
            actual_value TEXT,
            confidence REAL,
            conversion_error TEXT,
            FOREIGN KEY (line_item_id) REFERENCES ocr_line_items(id) ON DELETE CASCADE,
            FOREIGN KEY (sub_field_id) REFERENCES sub_template_fields(id) ON DELETE CASCADE,
            UNIQUE(line_item_id, sub_field_id)
        );
        CREATE INDEX IF NOT EXISTS idx_ocr_data_document ON ocr_data(document_id);
        CREATE INDEX IF NOT EXISTS idx_line_items_document ON ocr_line_items(document_id);
        ",
    ),
    (
        3,
        "
        ALTER TABLE documents ADD COLUMN attempt_token TEXT;
        ALTER TABLE documents ADD COLUMN processing_started_at TEXT;
        ",
    ),
    (
        4,
        "
        ALTER TABLE users ADD COLUMN credits_remaining INTEGER NOT NULL DEFAULT 0;
        CREATE TABLE IF NOT EXISTS credit_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            amount INTEGER NOT NULL,
            balance_before INTEGER NOT NULL,
            balance_after INTEGER NOT NULL,
            description TEXT NOT NULL,
            reference_type TEXT NOT NULL,
            reference_id INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_credit_transactions_user ON credit_transactions(user_id);
        CREATE INDEX IF NOT EXISTS idx_credit_transactions_reference ON credit_transactions(reference_type, reference_id);
        ",
    ),
];

const CREDIT_COLUMNS: &str = "id, user_id, amount, balance_before, balance_after, description, \
     reference_type, reference_id, created_at";

const DOCUMENT_COLUMNS: &str = "id, user_id, file_path, original_filename, status, template_id, \
     error_message, created_at, updated_at, processed_at";

pub struct Db {
    conn: Mutex<Connection>,
}

/// Fixed-width UTC timestamp so stored values compare lexicographically.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_before(age: Duration) -> String {
    (Utc::now() - age).to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_column<T: FromStr<Err = String>>(idx: usize, raw: String) -> rusqlite::Result<T> {
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_path: row.get(2)?,
        original_filename: row.get(3)?,
        status: parse_column(4, row.get(4)?)?,
        template_id: row.get(5)?,
        error_message: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        processed_at: row.get(9)?,
    })
}

fn credit_from_row(row: &Row<'_>) -> rusqlite::Result<CreditTransaction> {
    Ok(CreditTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        balance_before: row.get(3)?,
        balance_after: row.get(4)?,
        description: row.get(5)?,
        reference_type: parse_column(6, row.get(6)?)?,
        reference_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<Template> {
    Ok(Template {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        instructions: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

impl Db {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        info!(path = %db_path.display(), "opened intake database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrate(&mut conn)?;
        Ok(Db {
            conn: Mutex::new(conn),
        })
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock()?;
        Ok(conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?)
    }

    // ---- users ----

    pub fn create_user(&self, username: &str, email: &str) -> Result<i64> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO users (username, email, created_at) VALUES (?1, ?2, ?3)",
            params![username, email, now_timestamp()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_user(&self, user_id: i64) -> Result<()> {
        let conn = self.conn.lock()?;
        let n = conn.execute("DELETE FROM users WHERE id = ?", params![user_id])?;
        if n == 0 {
            return Err(IntakeError::not_found("user", user_id));
        }
        Ok(())
    }

    pub fn user_exists(&self, user_id: i64) -> Result<bool> {
        let conn = self.conn.lock()?;
        let found: Option<i64> = conn
            .query_row("SELECT id FROM users WHERE id = ?", params![user_id], |r| r.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    // ---- credits ----

    pub fn credit_balance(&self, user_id: i64) -> Result<i64> {
        let conn = self.conn.lock()?;
        balance_with(&conn, user_id)
    }

    pub fn add_credits(&self, user_id: i64, amount: i64, description: &str) -> Result<CreditTransaction> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let entry = apply_credit_with(&tx, user_id, amount, description, CreditReference::ManualAddition, None)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Charges the document's owner `cost` credits for one extraction run.
    pub fn charge_document(&self, document_id: i64, cost: i64) -> Result<CreditTransaction> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let doc = get_document_with(&tx, document_id)?;
        let entry = apply_credit_with(
            &tx,
            doc.user_id,
            -cost,
            &format!("OCR processing for document: {}", doc.original_filename),
            CreditReference::Document,
            Some(document_id),
        )?;
        tx.commit()?;
        Ok(entry)
    }

    /// Returns the latest charge for the document, unless it was already
    /// refunded. `None` when there is nothing to refund.
    pub fn refund_document(&self, document_id: i64) -> Result<Option<CreditTransaction>> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let charge: Option<(i64, i64, i64)> = tx
            .query_row(
                "SELECT id, user_id, amount FROM credit_transactions
                 WHERE reference_type = ?1 AND reference_id = ?2 AND amount < 0
                 ORDER BY id DESC LIMIT 1",
                params![CreditReference::Document.as_str(), document_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((charge_id, user_id, amount)) = charge else {
            return Ok(None);
        };
        let last_refund: i64 = tx.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM credit_transactions WHERE reference_type = ?1 AND reference_id = ?2",
            params![CreditReference::DocumentRefund.as_str(), document_id],
            |r| r.get(0),
        )?;
        if last_refund > charge_id {
            return Ok(None);
        }
        let filename: String = tx
            .query_row(
                "SELECT original_filename FROM documents WHERE id = ?",
                params![document_id],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or_else(|| format!("document {}", document_id));
        let entry = apply_credit_with(
            &tx,
            user_id,
            -amount,
            &format!("Refund for failed OCR processing: {}", filename),
            CreditReference::DocumentRefund,
            Some(document_id),
        )?;
        tx.commit()?;
        Ok(Some(entry))
    }

    /// Newest first.
    pub fn credit_transactions(&self, user_id: i64, limit: Option<usize>) -> Result<Vec<CreditTransaction>> {
        let conn = self.conn.lock()?;
        let sql = format!(
            "SELECT {} FROM credit_transactions WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            CREDIT_COLUMNS
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, limit], credit_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Charges and refunds for one document, oldest first.
    pub fn document_credit_transactions(&self, document_id: i64) -> Result<Vec<CreditTransaction>> {
        let conn = self.conn.lock()?;
        let sql = format!(
            "SELECT {} FROM credit_transactions
             WHERE reference_id = ?1 AND reference_type IN (?2, ?3) ORDER BY id",
            CREDIT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                document_id,
                CreditReference::Document.as_str(),
                CreditReference::DocumentRefund.as_str()
            ],
            credit_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- templates ----

    pub fn insert_template(&self, draft: &TemplateDraft) -> Result<i64> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let now = now_timestamp();
        tx.execute(
            "INSERT INTO templates (user_id, name, instructions, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![draft.user_id, draft.name, draft.instructions, now],
        )?;
        let template_id = tx.last_insert_rowid();
        for field in &draft.fields {
            insert_field_with(&tx, template_id, field)?;
        }
        tx.commit()?;
        Ok(template_id)
    }

    pub fn insert_field(&self, template_id: i64, draft: &FieldDraft) -> Result<i64> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let field_id = insert_field_with(&tx, template_id, draft)?;
        tx.execute(
            "UPDATE templates SET updated_at = ?1 WHERE id = ?2",
            params![now_timestamp(), template_id],
        )?;
        tx.commit()?;
        Ok(field_id)
    }

    pub fn delete_field(&self, template_id: i64, field_id: i64) -> Result<()> {
        let conn = self.conn.lock()?;
        let n = conn.execute(
            "DELETE FROM template_fields WHERE id = ?1 AND template_id = ?2",
            params![field_id, template_id],
        )?;
        if n == 0 {
            return Err(IntakeError::not_found("field", field_id));
        }
        conn.execute(
            "UPDATE templates SET updated_at = ?1 WHERE id = ?2",
            params![now_timestamp(), template_id],
        )?;
        Ok(())
    }

    /// Refused while any document's last run used this template.
    pub fn delete_template(&self, template_id: i64) -> Result<()> {
        let conn = self.conn.lock()?;
        let referenced: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE template_id = ?",
            params![template_id],
            |r| r.get(0),
        )?;
        if referenced > 0 {
            return Err(IntakeError::State(format!(
                "template {} is referenced by {} document(s)",
                template_id, referenced
            )));
        }
        let n = conn.execute("DELETE FROM templates WHERE id = ?", params![template_id])?;
        if n == 0 {
            return Err(IntakeError::not_found("template", template_id));
        }
        Ok(())
    }

    pub fn list_templates(&self, user_id: Option<i64>) -> Result<Vec<Template>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, instructions, created_at, updated_at FROM templates
             WHERE (?1 IS NULL OR user_id = ?1) ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], template_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn load_template_schema(&self, template_id: i64) -> Result<TemplateSchema> {
        let conn = self.conn.lock()?;
        load_schema_with(&conn, template_id)
    }

    // ---- documents ----

    pub fn insert_document(&self, user_id: i64, file_path: &str, original_filename: &str) -> Result<i64> {
        let conn = self.conn.lock()?;
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO documents (user_id, file_path, original_filename, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'PENDING', ?4, ?4)",
            params![user_id, file_path, original_filename, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_document(&self, document_id: i64) -> Result<Document> {
        let conn = self.conn.lock()?;
        get_document_with(&conn, document_id)
    }

    pub fn list_documents(&self, user_id: i64) -> Result<Vec<Document>> {
        let conn = self.conn.lock()?;
        let sql = format!("SELECT {} FROM documents WHERE user_id = ? ORDER BY id", DOCUMENT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], document_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_document(&self, document_id: i64) -> Result<()> {
        let conn = self.conn.lock()?;
        let n = conn.execute("DELETE FROM documents WHERE id = ?", params![document_id])?;
        if n == 0 {
            return Err(IntakeError::not_found("document", document_id));
        }
        Ok(())
    }

    // ---- extraction attempts ----

    /// Claims the document for a new extraction attempt.
    ///
    /// Fails with `State` while another attempt holds it, unless that attempt
    /// started more than `stale_after` ago. With `purge`, prior results are
    /// deleted in the same transaction.
    pub fn begin_processing(&self, document_id: i64, stale_after: Duration, purge: bool) -> Result<AttemptToken> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let current: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, processing_started_at FROM documents WHERE id = ?",
                params![document_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((status, started_at)) = current else {
            return Err(IntakeError::not_found("document", document_id));
        };
        if status == DocumentStatus::Processing.as_str() {
            let cutoff = timestamp_before(stale_after);
            match started_at {
                Some(started) if started > cutoff => {
                    return Err(IntakeError::State(format!(
                        "document {} is already being processed",
                        document_id
                    )));
                }
                _ => warn!(document_id, "taking over stale processing attempt"),
            }
        }
        if purge {
            let (scalars, rows) = purge_results_with(&tx, document_id)?;
            debug!(document_id, scalars, rows, "purged prior extraction results");
        }
        let token = AttemptToken::generate();
        let now = now_timestamp();
        tx.execute(
            "UPDATE documents SET status = 'PROCESSING', attempt_token = ?1, processing_started_at = ?2,
             processed_at = NULL, error_message = NULL, updated_at = ?2 WHERE id = ?3",
            params![token.as_str(), now, document_id],
        )?;
        tx.commit()?;
        Ok(token)
    }

    /// Writes one attempt's rows and flips the document to PROCESSED, atomically.
    /// Prior rows for the document are replaced. Returns `processed_at`.
    pub fn commit_ingestion(
        &self,
        document_id: i64,
        token: &AttemptToken,
        template_id: i64,
        pending: &PendingIngestion,
    ) -> Result<String> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        ensure_attempt_owner(&tx, document_id, token)?;
        purge_results_with(&tx, document_id)?;

        {
            let mut insert_scalar = tx.prepare(
                "INSERT INTO ocr_data (document_id, field_id, predicted_value, confidence, conversion_error)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in &pending.scalars {
                insert_scalar.execute(params![
                    document_id,
                    row.field_id,
                    row.predicted_value,
                    row.confidence,
                    row.conversion_error
                ])?;
            }
            let mut insert_item = tx.prepare(
                "INSERT INTO ocr_line_items (document_id, field_id, row_index) VALUES (?1, ?2, ?3)",
            )?;
            let mut insert_cell = tx.prepare(
                "INSERT INTO ocr_line_item_values
                 (line_item_id, sub_field_id, predicted_value, confidence, conversion_error)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for item in &pending.line_items {
                insert_item.execute(params![document_id, item.field_id, item.row_index])?;
                let line_item_id = tx.last_insert_rowid();
                for cell in &item.values {
                    insert_cell.execute(params![
                        line_item_id,
                        cell.sub_field_id,
                        cell.predicted_value,
                        cell.confidence,
                        cell.conversion_error
                    ])?;
                }
            }
        }

        let now = now_timestamp();
        tx.execute(
            "UPDATE documents SET status = 'PROCESSED', processed_at = ?1, updated_at = ?1, template_id = ?2,
             attempt_token = NULL, processing_started_at = NULL, error_message = NULL WHERE id = ?3",
            params![now, template_id, document_id],
        )?;
        tx.commit()?;
        Ok(now)
    }

    /// Records a failed attempt. Only the attempt that owns the document may do this.
    pub fn mark_failed(&self, document_id: i64, token: &AttemptToken, reason: &str) -> Result<()> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        ensure_attempt_owner(&tx, document_id, token)?;
        let now = now_timestamp();
        tx.execute(
            "UPDATE documents SET status = 'FAILED', processed_at = ?1, updated_at = ?1, error_message = ?2,
             attempt_token = NULL, processing_started_at = NULL WHERE id = ?3",
            params![now, reason, document_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Moves every document stuck in PROCESSING for longer than `stale_after` to FAILED.
    pub fn fail_stale_processing(&self, stale_after: Duration) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let cutoff = timestamp_before(stale_after);
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM documents WHERE status = 'PROCESSING'
                 AND (processing_started_at IS NULL OR processing_started_at <= ?1) ORDER BY id",
            )?;
            let rows = stmt.query_map(params![cutoff], |r| r.get::<_, i64>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let now = now_timestamp();
        for id in &ids {
            tx.execute(
                "UPDATE documents SET status = 'FAILED', processed_at = ?1, updated_at = ?1,
                 error_message = 'processing timed out', attempt_token = NULL, processing_started_at = NULL
                 WHERE id = ?2",
                params![now, id],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    // ---- results ----

    pub fn load_ocr_data(&self, document_id: i64) -> Result<Vec<OcrData>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT o.id, o.document_id, o.field_id, f.field_name, o.predicted_value, o.actual_value,
                    o.confidence, o.conversion_error
             FROM ocr_data o JOIN template_fields f ON f.id = o.field_id
             WHERE o.document_id = ? ORDER BY f.field_order",
        )?;
        let rows = stmt.query_map(params![document_id], |r| {
            Ok(OcrData {
                id: r.get(0)?,
                document_id: r.get(1)?,
                field_id: r.get(2)?,
                field_name: r.get(3)?,
                predicted_value: r.get(4)?,
                actual_value: r.get(5)?,
                confidence: r.get(6)?,
                conversion_error: r.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn load_line_items(&self, document_id: i64) -> Result<Vec<OcrLineItem>> {
        let conn = self.conn.lock()?;
        let mut items = {
            let mut stmt = conn.prepare(
                "SELECT li.id, li.document_id, li.field_id, f.field_name, li.row_index
                 FROM ocr_line_items li JOIN template_fields f ON f.id = li.field_id
                 WHERE li.document_id = ? ORDER BY f.field_order, li.row_index",
            )?;
            let rows = stmt.query_map(params![document_id], |r| {
                Ok(OcrLineItem {
                    id: r.get(0)?,
                    document_id: r.get(1)?,
                    field_id: r.get(2)?,
                    field_name: r.get(3)?,
                    row_index: r.get(4)?,
                    values: Vec::new(),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut stmt = conn.prepare(
            "SELECT v.id, v.line_item_id, v.sub_field_id, s.field_name, v.predicted_value, v.actual_value,
                    v.confidence, v.conversion_error
             FROM ocr_line_item_values v JOIN sub_template_fields s ON s.id = v.sub_field_id
             WHERE v.line_item_id = ? ORDER BY s.column_order",
        )?;
        for item in &mut items {
            let rows = stmt.query_map(params![item.id], |r| {
                Ok(OcrLineItemValue {
                    id: r.get(0)?,
                    line_item_id: r.get(1)?,
                    sub_field_id: r.get(2)?,
                    column_name: r.get(3)?,
                    predicted_value: r.get(4)?,
                    actual_value: r.get(5)?,
                    confidence: r.get(6)?,
                    conversion_error: r.get(7)?,
                })
            })?;
            item.values = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        }
        Ok(items)
    }

    /// (OCRData rows, line items) stored for the document.
    pub fn count_results(&self, document_id: i64) -> Result<(i64, i64)> {
        let conn = self.conn.lock()?;
        let scalars = conn.query_row(
            "SELECT COUNT(*) FROM ocr_data WHERE document_id = ?",
            params![document_id],
            |r| r.get(0),
        )?;
        let items = conn.query_row(
            "SELECT COUNT(*) FROM ocr_line_items WHERE document_id = ?",
            params![document_id],
            |r| r.get(0),
        )?;
        Ok((scalars, items))
    }

    // ---- corrections ----

    pub fn correct_field_value(&self, document_id: i64, field_name: &str, new_value: &str) -> Result<CorrectionReceipt> {
        let conn = self.conn.lock()?;
        let template_id = processed_template_with(&conn, document_id)?;
        let (field_id, name, _) = find_field_with(&conn, template_id, field_name)?
            .ok_or_else(|| IntakeError::not_found("field", field_name))?;
        let row: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT id, predicted_value FROM ocr_data WHERE document_id = ?1 AND field_id = ?2",
                params![document_id, field_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (row_id, predicted_value) =
            row.ok_or_else(|| IntakeError::not_found("ocr_data", format!("{}/{}", document_id, name)))?;
        conn.execute(
            "UPDATE ocr_data SET actual_value = ?1 WHERE id = ?2",
            params![new_value, row_id],
        )?;
        touch_document_with(&conn, document_id)?;
        Ok(CorrectionReceipt {
            document_id,
            field: name,
            row_index: None,
            column: None,
            predicted_value,
            actual_value: new_value.to_string(),
        })
    }

    pub fn correct_table_cell(
        &self,
        document_id: i64,
        field_name: &str,
        row_index: i64,
        column_name: &str,
        new_value: &str,
    ) -> Result<CorrectionReceipt> {
        let conn = self.conn.lock()?;
        let template_id = processed_template_with(&conn, document_id)?;
        let (field_id, name, _) = find_field_with(&conn, template_id, field_name)?
            .filter(|(_, _, t)| *t == FieldType::Table)
            .ok_or_else(|| IntakeError::not_found("table field", field_name))?;

        let line_item_id: i64 = conn
            .query_row(
                "SELECT id FROM ocr_line_items WHERE document_id = ?1 AND field_id = ?2 AND row_index = ?3",
                params![document_id, field_id, row_index],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| IntakeError::not_found("line item", format!("{}[{}]", name, row_index)))?;

        let columns = {
            let mut stmt = conn.prepare("SELECT id, field_name FROM sub_template_fields WHERE field_id = ?")?;
            let rows = stmt.query_map(params![field_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let key = normalize_key(column_name);
        let (sub_field_id, column) = columns
            .into_iter()
            .find(|(_, n)| normalize_key(n) == key)
            .ok_or_else(|| IntakeError::not_found("column", format!("{}.{}", name, column_name)))?;

        let cell: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT id, predicted_value FROM ocr_line_item_values WHERE line_item_id = ?1 AND sub_field_id = ?2",
                params![line_item_id, sub_field_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (cell_id, predicted_value) = cell.ok_or_else(|| {
            IntakeError::not_found("cell", format!("{}[{}].{}", name, row_index, column))
        })?;
        conn.execute(
            "UPDATE ocr_line_item_values SET actual_value = ?1 WHERE id = ?2",
            params![new_value, cell_id],
        )?;
        touch_document_with(&conn, document_id)?;
        Ok(CorrectionReceipt {
            document_id,
            field: name,
            row_index: Some(row_index),
            column: Some(column),
            predicted_value,
            actual_value: new_value.to_string(),
        })
    }
}

fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT CURRENT_TIMESTAMP
        );",
    )?;
    let current: i64 = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;
    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?)", params![version])?;
        tx.commit()?;
        debug!(version, "applied migration");
    }
    Ok(())
}

fn insert_field_with(conn: &Connection, template_id: i64, field: &FieldDraft) -> Result<i64> {
    conn.execute(
        "INSERT INTO template_fields (template_id, field_name, field_order, field_type, instructions)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            template_id,
            field.name.as_str(),
            field.field_order,
            field.field_type.as_str(),
            field.instructions
        ],
    )?;
    let field_id = conn.last_insert_rowid();
    insert_options_with(conn, "field_options", "field_id", field_id, &field.options)?;
    for sub in &field.sub_fields {
        insert_sub_field_with(conn, field_id, sub)?;
    }
    Ok(field_id)
}

fn insert_sub_field_with(conn: &Connection, field_id: i64, sub: &SubFieldDraft) -> Result<i64> {
    conn.execute(
        "INSERT INTO sub_template_fields (field_id, field_name, data_type, instructions, column_order)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![field_id, sub.name, sub.data_type.as_str(), sub.instructions, sub.column_order],
    )?;
    let sub_id = conn.last_insert_rowid();
    insert_options_with(conn, "sub_field_options", "sub_field_id", sub_id, &sub.options)?;
    Ok(sub_id)
}

fn insert_options_with(conn: &Connection, table: &str, owner_column: &str, owner_id: i64, options: &[FieldOption]) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} ({}, value, label, option_order) VALUES (?1, ?2, ?3, ?4)",
        table, owner_column
    );
    let mut stmt = conn.prepare(&sql)?;
    for (i, opt) in options.iter().enumerate() {
        stmt.execute(params![owner_id, opt.value, opt.label, i as i64])?;
    }
    Ok(())
}

fn load_options_with(conn: &Connection, table: &str, owner_column: &str, owner_id: i64) -> Result<Vec<FieldOption>> {
    let sql = format!(
        "SELECT value, label FROM {} WHERE {} = ? ORDER BY option_order",
        table, owner_column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![owner_id], |r| {
        Ok(FieldOption {
            value: r.get(0)?,
            label: r.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn load_schema_with(conn: &Connection, template_id: i64) -> Result<TemplateSchema> {
    let template = conn
        .query_row(
            "SELECT id, user_id, name, instructions, created_at, updated_at FROM templates WHERE id = ?",
            params![template_id],
            template_from_row,
        )
        .optional()?
        .ok_or_else(|| IntakeError::not_found("template", template_id))?;

    let mut fields = {
        let mut stmt = conn.prepare(
            "SELECT id, template_id, field_name, field_order, field_type, instructions
             FROM template_fields WHERE template_id = ? ORDER BY field_order, id",
        )?;
        let rows = stmt.query_map(params![template_id], |r| {
            let raw_name: String = r.get(2)?;
            let name = FieldName::parse(&raw_name)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;
            Ok(TemplateField {
                id: r.get(0)?,
                template_id: r.get(1)?,
                name,
                field_order: r.get(3)?,
                field_type: parse_column(4, r.get(4)?)?,
                instructions: r.get(5)?,
                sub_fields: Vec::new(),
                options: Vec::new(),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut sub_stmt = conn.prepare(
        "SELECT id, field_id, field_name, data_type, instructions, column_order
         FROM sub_template_fields WHERE field_id = ? ORDER BY column_order, id",
    )?;
    for field in &mut fields {
        field.options = load_options_with(conn, "field_options", "field_id", field.id)?;
        if field.field_type != FieldType::Table {
            continue;
        }
        let rows = sub_stmt.query_map(params![field.id], |r| {
            Ok(SubTemplateField {
                id: r.get(0)?,
                field_id: r.get(1)?,
                name: r.get(2)?,
                data_type: parse_column::<DataType>(3, r.get(3)?)?,
                instructions: r.get(4)?,
                column_order: r.get(5)?,
                options: Vec::new(),
            })
        })?;
        let mut subs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        for sub in &mut subs {
            sub.options = load_options_with(conn, "sub_field_options", "sub_field_id", sub.id)?;
        }
        field.sub_fields = subs;
    }
    Ok(TemplateSchema { template, fields })
}

fn balance_with(conn: &Connection, user_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT credits_remaining FROM users WHERE id = ?",
        params![user_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| IntakeError::not_found("user", user_id))
}

/// Moves the balance by `amount` and records the ledger row. Never lets the
/// balance go below zero.
fn apply_credit_with(
    conn: &Connection,
    user_id: i64,
    amount: i64,
    description: &str,
    reference: CreditReference,
    reference_id: Option<i64>,
) -> Result<CreditTransaction> {
    let before = balance_with(conn, user_id)?;
    let after = before
        .checked_add(amount)
        .ok_or_else(|| IntakeError::Validation(format!("credit amount {} is out of range", amount)))?;
    if after < 0 {
        return Err(IntakeError::InsufficientCredits {
            required: -amount,
            available: before,
        });
    }
    conn.execute(
        "UPDATE users SET credits_remaining = ?1 WHERE id = ?2",
        params![after, user_id],
    )?;
    let created_at = now_timestamp();
    conn.execute(
        "INSERT INTO credit_transactions
         (user_id, amount, balance_before, balance_after, description, reference_type, reference_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![user_id, amount, before, after, description, reference.as_str(), reference_id, created_at],
    )?;
    debug!(user_id, amount, balance = after, reference = %reference, "credit ledger entry");
    Ok(CreditTransaction {
        id: conn.last_insert_rowid(),
        user_id,
        amount,
        balance_before: before,
        balance_after: after,
        description: description.to_string(),
        reference_type: reference,
        reference_id,
        created_at,
    })
}

fn get_document_with(conn: &Connection, document_id: i64) -> Result<Document> {
    let sql = format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS);
    conn.query_row(&sql, params![document_id], document_from_row)
        .optional()?
        .ok_or_else(|| IntakeError::not_found("document", document_id))
}

fn ensure_attempt_owner(conn: &Connection, document_id: i64, token: &AttemptToken) -> Result<()> {
    let stored: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT status, attempt_token FROM documents WHERE id = ?",
            params![document_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((status, stored_token)) = stored else {
        return Err(IntakeError::not_found("document", document_id));
    };
    if status != DocumentStatus::Processing.as_str() || stored_token.as_deref() != Some(token.as_str()) {
        return Err(IntakeError::State(format!(
            "extraction attempt for document {} was superseded",
            document_id
        )));
    }
    Ok(())
}

/// Deletes all extracted rows for the document; values cascade from line items.
fn purge_results_with(conn: &Connection, document_id: i64) -> Result<(usize, usize)> {
    let scalars = conn.execute("DELETE FROM ocr_data WHERE document_id = ?", params![document_id])?;
    let items = conn.execute("DELETE FROM ocr_line_items WHERE document_id = ?", params![document_id])?;
    Ok((scalars, items))
}

/// Template of the document's completed run; corrections need PROCESSED.
fn processed_template_with(conn: &Connection, document_id: i64) -> Result<i64> {
    let doc = get_document_with(conn, document_id)?;
    if doc.status != DocumentStatus::Processed {
        return Err(IntakeError::State(format!(
            "document {} is {}; corrections require PROCESSED",
            document_id, doc.status
        )));
    }
    doc.template_id
        .ok_or_else(|| IntakeError::not_found("template for document", document_id))
}

fn find_field_with(conn: &Connection, template_id: i64, field_name: &str) -> Result<Option<(i64, String, FieldType)>> {
    let mut stmt = conn.prepare("SELECT id, field_name, field_type FROM template_fields WHERE template_id = ?")?;
    let rows = stmt.query_map(params![template_id], |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, parse_column::<FieldType>(2, r.get(2)?)?))
    })?;
    let key = normalize_key(field_name);
    for row in rows {
        let row = row?;
        if normalize_key(&row.1) == key {
            return Ok(Some(row));
        }
    }
    Ok(None)
}

fn touch_document_with(conn: &Connection, document_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE documents SET updated_at = ?1 WHERE id = ?2",
        params![now_timestamp(), document_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewCellValue, NewLineItem, NewOcrData};

    fn seeded() -> (Db, i64, i64) {
        let db = Db::open_in_memory().unwrap();
        let user = db.create_user("ana", "ana@example.com").unwrap();
        let draft = TemplateDraft {
            user_id: user,
            name: "Invoice".into(),
            instructions: None,
            fields: vec![
                FieldDraft {
                    name: FieldName::parse("invoice_number").unwrap(),
                    field_order: 1,
                    field_type: FieldType::Text,
                    instructions: None,
                    options: vec![],
                    sub_fields: vec![],
                },
                FieldDraft {
                    name: FieldName::parse("items").unwrap(),
                    field_order: 2,
                    field_type: FieldType::Table,
                    instructions: None,
                    options: vec![],
                    sub_fields: vec![SubFieldDraft {
                        name: "quantity".into(),
                        data_type: DataType::Integer,
                        instructions: None,
                        column_order: 1,
                        options: vec![],
                    }],
                },
            ],
        };
        let template = db.insert_template(&draft).unwrap();
        (db, user, template)
    }

    fn pending(schema: &TemplateSchema, value: &str) -> PendingIngestion {
        let text = schema.field("invoice_number").unwrap();
        let table = schema.field("items").unwrap();
        PendingIngestion {
            scalars: vec![NewOcrData {
                field_id: text.id,
                predicted_value: Some(value.into()),
                confidence: Some(0.9),
                conversion_error: None,
            }],
            line_items: vec![NewLineItem {
                field_id: table.id,
                row_index: 0,
                values: vec![NewCellValue {
                    sub_field_id: table.sub_fields[0].id,
                    predicted_value: Some("2".into()),
                    confidence: None,
                    conversion_error: None,
                }],
            }],
        }
    }

    #[test]
    fn migrations_are_recorded() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), 4);
    }

    #[test]
    fn schema_loads_in_declared_order() {
        let (db, _, template) = seeded();
        let schema = db.load_template_schema(template).unwrap();
        let names: Vec<_> = schema.fields.iter().map(|f| f.name.to_string()).collect();
        assert_eq!(names, vec!["invoice_number", "items"]);
        assert_eq!(schema.fields[1].sub_fields[0].data_type, DataType::Integer);
        assert!(matches!(db.load_template_schema(999), Err(IntakeError::NotFound { .. })));
    }

    #[test]
    fn second_claim_is_rejected_until_stale() {
        let (db, user, _) = seeded();
        let doc = db.insert_document(user, "/tmp/a.pdf", "a.pdf").unwrap();
        db.begin_processing(doc, Duration::minutes(5), false).unwrap();
        let err = db.begin_processing(doc, Duration::minutes(5), false).unwrap_err();
        assert!(matches!(err, IntakeError::State(_)));
        db.begin_processing(doc, Duration::zero(), false).unwrap();
    }

    #[test]
    fn superseded_attempt_cannot_commit() {
        let (db, user, template) = seeded();
        let schema = db.load_template_schema(template).unwrap();
        let doc = db.insert_document(user, "/tmp/a.pdf", "a.pdf").unwrap();
        let first = db.begin_processing(doc, Duration::zero(), false).unwrap();
        let second = db.begin_processing(doc, Duration::zero(), false).unwrap();
        let err = db.commit_ingestion(doc, &first, template, &pending(&schema, "A")).unwrap_err();
        assert!(matches!(err, IntakeError::State(_)));
        assert!(matches!(db.mark_failed(doc, &first, "x"), Err(IntakeError::State(_))));
        db.commit_ingestion(doc, &second, template, &pending(&schema, "B")).unwrap();
        assert_eq!(db.count_results(doc).unwrap(), (1, 1));
    }

    #[test]
    fn commit_replaces_prior_rows() {
        let (db, user, template) = seeded();
        let schema = db.load_template_schema(template).unwrap();
        let doc = db.insert_document(user, "/tmp/a.pdf", "a.pdf").unwrap();
        for value in ["A", "B"] {
            let token = db.begin_processing(doc, Duration::minutes(5), false).unwrap();
            db.commit_ingestion(doc, &token, template, &pending(&schema, value)).unwrap();
        }
        assert_eq!(db.count_results(doc).unwrap(), (1, 1));
        let rows = db.load_ocr_data(doc).unwrap();
        assert_eq!(rows[0].predicted_value.as_deref(), Some("B"));
        let doc = db.get_document(doc).unwrap();
        assert_eq!(doc.status, DocumentStatus::Processed);
        assert!(doc.processed_at.is_some());
    }

    #[test]
    fn stale_documents_are_failed() {
        let (db, user, _) = seeded();
        let doc = db.insert_document(user, "/tmp/a.pdf", "a.pdf").unwrap();
        db.begin_processing(doc, Duration::minutes(5), false).unwrap();
        assert!(db.fail_stale_processing(Duration::minutes(5)).unwrap().is_empty());
        assert_eq!(db.fail_stale_processing(Duration::zero()).unwrap(), vec![doc]);
        let doc = db.get_document(doc).unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.error_message.as_deref(), Some("processing timed out"));
    }

    #[test]
    fn corrections_resolve_each_step() {
        let (db, user, template) = seeded();
        let schema = db.load_template_schema(template).unwrap();
        let doc = db.insert_document(user, "/tmp/a.pdf", "a.pdf").unwrap();
        assert!(matches!(
            db.correct_field_value(doc, "invoice_number", "X"),
            Err(IntakeError::State(_))
        ));
        let token = db.begin_processing(doc, Duration::minutes(5), false).unwrap();
        db.commit_ingestion(doc, &token, template, &pending(&schema, "A")).unwrap();

        let receipt = db.correct_field_value(doc, "InvoiceNumber", "INV-9").unwrap();
        assert_eq!(receipt.predicted_value.as_deref(), Some("A"));
        let cell = db.correct_table_cell(doc, "items", 0, "Quantity", "3").unwrap();
        assert_eq!(cell.column.as_deref(), Some("quantity"));

        for err in [
            db.correct_field_value(doc, "due_date", "x").unwrap_err(),
            db.correct_table_cell(doc, "invoice_number", 0, "quantity", "x").unwrap_err(),
            db.correct_table_cell(doc, "items", 4, "quantity", "x").unwrap_err(),
            db.correct_table_cell(doc, "items", 0, "price", "x").unwrap_err(),
        ] {
            assert!(matches!(err, IntakeError::NotFound { .. }), "{}", err);
        }
    }

    #[test]
    fn credit_ledger_tracks_charges_and_single_refunds() {
        let (db, user, _) = seeded();
        let doc = db.insert_document(user, "/tmp/a.pdf", "a.pdf").unwrap();
        assert!(matches!(
            db.charge_document(doc, 1),
            Err(IntakeError::InsufficientCredits { required: 1, available: 0 })
        ));
        assert!(db.credit_transactions(user, None).unwrap().is_empty());

        let added = db.add_credits(user, 3, "top up").unwrap();
        assert_eq!((added.balance_before, added.balance_after), (0, 3));
        let charge = db.charge_document(doc, 2).unwrap();
        assert_eq!(charge.amount, -2);
        assert_eq!(charge.description, "OCR processing for document: a.pdf");
        assert_eq!(db.credit_balance(user).unwrap(), 1);

        let refund = db.refund_document(doc).unwrap().unwrap();
        assert_eq!(refund.amount, 2);
        assert_eq!(refund.reference_type, CreditReference::DocumentRefund);
        assert!(db.refund_document(doc).unwrap().is_none());
        assert_eq!(db.credit_balance(user).unwrap(), 3);

        let history = db.credit_transactions(user, Some(2)).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, refund.id);
        let per_doc = db.document_credit_transactions(doc).unwrap();
        assert_eq!(per_doc.iter().map(|t| t.amount).collect::<Vec<_>>(), vec![-2, 2]);
        assert!(matches!(db.credit_balance(999), Err(IntakeError::NotFound { .. })));
    }

    #[test]
    fn referenced_template_cannot_be_deleted_and_users_cascade() {
        let (db, user, template) = seeded();
        let schema = db.load_template_schema(template).unwrap();
        let doc = db.insert_document(user, "/tmp/a.pdf", "a.pdf").unwrap();
        let token = db.begin_processing(doc, Duration::minutes(5), false).unwrap();
        db.commit_ingestion(doc, &token, template, &pending(&schema, "A")).unwrap();
        assert!(matches!(db.delete_template(template), Err(IntakeError::State(_))));
        db.delete_user(user).unwrap();
        assert!(matches!(db.get_document(doc), Err(IntakeError::NotFound { .. })));
        assert!(db.list_templates(None).unwrap().is_empty());
    }
}
