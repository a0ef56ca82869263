//! Caller-facing operations. Each returns a serializable value or an
//! [`ErrorPayload`] carrying a stable `kind` the caller can branch on.

use crate::config::Config;
use crate::db::Db;
use crate::error::{IntakeError, Result};
use crate::models::{CreditTransaction, DataType, Document, FieldType, Template, TemplateSchema, KNOWN_FIELD_NAMES};
use crate::ocr::{mime_type_for, Extractor, GeminiExtractor};
use crate::services::sink::{LedgerConnector, SinkReport, VoucherDraft};
use crate::services::{CorrectionService, CreditService, IngestionEngine, SchemaRegistry, SinkService};
use crate::tally::TallyHttpConnector;
use crate::types::{
    CorrectionReceipt, CreditCheck, CreditSummary, DocumentCreditUsage, DocumentResults,
    DocumentStatusReport, FieldPayload, FieldVocabulary, ProcessOutcome, TemplatePayload,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const MAX_DOCUMENT_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl From<IntakeError> for ErrorPayload {
    fn from(err: IntakeError) -> Self {
        ErrorPayload {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

pub type CommandResult<T> = std::result::Result<T, ErrorPayload>;

#[derive(Debug, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    fn invalid(msg: impl Into<String>) -> Self {
        ValidationResult {
            valid: false,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateUserPayload {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFieldPayload {
    pub document_id: i64,
    pub field_name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCellPayload {
    pub document_id: i64,
    pub field_name: String,
    pub row_index: i64,
    pub column_name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct AddCreditsPayload {
    pub user_id: i64,
    pub amount: i64,
    #[serde(default)]
    pub description: Option<String>,
}

pub struct AppState {
    pub config: Config,
    pub db: Arc<Db>,
    pub registry: Arc<SchemaRegistry>,
    pub engine: Arc<IngestionEngine>,
    pub corrections: CorrectionService,
    pub credits: CreditService,
    pub sink: SinkService,
}

impl AppState {
    /// Opens the configured database and wires the Gemini extractor and the
    /// Tally connector.
    pub fn new(config: Config) -> Result<Self> {
        let db = Arc::new(Db::new(&config.database_path)?);
        let extractor = Arc::new(GeminiExtractor::new(config.gemini.clone())?);
        let connector = Arc::new(TallyHttpConnector::new(&config.tally)?);
        Ok(Self::with_parts(config, db, extractor, connector))
    }

    pub fn with_parts(
        config: Config,
        db: Arc<Db>,
        extractor: Arc<dyn Extractor>,
        connector: Arc<dyn LedgerConnector>,
    ) -> Self {
        let registry = Arc::new(SchemaRegistry::new(db.clone()));
        let engine = Arc::new(IngestionEngine::new(
            db.clone(),
            registry.clone(),
            extractor,
            config.processing_timeout,
        ));
        let corrections = CorrectionService::new(db.clone());
        let credits = CreditService::new(db.clone(), config.credits.clone());
        let sink = SinkService::new(engine.clone(), connector, config.tally.defaults.clone());
        AppState {
            config,
            db,
            registry,
            engine,
            corrections,
            credits,
            sink,
        }
    }
}

pub fn get_extraction_status(state: &AppState) -> String {
    state.config.extraction_status().to_string()
}

// ---- users ----

pub fn create_user(state: &AppState, payload: CreateUserPayload) -> CommandResult<i64> {
    let username = payload.username.trim();
    let email = payload.email.trim();
    if username.is_empty() || email.is_empty() {
        return Err(IntakeError::Validation("username and email are required".to_string()).into());
    }
    let id = state.db.create_user(username, email)?;
    state.credits.open_account(id)?;
    info!(user_id = id, "user created");
    Ok(id)
}

pub fn delete_user(state: &AppState, user_id: i64) -> CommandResult<()> {
    state.db.delete_user(user_id)?;
    state.registry.invalidate_all();
    Ok(())
}

// ---- credits ----

pub fn get_credit_summary(state: &AppState, user_id: i64) -> CommandResult<CreditSummary> {
    Ok(state.credits.summary(user_id)?)
}

pub fn add_credits(state: &AppState, payload: AddCreditsPayload) -> CommandResult<CreditTransaction> {
    Ok(state
        .credits
        .add(payload.user_id, payload.amount, payload.description.as_deref())?)
}

pub fn check_credits(state: &AppState, user_id: i64, required: i64) -> CommandResult<CreditCheck> {
    Ok(state.credits.check(user_id, required)?)
}

pub fn get_document_credit_usage(state: &AppState, document_id: i64) -> CommandResult<Option<DocumentCreditUsage>> {
    Ok(state.credits.document_usage(document_id)?)
}

// ---- templates ----

/// Known field names plus the accepted field and column type tags.
pub fn list_field_vocabulary() -> FieldVocabulary {
    FieldVocabulary {
        field_names: KNOWN_FIELD_NAMES.to_vec(),
        field_types: FieldType::ALL.iter().map(|t| t.as_str()).collect(),
        column_types: DataType::ALL.iter().map(|t| t.as_str()).collect(),
    }
}

pub fn create_template(state: &AppState, user_id: i64, payload: TemplatePayload) -> CommandResult<TemplateSchema> {
    let schema = state.registry.create_template(user_id, &payload)?;
    Ok((*schema).clone())
}

pub fn get_template(state: &AppState, template_id: i64) -> CommandResult<TemplateSchema> {
    Ok((*state.registry.schema(template_id)?).clone())
}

pub fn list_templates(state: &AppState, user_id: Option<i64>) -> CommandResult<Vec<Template>> {
    Ok(state.registry.list_templates(user_id)?)
}

pub fn add_field(state: &AppState, template_id: i64, payload: FieldPayload) -> CommandResult<TemplateSchema> {
    Ok((*state.registry.add_field(template_id, &payload)?).clone())
}

pub fn remove_field(state: &AppState, template_id: i64, field_name: &str) -> CommandResult<TemplateSchema> {
    Ok((*state.registry.remove_field(template_id, field_name)?).clone())
}

pub fn delete_template(state: &AppState, template_id: i64) -> CommandResult<()> {
    Ok(state.registry.delete_template(template_id)?)
}

// ---- documents ----

/// Checks that a file can be registered as a document.
pub fn validate_document_file(path: &str) -> CommandResult<ValidationResult> {
    let path = Path::new(path);
    if !path.exists() {
        return Ok(ValidationResult::invalid("File not found."));
    }
    let metadata = fs::metadata(path).map_err(IntakeError::from)?;
    if !metadata.is_file() {
        return Ok(ValidationResult::invalid("Not a regular file."));
    }
    if metadata.len() > MAX_DOCUMENT_BYTES {
        return Ok(ValidationResult::invalid("File too large (max 16MB)."));
    }
    let mime = match mime_type_for(path) {
        Ok(m) => m,
        Err(e) => return Ok(ValidationResult::invalid(e.to_string())),
    };
    let mut f = fs::File::open(path).map_err(IntakeError::from)?;
    let mut header = [0u8; 8];
    let read = f.read(&mut header).map_err(IntakeError::from)?;
    if read < 4 {
        return Ok(ValidationResult::invalid("File is empty or truncated."));
    }
    if mime == "application/pdf" && !header.starts_with(b"%PDF-") {
        return Ok(ValidationResult::invalid("Not a valid PDF file."));
    }
    Ok(ValidationResult {
        valid: true,
        error: None,
    })
}

pub fn upload_document(state: &AppState, user_id: i64, path: &str) -> CommandResult<Document> {
    let check = validate_document_file(path)?;
    if !check.valid {
        return Err(IntakeError::Validation(check.error.unwrap_or_else(|| "invalid document".to_string())).into());
    }
    if !state.db.user_exists(user_id)? {
        return Err(IntakeError::not_found("user", user_id).into());
    }
    let full = fs::canonicalize(path).map_err(IntakeError::from)?;
    let original_filename = full
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id = state
        .db
        .insert_document(user_id, &full.to_string_lossy(), &original_filename)?;
    info!(document_id = id, user_id, file = %original_filename, "document uploaded");
    Ok(state.db.get_document(id)?)
}

pub fn list_documents(state: &AppState, user_id: i64) -> CommandResult<Vec<Document>> {
    Ok(state.db.list_documents(user_id)?)
}

pub fn delete_document(state: &AppState, document_id: i64) -> CommandResult<()> {
    Ok(state.db.delete_document(document_id)?)
}

// ---- ingestion ----

/// Charges one run to the document's owner; a run that errors is refunded.
pub fn process_document(state: &AppState, document_id: i64, template_id: i64) -> CommandResult<ProcessOutcome> {
    Ok(state
        .credits
        .charged(document_id, || state.engine.process(document_id, template_id))?)
}

pub fn reprocess_document(state: &AppState, document_id: i64, template_id: i64) -> CommandResult<ProcessOutcome> {
    Ok(state
        .credits
        .charged(document_id, || state.engine.reprocess(document_id, template_id))?)
}

pub fn get_results(state: &AppState, document_id: i64) -> CommandResult<DocumentResults> {
    Ok(state.engine.results(document_id)?)
}

pub fn get_status(state: &AppState, document_id: i64) -> CommandResult<DocumentStatusReport> {
    Ok(state.engine.status(document_id)?)
}

pub fn sweep_stale(state: &AppState) -> CommandResult<Vec<i64>> {
    Ok(state.engine.sweep_stale()?)
}

// ---- corrections ----

pub fn update_field_value(state: &AppState, payload: UpdateFieldPayload) -> CommandResult<CorrectionReceipt> {
    Ok(state
        .corrections
        .update_field_value(payload.document_id, &payload.field_name, &payload.value)?)
}

pub fn update_table_cell_value(state: &AppState, payload: UpdateCellPayload) -> CommandResult<CorrectionReceipt> {
    Ok(state.corrections.update_table_cell_value(
        payload.document_id,
        &payload.field_name,
        payload.row_index,
        &payload.column_name,
        &payload.value,
    )?)
}

// ---- sink ----

pub fn preview_voucher(state: &AppState, document_id: i64) -> CommandResult<VoucherDraft> {
    Ok(state.sink.preview(document_id)?)
}

pub fn push_voucher(state: &AppState, document_id: i64) -> CommandResult<SinkReport> {
    Ok(state.sink.push_document(document_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CreditConfig, GeminiConfig, TallyConfig, VoucherDefaults};
    use crate::testing::{MockExtractor, MockLedger};
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    fn state() -> AppState {
        let config = Config {
            database_path: PathBuf::from(":memory:"),
            gemini: GeminiConfig {
                api_key: None,
                model: "m".into(),
                endpoint: "http://localhost".into(),
                timeout: Duration::from_secs(1),
            },
            processing_timeout: Duration::from_secs(300),
            tally: TallyConfig {
                url: "http://localhost:9000".into(),
                company: None,
                timeout: Duration::from_secs(1),
                defaults: VoucherDefaults::default(),
            },
            credits: CreditConfig {
                cost_per_document: 1,
                starting_balance: 5,
            },
        };
        AppState::with_parts(
            config,
            Arc::new(Db::open_in_memory().unwrap()),
            Arc::new(MockExtractor::new()),
            Arc::new(MockLedger::new()),
        )
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> String {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn validates_document_files() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_file(&dir, "a.pdf", b"%PDF-1.7\n...");
        let fake = write_file(&dir, "b.pdf", b"hello world");
        let txt = write_file(&dir, "c.txt", b"hello world");
        let tiny = write_file(&dir, "d.png", b"\x89P");

        assert!(validate_document_file(&pdf).unwrap().valid);
        assert!(!validate_document_file(&fake).unwrap().valid);
        assert!(!validate_document_file(&txt).unwrap().valid);
        assert!(!validate_document_file(&tiny).unwrap().valid);
        let missing = validate_document_file("/no/such/file.pdf").unwrap();
        assert_eq!(missing.error.as_deref(), Some("File not found."));
    }

    #[test]
    fn errors_carry_kind() {
        let state = state();
        let err = upload_document(&state, 1, "/no/such/file.pdf").unwrap_err();
        assert_eq!(err.kind, "validation");
        let err = get_status(&state, 99).unwrap_err();
        assert_eq!(err.kind, "not_found");
        assert!(!err.retryable);
    }

    #[test]
    fn upload_records_pending_document() {
        let state = state();
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_file(&dir, "invoice.pdf", b"%PDF-1.4\n");
        let user = create_user(
            &state,
            CreateUserPayload {
                username: "ana".into(),
                email: "ana@example.com".into(),
            },
        )
        .unwrap();
        let doc = upload_document(&state, user, &pdf).unwrap();
        assert_eq!(doc.original_filename, "invoice.pdf");
        assert_eq!(get_status(&state, doc.id).unwrap().status.as_str(), "PENDING");
        assert_eq!(upload_document(&state, 404, &pdf).unwrap_err().kind, "not_found");
        assert_eq!(get_extraction_status(&state), "not_configured");
    }

    #[test]
    fn new_users_get_the_opening_balance() {
        let state = state();
        let user = create_user(
            &state,
            CreateUserPayload {
                username: "ana".into(),
                email: "ana@example.com".into(),
            },
        )
        .unwrap();
        assert_eq!(get_credit_summary(&state, user).unwrap().current_balance, 5);
        let entry = add_credits(
            &state,
            AddCreditsPayload {
                user_id: user,
                amount: 10,
                description: None,
            },
        )
        .unwrap();
        assert_eq!(entry.balance_after, 15);
        assert_eq!(entry.description, "Manual credit addition");
        assert!(!check_credits(&state, user, 16).unwrap().sufficient);
        assert_eq!(get_credit_summary(&state, 404).unwrap_err().kind, "not_found");
    }

    #[test]
    fn vocabulary_lists_names_and_type_tags() {
        let vocab = list_field_vocabulary();
        assert!(vocab.field_names.contains(&"invoice_number"));
        assert!(vocab.field_types.contains(&"table"));
        assert_eq!(vocab.column_types.len(), DataType::ALL.len());
        for tag in vocab.field_types.iter().chain(&vocab.column_types) {
            assert!(tag.parse::<FieldType>().is_ok() || tag.parse::<DataType>().is_ok(), "{}", tag);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn read_failure_is_an_io_error() {
        // Reading /proc/self/mem at offset 0 fails with EIO.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem.pdf");
        std::os::unix::fs::symlink("/proc/self/mem", &path).unwrap();
        let err = validate_document_file(&path.to_string_lossy()).unwrap_err();
        assert_eq!(err.kind, "io");
    }
}
