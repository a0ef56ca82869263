//! Extraction adapter: one AI call per document, loosely-typed output.
//!
//! The [`Extractor`] trait is the seam the ingestion engine depends on.
//! [`GeminiExtractor`] is the production implementation; tests use
//! [`crate::testing::MockExtractor`].

use crate::config::GeminiConfig;
use crate::error::AdapterError;
use crate::models::{normalize_key, TemplateSchema};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use indexmap::IndexMap;
use regex::Regex;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Key under which unparseable model output is returned.
pub const RAW_RESPONSE_KEY: &str = "raw_response";

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionColumn {
    pub name: String,
    pub type_hint: String,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum FieldShape {
    Scalar,
    Table { columns: Vec<ExtractionColumn> },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionField {
    pub name: String,
    pub type_hint: String,
    pub instructions: Option<String>,
    #[serde(flatten)]
    pub shape: FieldShape,
}

/// Everything the adapter needs for one call, in template declared order.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRequest {
    pub file_path: PathBuf,
    pub instructions: Option<String>,
    pub fields: Vec<ExtractionField>,
}

impl ExtractionRequest {
    pub fn from_schema(file_path: impl Into<PathBuf>, schema: &TemplateSchema) -> Self {
        let fields = schema
            .fields
            .iter()
            .map(|f| ExtractionField {
                name: f.name.to_string(),
                type_hint: f.field_type.as_str().to_string(),
                instructions: f.instructions.clone(),
                shape: if f.is_table() {
                    FieldShape::Table {
                        columns: f
                            .sub_fields
                            .iter()
                            .map(|s| ExtractionColumn {
                                name: s.name.clone(),
                                type_hint: s.data_type.as_str().to_string(),
                                instructions: s.instructions.clone(),
                            })
                            .collect(),
                    }
                } else {
                    FieldShape::Scalar
                },
            })
            .collect();
        ExtractionRequest {
            file_path: file_path.into(),
            instructions: schema.template.instructions.clone(),
            fields,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawScalar {
    pub value: Option<String>,
    pub confidence: Option<f64>,
}

impl RawScalar {
    pub fn new(value: impl Into<String>) -> Self {
        RawScalar {
            value: Some(value.into()),
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawField {
    Scalar(RawScalar),
    Table(Vec<IndexMap<String, RawScalar>>),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionOutput {
    pub fields: IndexMap<String, RawField>,
    /// Set when the model output could not be parsed into fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ExtractionOutput {
    pub fn fallback(text: &str) -> Self {
        let mut fields = IndexMap::new();
        fields.insert(RAW_RESPONSE_KEY.to_string(), RawField::Scalar(RawScalar::new(text)));
        ExtractionOutput {
            fields,
            raw_response: Some(text.to_string()),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.raw_response.is_some()
    }

    /// Looks a field up by normalized name, so `TotalAmount` finds `total_amount`.
    pub fn get(&self, name: &str) -> Option<&RawField> {
        if let Some(v) = self.fields.get(name) {
            return Some(v);
        }
        let key = normalize_key(name);
        self.fields
            .iter()
            .find(|(k, _)| normalize_key(k) == key)
            .map(|(_, v)| v)
    }
}

pub trait Extractor: Send + Sync {
    fn extract(&self, request: &ExtractionRequest) -> Result<ExtractionOutput, AdapterError>;
}

/// MIME type for a supported document, or `UnsupportedFileType`.
pub fn mime_type_for(path: &Path) -> Result<&'static str, AdapterError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => Ok("application/pdf"),
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "png" => Ok("image/png"),
        "webp" => Ok("image/webp"),
        "heic" => Ok("image/heic"),
        "heif" => Ok("image/heif"),
        "" => Err(AdapterError::UnsupportedFileType("(no extension)".to_string())),
        other => Err(AdapterError::UnsupportedFileType(other.to_string())),
    }
}

/// Single prompt covering every field and table column.
pub fn build_prompt(request: &ExtractionRequest) -> String {
    let mut prompt = String::from(
        "Extract the following fields from the attached document and answer with one JSON object only.\n",
    );
    if let Some(instr) = request.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\nGeneral instructions: ");
        prompt.push_str(instr.trim());
        prompt.push('\n');
    }
    prompt.push_str("\nFields:\n");
    for field in &request.fields {
        match &field.shape {
            FieldShape::Scalar => {
                prompt.push_str(&format!("- \"{}\" ({})", field.name, field.type_hint));
            }
            FieldShape::Table { columns } => {
                let cols = columns
                    .iter()
                    .map(|c| format!("\"{}\" ({})", c.name, c.type_hint))
                    .collect::<Vec<_>>()
                    .join(", ");
                prompt.push_str(&format!(
                    "- \"{}\" (table): an array of row objects with keys {}",
                    field.name, cols
                ));
            }
        }
        if let Some(instr) = field.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
            prompt.push_str(&format!(". {}", instr.trim()));
        }
        prompt.push('\n');
        if let FieldShape::Table { columns } = &field.shape {
            for col in columns {
                if let Some(instr) = col.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
                    prompt.push_str(&format!("    - \"{}\": {}\n", col.name, instr.trim()));
                }
            }
        }
    }
    prompt.push_str(
        "\nUse exactly these keys. Use null for values that are not present. \
         Copy values as printed; do not reformat dates or amounts.\n",
    );
    prompt
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("trailing comma regex"))
}

/// Parses model output into fields. Never fails: anything that is not a JSON
/// object (after stripping fences and prose, and dropping trailing commas)
/// comes back via [`ExtractionOutput::fallback`].
pub fn parse_response(text: &str) -> ExtractionOutput {
    let candidate = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => return ExtractionOutput::fallback(text),
    };
    let parsed = serde_json::from_str::<Value>(candidate).or_else(|_| {
        let repaired = trailing_comma_re().replace_all(candidate, "$1");
        serde_json::from_str::<Value>(&repaired)
    });
    let object = match parsed {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!(len = text.len(), "extraction response is not a JSON object");
            return ExtractionOutput::fallback(text);
        }
    };
    let fields = object
        .into_iter()
        .map(|(key, value)| (key, raw_field(value)))
        .collect();
    ExtractionOutput {
        fields,
        raw_response: None,
    }
}

fn raw_field(value: Value) -> RawField {
    match value {
        Value::Array(rows) => RawField::Table(rows.into_iter().map(raw_row).collect()),
        Value::Object(mut map) => {
            if let Some(Value::Array(_)) = map.get("rows") {
                if let Some(Value::Array(rows)) = map.remove("rows") {
                    return RawField::Table(rows.into_iter().map(raw_row).collect());
                }
            }
            RawField::Scalar(raw_scalar(Value::Object(map)))
        }
        other => RawField::Scalar(raw_scalar(other)),
    }
}

/// Non-object rows become empty rows so later row indexes do not shift.
fn raw_row(value: Value) -> IndexMap<String, RawScalar> {
    match value {
        Value::Object(map) => map.into_iter().map(|(k, v)| (k, raw_scalar(v))).collect(),
        _ => IndexMap::new(),
    }
}

fn raw_scalar(value: Value) -> RawScalar {
    match value {
        Value::Null => RawScalar::default(),
        Value::String(s) => RawScalar::new(s),
        Value::Number(n) => RawScalar::new(n.to_string()),
        Value::Bool(b) => RawScalar::new(b.to_string()),
        Value::Object(map) if map.contains_key("value") => {
            let confidence = map.get("confidence").and_then(|c| c.as_f64());
            let mut inner = map.get("value").cloned().map(raw_scalar).unwrap_or_default();
            if let Some(c) = confidence {
                inner = inner.with_confidence(c);
            }
            inner
        }
        other => RawScalar::new(other.to_string()),
    }
}

/// Gemini `generateContent` with the document inline.
pub struct GeminiExtractor {
    config: GeminiConfig,
    client: Client,
}

impl GeminiExtractor {
    pub fn new(config: GeminiConfig) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AdapterError::Upstream {
                message: format!("could not build HTTP client: {}", e),
                retryable: false,
            })?;
        Ok(Self { config, client })
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.config.endpoint, self.config.model)
    }
}

impl Extractor for GeminiExtractor {
    fn extract(&self, request: &ExtractionRequest) -> Result<ExtractionOutput, AdapterError> {
        let mime = mime_type_for(&request.file_path)?;
        let key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(AdapterError::MissingCredentials("GEMINI_API_KEY"))?;
        let bytes = fs::read(&request.file_path)?;

        let prompt = build_prompt(request);
        debug!(prompt_len = prompt.len(), bytes = bytes.len(), mime, "calling extraction model");
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": mime, "data": BASE64.encode(&bytes) } }
                ]
            }],
            "generationConfig": {
                "temperature": 0.1,
                "responseMimeType": "application/json"
            }
        });

        let timeout_secs = self.config.timeout.as_secs();
        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .map_err(|e| AdapterError::from_transport(e, timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(AdapterError::from_status(status, &text));
        }
        let payload: Value = response
            .json()
            .map_err(|e| AdapterError::Malformed(format!("invalid JSON from model API: {}", e)))?;

        let text = response_text(&payload)
            .ok_or_else(|| AdapterError::Malformed("model returned no text candidates".to_string()))?;
        info!(
            file = %request.file_path.display(),
            response_len = text.len(),
            "extraction model responded"
        );
        Ok(parse_response(&text))
    }
}

fn response_text(payload: &Value) -> Option<String> {
    let parts = payload
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(path: &str) -> ExtractionRequest {
        ExtractionRequest {
            file_path: PathBuf::from(path),
            instructions: Some("Amounts are in INR.".into()),
            fields: vec![
                ExtractionField {
                    name: "invoice_number".into(),
                    type_hint: "text".into(),
                    instructions: Some("Top right corner".into()),
                    shape: FieldShape::Scalar,
                },
                ExtractionField {
                    name: "line_items".into(),
                    type_hint: "table".into(),
                    instructions: None,
                    shape: FieldShape::Table {
                        columns: vec![ExtractionColumn {
                            name: "quantity".into(),
                            type_hint: "integer".into(),
                            instructions: Some("Units only".into()),
                        }],
                    },
                },
            ],
        }
    }

    #[test]
    fn parses_fenced_json_with_tables_and_confidence() {
        let text = "Here you go:\n```json\n{\"InvoiceNumber\": {\"value\": \"INV-001\", \"confidence\": 0.93}, \
                    \"total\": 1234.5, \"paid\": false, \"due_date\": null, \
                    \"line_items\": {\"rows\": [{\"quantity\": 2}, \"junk\", {\"quantity\": \"3\"}]}}\n```";
        let out = parse_response(text);
        assert!(!out.is_fallback());
        assert_eq!(
            out.get("invoice_number"),
            Some(&RawField::Scalar(RawScalar::new("INV-001").with_confidence(0.93)))
        );
        assert_eq!(out.get("total"), Some(&RawField::Scalar(RawScalar::new("1234.5"))));
        assert_eq!(out.get("paid"), Some(&RawField::Scalar(RawScalar::new("false"))));
        assert_eq!(out.get("due_date"), Some(&RawField::Scalar(RawScalar::default())));
        match out.get("line_items") {
            Some(RawField::Table(rows)) => {
                assert_eq!(rows.len(), 3);
                assert!(rows[1].is_empty());
                assert_eq!(rows[2]["quantity"], RawScalar::new("3"));
            }
            other => panic!("expected table, got {:?}", other),
        }
    }

    #[test]
    fn repairs_trailing_commas() {
        let out = parse_response("{\"a\": \"1\", \"rows\": [{\"x\": 1,},],}");
        assert!(!out.is_fallback());
        assert!(matches!(out.get("rows"), Some(RawField::Table(rows)) if rows.len() == 1));
    }

    #[test]
    fn unparseable_text_falls_back_to_raw_response() {
        for text in ["I could not read this document.", "{not json at all}", "[1, 2]"] {
            let out = parse_response(text);
            assert!(out.is_fallback(), "{}", text);
            assert_eq!(out.get(RAW_RESPONSE_KEY), Some(&RawField::Scalar(RawScalar::new(text))));
        }
    }

    #[test]
    fn prompt_lists_fields_columns_and_instructions() {
        let prompt = build_prompt(&request("/tmp/a.pdf"));
        assert!(prompt.contains("Amounts are in INR."));
        assert!(prompt.contains("\"invoice_number\" (text). Top right corner"));
        assert!(prompt.contains("\"line_items\" (table)"));
        assert!(prompt.contains("\"quantity\" (integer)"));
        assert!(prompt.contains("\"quantity\": Units only"));
    }

    #[test]
    fn mime_types() {
        assert_eq!(mime_type_for(Path::new("a.PDF")).unwrap(), "application/pdf");
        assert_eq!(mime_type_for(Path::new("scan.jpeg")).unwrap(), "image/jpeg");
        assert!(matches!(mime_type_for(Path::new("a.docx")), Err(AdapterError::UnsupportedFileType(_))));
        assert!(matches!(mime_type_for(Path::new("README")), Err(AdapterError::UnsupportedFileType(_))));
    }

    #[test]
    fn gemini_fails_fast_before_network() {
        let config = GeminiConfig {
            api_key: None,
            model: "gemini-2.0-flash".into(),
            endpoint: "http://127.0.0.1:9".into(),
            timeout: Duration::from_secs(1),
        };
        let extractor = GeminiExtractor::new(config).unwrap();
        let err = extractor.extract(&request("/tmp/a.txt")).unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedFileType(_)));
        let err = extractor.extract(&request("/tmp/a.pdf")).unwrap_err();
        assert!(matches!(err, AdapterError::MissingCredentials("GEMINI_API_KEY")));
        assert!(!err.is_retryable());
    }

    #[test]
    fn candidate_text_is_joined() {
        let payload = json!({"candidates": [{"content": {"parts": [{"text": "{\"a\":"}, {"text": "1}"}]}}]});
        assert_eq!(response_text(&payload).as_deref(), Some("{\"a\":1}"));
        assert!(response_text(&json!({"candidates": []})).is_none());
    }
}
