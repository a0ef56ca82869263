//! Test doubles for the two external boundaries, plus template fixtures.
//!
//! Nothing here touches the network; use these to drive the ingestion engine
//! and the sink without an AI key or a ledger server.

use crate::error::AdapterError;
use crate::ocr::{parse_response, ExtractionOutput, ExtractionRequest, Extractor};
use crate::services::sink::{EnsureOutcome, LedgerConnector, VoucherPayload, VoucherReceipt};
use crate::types::{FieldPayload, SubFieldPayload, TemplatePayload};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// One scripted reply from [`MockExtractor`].
pub enum MockReply {
    /// Model text, run through the real response parser.
    Text(String),
    Fail(AdapterError),
}

/// Extractor returning canned model text.
///
/// Queued replies are consumed first, one per call; after that every call
/// gets the default response (`{}` unless set).
#[derive(Default)]
pub struct MockExtractor {
    default_response: RwLock<Option<String>>,
    queued: Mutex<VecDeque<MockReply>>,
    delay: Option<Duration>,
    calls: Arc<RwLock<Vec<ExtractionRequest>>>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        *self.default_response.write().unwrap_or_else(|p| p.into_inner()) = Some(text.into());
        self
    }

    pub fn then_respond(self, text: impl Into<String>) -> Self {
        self.push(MockReply::Text(text.into()));
        self
    }

    pub fn then_fail(self, err: AdapterError) -> Self {
        self.push(MockReply::Fail(err));
        self
    }

    /// Sleeps inside every call, to hold a document in PROCESSING.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues a reply on an extractor that is already shared.
    pub fn push(&self, reply: MockReply) {
        self.queued.lock().unwrap_or_else(|p| p.into_inner()).push_back(reply);
    }

    pub fn calls(&self) -> Vec<ExtractionRequest> {
        self.calls.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Extractor for MockExtractor {
    fn extract(&self, request: &ExtractionRequest) -> Result<ExtractionOutput, AdapterError> {
        self.calls
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let queued = self.queued.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
        match queued {
            Some(MockReply::Fail(err)) => Err(err),
            Some(MockReply::Text(text)) => Ok(parse_response(&text)),
            None => {
                let text = self
                    .default_response
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone()
                    .unwrap_or_else(|| "{}".to_string());
                Ok(parse_response(&text))
            }
        }
    }
}

/// Record of a call made to [`MockLedger`].
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerCall {
    Party { name: String, group: String },
    StockItem { name: String, unit: String },
    Voucher { party: String, items: usize },
}

/// In-memory ledger with create-if-missing masters.
#[derive(Default)]
pub struct MockLedger {
    parties: Mutex<HashSet<String>>,
    items: Mutex<HashSet<String>>,
    failing_items: HashSet<String>,
    fail_party: bool,
    fail_voucher: bool,
    posted: Mutex<Vec<VoucherPayload>>,
    calls: Arc<RwLock<Vec<LedgerCall>>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_existing_party(self, name: &str) -> Self {
        self.parties.lock().unwrap_or_else(|p| p.into_inner()).insert(name.to_string());
        self
    }

    pub fn with_existing_item(self, name: &str) -> Self {
        self.items.lock().unwrap_or_else(|p| p.into_inner()).insert(name.to_string());
        self
    }

    pub fn fail_item(mut self, name: &str) -> Self {
        self.failing_items.insert(name.to_string());
        self
    }

    pub fn fail_party(mut self) -> Self {
        self.fail_party = true;
        self
    }

    pub fn fail_voucher(mut self) -> Self {
        self.fail_voucher = true;
        self
    }

    pub fn posted(&self) -> Vec<VoucherPayload> {
        self.posted.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn calls(&self) -> Vec<LedgerCall> {
        self.calls.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn record(&self, call: LedgerCall) {
        self.calls.write().unwrap_or_else(|p| p.into_inner()).push(call);
    }
}

fn ensure(set: &Mutex<HashSet<String>>, name: &str) -> EnsureOutcome {
    if set.lock().unwrap_or_else(|p| p.into_inner()).insert(name.to_string()) {
        EnsureOutcome::Created
    } else {
        EnsureOutcome::AlreadyExists
    }
}

impl LedgerConnector for MockLedger {
    fn ensure_party_ledger(&self, name: &str, group: &str, _address: Option<&str>) -> Result<EnsureOutcome, AdapterError> {
        self.record(LedgerCall::Party {
            name: name.to_string(),
            group: group.to_string(),
        });
        if self.fail_party {
            return Err(AdapterError::Upstream {
                message: format!("group '{}' does not exist", group),
                retryable: false,
            });
        }
        Ok(ensure(&self.parties, name))
    }

    fn ensure_stock_item(&self, name: &str, unit: &str, _group: &str) -> Result<EnsureOutcome, AdapterError> {
        self.record(LedgerCall::StockItem {
            name: name.to_string(),
            unit: unit.to_string(),
        });
        if self.failing_items.contains(name) {
            return Err(AdapterError::Upstream {
                message: format!("stock item '{}' rejected", name),
                retryable: false,
            });
        }
        Ok(ensure(&self.items, name))
    }

    fn post_voucher(&self, voucher: &VoucherPayload) -> Result<VoucherReceipt, AdapterError> {
        self.record(LedgerCall::Voucher {
            party: voucher.party.clone(),
            items: voucher.items.len(),
        });
        if self.fail_voucher {
            return Err(AdapterError::Timeout(30));
        }
        let mut posted = self.posted.lock().unwrap_or_else(|p| p.into_inner());
        posted.push(voucher.clone());
        Ok(VoucherReceipt {
            voucher_number: voucher.voucher_number.clone(),
            external_id: Some(posted.len().to_string()),
            message: "voucher created".to_string(),
        })
    }
}

pub fn field(name: &str, field_type: &str) -> FieldPayload {
    FieldPayload {
        name: name.to_string(),
        field_type: field_type.to_string(),
        field_order: None,
        instructions: None,
        options: Vec::new(),
        sub_fields: Vec::new(),
    }
}

pub fn table_field(name: &str, columns: &[(&str, &str)]) -> FieldPayload {
    FieldPayload {
        sub_fields: columns
            .iter()
            .map(|(col, data_type)| SubFieldPayload {
                name: col.to_string(),
                data_type: data_type.to_string(),
                column_order: None,
                instructions: None,
                options: Vec::new(),
            })
            .collect(),
        ..field(name, "table")
    }
}

/// Header fields plus a four-column line item table.
pub fn invoice_template_payload() -> TemplatePayload {
    TemplatePayload {
        name: "Invoice".to_string(),
        instructions: Some("Amounts are in INR unless marked otherwise.".to_string()),
        fields: vec![
            field("invoice_number", "text"),
            field("invoice_date", "date"),
            field("vendor_name", "text"),
            field("total_amount", "currency"),
            table_field(
                "line_items",
                &[
                    ("item_description", "string"),
                    ("quantity", "float"),
                    ("unit_price", "currency"),
                    ("line_total", "currency"),
                ],
            ),
        ],
    }
}
