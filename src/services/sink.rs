//! Downstream push of a processed document into a ledger system as a
//! purchase voucher.
//!
//! Mapping ([`build_voucher`]) is pure. Submission ([`push_voucher`]) ensures
//! master data first: a failed party ledger aborts the push, a failed stock
//! item only drops that item from the voucher.

use crate::config::VoucherDefaults;
use crate::error::{AdapterError, IntakeError, Result};
use crate::models::{normalize_key, DocumentStatus};
use crate::services::ingestion::IngestionEngine;
use crate::types::{FieldValue, NormalizedResult, TableResult};
use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

const PARTY_PREFIXES: &[&str] = &["m/s.", "m/s", "messrs.", "messrs", "mrs.", "mr.", "ms."];

const DESCRIPTION_COLUMNS: &[&str] = &["item_description", "description", "item_name", "item"];
const QUANTITY_COLUMNS: &[&str] = &["quantity", "qty"];
const RATE_COLUMNS: &[&str] = &["unit_price", "rate", "price"];
const AMOUNT_COLUMNS: &[&str] = &["line_total", "amount", "total"];

const OUT_OF_RANGE: &str = "amount out of range";

#[derive(Debug, Clone, Serialize)]
pub struct DocumentMetadata {
    pub document_id: i64,
    pub original_filename: String,
    pub processed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoucherItem {
    pub row_index: i64,
    pub name: String,
    pub quantity: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
    pub unit: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoucherPayload {
    pub voucher_type: String,
    pub date: NaiveDate,
    pub voucher_number: Option<String>,
    pub reference: Option<String>,
    pub party: String,
    pub party_address: Option<String>,
    pub purchase_ledger: String,
    pub godown: String,
    pub batch: String,
    pub narration: String,
    pub items: Vec<VoucherItem>,
}

impl VoucherPayload {
    /// Sum of item amounts; `None` when it does not fit a `Decimal`.
    pub fn total(&self) -> Option<Decimal> {
        self.items.iter().try_fold(Decimal::ZERO, |acc, i| acc.checked_add(i.amount))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoucherReceipt {
    pub voucher_number: Option<String>,
    pub external_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Existing,
    Created,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_index: Option<i64>,
    pub name: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinkReport {
    pub success: bool,
    pub message: String,
    pub party: Option<ItemResult>,
    pub items: Vec<ItemResult>,
    pub voucher: Option<VoucherReceipt>,
}

/// Voucher ready to submit, plus rows that could not become items.
#[derive(Debug, Clone, Serialize)]
pub struct VoucherDraft {
    pub payload: VoucherPayload,
    pub skipped: Vec<ItemResult>,
}

/// Create-if-missing master data and voucher submission for a ledger system.
pub trait LedgerConnector: Send + Sync {
    fn ensure_party_ledger(&self, name: &str, group: &str, address: Option<&str>) -> std::result::Result<EnsureOutcome, AdapterError>;

    fn ensure_stock_item(&self, name: &str, unit: &str, group: &str) -> std::result::Result<EnsureOutcome, AdapterError>;

    fn post_voucher(&self, voucher: &VoucherPayload) -> std::result::Result<VoucherReceipt, AdapterError>;
}

/// Collapses whitespace and drops honorific prefixes such as `M/s`.
pub fn normalize_party_name(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let lower = collapsed.to_lowercase();
    for prefix in PARTY_PREFIXES {
        if lower.starts_with(prefix) {
            let rest = collapsed[prefix.len()..].trim_start_matches(['.', ' ']);
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }
    collapsed
}

fn text_field(result: &NormalizedResult, name: &str) -> Option<String> {
    result
        .field(name)
        .filter(|v| !v.is_null())
        .map(|v| v.to_string().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn cell<'a>(row: &'a IndexMap<String, FieldValue>, candidates: &[&str]) -> Option<&'a FieldValue> {
    candidates.iter().find_map(|c| {
        row.iter()
            .find(|(k, v)| normalize_key(k) == *c && !v.is_null())
            .map(|(_, v)| v)
    })
}

/// The table named like `*item*`, else the first table.
fn item_table(result: &NormalizedResult) -> Option<(&String, &TableResult)> {
    result
        .tables
        .iter()
        .find(|(name, _)| normalize_key(name).contains("item"))
        .or_else(|| result.tables.iter().next())
}

/// Maps a normalized result onto a purchase voucher.
pub fn build_voucher(
    result: &NormalizedResult,
    meta: &DocumentMetadata,
    defaults: &VoucherDefaults,
) -> Result<VoucherDraft> {
    let party = text_field(result, "vendor_name")
        .map(|p| normalize_party_name(&p))
        .filter(|p| !p.is_empty())
        .ok_or_else(|| IntakeError::Validation("vendor_name is required to post a voucher".to_string()))?;
    let invoice_number = text_field(result, "invoice_number");
    let date = result
        .field("invoice_date")
        .and_then(|v| v.as_date())
        .or_else(|| {
            meta.processed_at
                .as_deref()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|dt| dt.date_naive())
        })
        .unwrap_or_else(|| Utc::now().date_naive());

    let mut items = Vec::new();
    let mut skipped = Vec::new();
    let mut running_total = Decimal::ZERO;
    if let Some((_, table)) = item_table(result) {
        for (idx, row) in table.rows.iter().enumerate() {
            let row_index = idx as i64;
            let skip = |name: String, reason: &str| ItemResult {
                row_index: Some(row_index),
                name,
                status: ItemStatus::Skipped,
                message: Some(reason.to_string()),
            };
            let Some(name) = cell(row, DESCRIPTION_COLUMNS)
                .map(|v| v.to_string().split_whitespace().collect::<Vec<_>>().join(" "))
                .filter(|s| !s.is_empty())
            else {
                skipped.push(skip(String::new(), "missing item description"));
                continue;
            };
            let quantity = match cell(row, QUANTITY_COLUMNS) {
                None => Decimal::ONE,
                Some(v) => match v.as_decimal() {
                    Some(q) => q,
                    None => {
                        skipped.push(skip(name, "quantity is not a number"));
                        continue;
                    }
                },
            };
            let rate = match cell(row, RATE_COLUMNS) {
                None => Decimal::ZERO,
                Some(v) => match v.as_decimal() {
                    Some(r) => r,
                    None => {
                        skipped.push(skip(name, "unit price is not a number"));
                        continue;
                    }
                },
            };
            let line_total = cell(row, AMOUNT_COLUMNS).and_then(|v| v.as_decimal());
            let amount = match line_total {
                Some(t) if t > Decimal::ZERO => Some(t),
                _ => quantity.checked_mul(rate),
            };
            let Some(amount) = amount else {
                skipped.push(skip(name, OUT_OF_RANGE));
                continue;
            };
            if amount <= Decimal::ZERO {
                skipped.push(skip(name, "no positive amount"));
                continue;
            }
            let rate = if rate > Decimal::ZERO || quantity.is_zero() {
                Some(rate)
            } else {
                amount.checked_div(quantity).map(|r| r.round_dp(2))
            };
            let amount = amount.round_dp(2);
            let (Some(rate), Some(total)) = (rate, running_total.checked_add(amount)) else {
                skipped.push(skip(name, OUT_OF_RANGE));
                continue;
            };
            running_total = total;
            items.push(VoucherItem {
                row_index,
                name,
                quantity,
                rate,
                amount,
                unit: defaults.unit.clone(),
            });
        }
    }

    let narration = match &invoice_number {
        Some(n) => format!("Invoice {} ({})", n, meta.original_filename),
        None => format!("Imported from {}", meta.original_filename),
    };
    Ok(VoucherDraft {
        payload: VoucherPayload {
            voucher_type: "Purchase".to_string(),
            date,
            voucher_number: invoice_number.clone(),
            reference: invoice_number,
            party,
            party_address: text_field(result, "vendor_address"),
            purchase_ledger: defaults.purchase_ledger.clone(),
            godown: defaults.godown.clone(),
            batch: defaults.batch.clone(),
            narration,
            items,
        },
        skipped,
    })
}

fn ensure_status(outcome: &std::result::Result<EnsureOutcome, AdapterError>) -> (ItemStatus, Option<String>) {
    match outcome {
        Ok(EnsureOutcome::Created) => (ItemStatus::Created, None),
        Ok(EnsureOutcome::AlreadyExists) => (ItemStatus::Existing, None),
        Err(e) => (ItemStatus::Failed, Some(e.to_string())),
    }
}

/// Ensures master data and posts the voucher with every item that survived.
pub fn push_voucher(connector: &dyn LedgerConnector, draft: VoucherDraft, defaults: &VoucherDefaults) -> SinkReport {
    let VoucherDraft { mut payload, skipped } = draft;

    let party_outcome = connector.ensure_party_ledger(&payload.party, &defaults.supplier_group, payload.party_address.as_deref());
    let (status, message) = ensure_status(&party_outcome);
    let party = ItemResult {
        row_index: None,
        name: payload.party.clone(),
        status,
        message: message.clone(),
    };
    if status == ItemStatus::Failed {
        warn!(party = %payload.party, "party ledger could not be ensured");
        return SinkReport {
            success: false,
            message: format!("party ledger '{}' failed: {}", payload.party, message.unwrap_or_default()),
            party: Some(party),
            items: skipped,
            voucher: None,
        };
    }

    let mut results = Vec::with_capacity(payload.items.len() + skipped.len());
    let mut kept = Vec::with_capacity(payload.items.len());
    for item in payload.items.drain(..) {
        let outcome = connector.ensure_stock_item(&item.name, &item.unit, &defaults.stock_group);
        let (status, message) = ensure_status(&outcome);
        if status == ItemStatus::Failed {
            warn!(item = %item.name, error = message.as_deref().unwrap_or(""), "stock item could not be ensured");
        }
        results.push(ItemResult {
            row_index: Some(item.row_index),
            name: item.name.clone(),
            status,
            message,
        });
        if status != ItemStatus::Failed {
            kept.push(item);
        }
    }
    results.extend(skipped);
    results.sort_by_key(|r| r.row_index);
    payload.items = kept;

    if payload.items.is_empty() {
        return SinkReport {
            success: false,
            message: "no line items could be posted".to_string(),
            party: Some(party),
            items: results,
            voucher: None,
        };
    }

    match connector.post_voucher(&payload) {
        Ok(receipt) => {
            let failed = results.iter().filter(|r| r.status != ItemStatus::Existing && r.status != ItemStatus::Created).count();
            info!(party = %payload.party, items = payload.items.len(), total = %payload.total().unwrap_or_default(), "voucher posted");
            SinkReport {
                success: true,
                message: if failed == 0 {
                    format!("voucher posted with {} item(s)", payload.items.len())
                } else {
                    format!("voucher posted with {} item(s); {} row(s) left out", payload.items.len(), failed)
                },
                party: Some(party),
                items: results,
                voucher: Some(receipt),
            }
        }
        Err(e) => SinkReport {
            success: false,
            message: format!("voucher was not posted: {}", e),
            party: Some(party),
            items: results,
            voucher: None,
        },
    }
}

/// Pushes processed documents through a [`LedgerConnector`].
pub struct SinkService {
    engine: Arc<IngestionEngine>,
    connector: Arc<dyn LedgerConnector>,
    defaults: VoucherDefaults,
}

impl SinkService {
    pub fn new(engine: Arc<IngestionEngine>, connector: Arc<dyn LedgerConnector>, defaults: VoucherDefaults) -> Self {
        Self {
            engine,
            connector,
            defaults,
        }
    }

    /// The voucher that [`push_document`](Self::push_document) would submit.
    pub fn preview(&self, document_id: i64) -> Result<VoucherDraft> {
        let results = self.engine.results(document_id)?;
        if results.document.status != DocumentStatus::Processed {
            return Err(IntakeError::State(format!(
                "document {} is {}; only processed documents can be pushed",
                document_id, results.document.status
            )));
        }
        let meta = DocumentMetadata {
            document_id,
            original_filename: results.document.original_filename.clone(),
            processed_at: results.document.processed_at.clone(),
        };
        build_voucher(&results.result, &meta, &self.defaults)
    }

    pub fn push_document(&self, document_id: i64) -> Result<SinkReport> {
        let draft = self.preview(document_id)?;
        let report = push_voucher(self.connector.as_ref(), draft, &self.defaults);
        info!(document_id, success = report.success, "sink push finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLedger;
    use crate::types::TableColumn;
    use crate::models::DataType;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn row(pairs: &[(&str, FieldValue)]) -> IndexMap<String, FieldValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn result() -> NormalizedResult {
        let mut fields = IndexMap::new();
        fields.insert("invoice_number".to_string(), FieldValue::Text("INV-7".into()));
        fields.insert("invoice_date".to_string(), FieldValue::Date(NaiveDate::from_ymd_opt(2025, 8, 27).unwrap()));
        fields.insert("vendor_name".to_string(), FieldValue::Text("M/s.  Acme   Traders".into()));
        let rows = vec![
            row(&[
                ("item_description", FieldValue::Text("Bolt".into())),
                ("quantity", FieldValue::Integer(4)),
                ("unit_price", FieldValue::Decimal(dec("2.50"))),
                ("line_total", FieldValue::Null),
            ]),
            row(&[
                ("item_description", FieldValue::Text("Nut".into())),
                ("quantity", FieldValue::Integer(10)),
                ("unit_price", FieldValue::Decimal(dec("1"))),
                ("line_total", FieldValue::Decimal(dec("9.00"))),
            ]),
            row(&[("item_description", FieldValue::Null), ("quantity", FieldValue::Integer(1))]),
            row(&[
                ("item_description", FieldValue::Text("Washer".into())),
                ("quantity", FieldValue::Raw("lots".into())),
            ]),
        ];
        let mut tables = IndexMap::new();
        tables.insert(
            "line_items".to_string(),
            TableResult {
                field_id: 9,
                columns: vec![TableColumn { name: "item_description".into(), data_type: DataType::String, sub_field_id: 1 }],
                row_count: rows.len(),
                rows,
            },
        );
        NormalizedResult { document_id: 1, template_id: 1, fields, tables, errors: vec![] }
    }

    fn meta() -> DocumentMetadata {
        DocumentMetadata { document_id: 1, original_filename: "inv.pdf".into(), processed_at: None }
    }

    #[test]
    fn party_names_lose_honorifics() {
        assert_eq!(normalize_party_name("M/s.  Acme   Traders"), "Acme Traders");
        assert_eq!(normalize_party_name("M/S Globex Pvt Ltd"), "Globex Pvt Ltd");
        assert_eq!(normalize_party_name("Mr. Sharma"), "Sharma");
        assert_eq!(normalize_party_name("Msquare Labs"), "Msquare Labs");
    }

    #[test]
    fn builds_items_in_decimal() {
        let draft = build_voucher(&result(), &meta(), &VoucherDefaults::default()).unwrap();
        let v = &draft.payload;
        assert_eq!(v.party, "Acme Traders");
        assert_eq!(v.voucher_number.as_deref(), Some("INV-7"));
        assert_eq!(v.date, NaiveDate::from_ymd_opt(2025, 8, 27).unwrap());
        assert_eq!(v.items.len(), 2);
        assert_eq!(v.items[0].amount, dec("10.00"));
        assert_eq!(v.items[1].amount, dec("9.00"));
        assert_eq!(v.total(), Some(dec("19.00")));
        let skipped: Vec<_> = draft.skipped.iter().map(|s| s.row_index).collect();
        assert_eq!(skipped, vec![Some(2), Some(3)]);
    }

    #[test]
    fn vendor_is_required() {
        let mut r = result();
        r.fields.shift_remove("vendor_name");
        assert!(matches!(
            build_voucher(&r, &meta(), &VoucherDefaults::default()),
            Err(IntakeError::Validation(_))
        ));
    }

    #[test]
    fn failed_item_is_dropped_not_fatal() {
        let ledger = MockLedger::new().with_existing_item("Bolt").fail_item("Nut");
        let draft = build_voucher(&result(), &meta(), &VoucherDefaults::default()).unwrap();
        let report = push_voucher(&ledger, draft, &VoucherDefaults::default());
        assert!(report.success, "{}", report.message);
        let statuses: Vec<_> = report.items.iter().map(|i| (i.name.clone(), i.status)).collect();
        assert_eq!(statuses[0], ("Bolt".to_string(), ItemStatus::Existing));
        assert_eq!(statuses[1], ("Nut".to_string(), ItemStatus::Failed));
        assert_eq!(report.items.len(), 4);
        let posted = ledger.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].items.len(), 1);
        assert_eq!(posted[0].total(), Some(dec("10.00")));
    }

    #[test]
    fn oversized_amounts_are_skipped() {
        let mut r = result();
        let table = r.tables.get_mut("line_items").unwrap();
        table.rows.push(row(&[
            ("item_description", FieldValue::Text("Crane".into())),
            ("quantity", FieldValue::Float(1e20)),
            ("unit_price", FieldValue::Decimal(dec("99999999999999999999"))),
        ]));
        table.rows.push(row(&[
            ("item_description", FieldValue::Text("Barge".into())),
            ("line_total", FieldValue::Decimal(Decimal::MAX)),
        ]));
        table.row_count = table.rows.len();

        let draft = build_voucher(&r, &meta(), &VoucherDefaults::default()).unwrap();
        assert_eq!(draft.payload.items.len(), 2);
        assert_eq!(draft.payload.total(), Some(dec("19.00")));
        let crane = draft.skipped.iter().find(|s| s.name == "Crane").unwrap();
        assert_eq!(crane.message.as_deref(), Some("amount out of range"));
        let barge = draft.skipped.iter().find(|s| s.name == "Barge").unwrap();
        assert_eq!(barge.status, ItemStatus::Skipped);
        assert_eq!(barge.message.as_deref(), Some("amount out of range"));
    }

    #[test]
    fn failed_party_is_total() {
        let ledger = MockLedger::new().fail_party();
        let draft = build_voucher(&result(), &meta(), &VoucherDefaults::default()).unwrap();
        let report = push_voucher(&ledger, draft, &VoucherDefaults::default());
        assert!(!report.success);
        assert_eq!(report.party.map(|p| p.status), Some(ItemStatus::Failed));
        assert!(ledger.posted().is_empty());
    }
}
