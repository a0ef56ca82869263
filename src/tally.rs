//! Tally-style accounting server over its XML import interface.
//!
//! Every call is one `Import Data` envelope POSTed to the server; the reply is
//! a `<RESPONSE>` block of counters plus optional `<LINEERROR>` lines.

use crate::config::TallyConfig;
use crate::error::AdapterError;
use crate::services::sink::{EnsureOutcome, LedgerConnector, VoucherPayload, VoucherReceipt};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use reqwest::blocking::Client;
use rust_decimal::Decimal;
use tracing::{debug, info};

const MASTERS_REPORT: &str = "All Masters";
const VOUCHERS_REPORT: &str = "Vouchers";

/// Counters and messages from a `<RESPONSE>` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportResponse {
    pub created: u32,
    pub altered: u32,
    pub errors: u32,
    pub line_errors: Vec<String>,
    pub last_voucher_id: Option<String>,
}

impl ImportResponse {
    fn already_exists(&self) -> bool {
        self.line_errors
            .iter()
            .any(|e| e.to_lowercase().contains("already exists"))
    }

    fn error_message(&self) -> String {
        if self.line_errors.is_empty() {
            format!("{} error(s) reported by the ledger server", self.errors)
        } else {
            self.line_errors.join("; ")
        }
    }
}

fn render_err(e: impl std::fmt::Display) -> AdapterError {
    AdapterError::Malformed(format!("could not render request: {}", e))
}

struct XmlBuilder {
    writer: Writer<Vec<u8>>,
}

impl XmlBuilder {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn open(&mut self, tag: &str, attrs: &[(&str, &str)]) -> Result<(), AdapterError> {
        let start = BytesStart::new(tag).with_attributes(attrs.iter().copied());
        self.writer.write_event(Event::Start(start)).map_err(render_err)
    }

    fn close(&mut self, tag: &str) -> Result<(), AdapterError> {
        self.writer.write_event(Event::End(BytesEnd::new(tag))).map_err(render_err)
    }

    fn leaf(&mut self, tag: &str, text: &str) -> Result<(), AdapterError> {
        self.open(tag, &[])?;
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(render_err)?;
        self.close(tag)
    }

    fn finish(self) -> Result<String, AdapterError> {
        String::from_utf8(self.writer.into_inner()).map_err(render_err)
    }
}

/// Writes the import envelope around whatever `message` puts in `<TALLYMESSAGE>`.
fn envelope<F>(report: &str, company: Option<&str>, message: F) -> Result<String, AdapterError>
where
    F: FnOnce(&mut XmlBuilder) -> Result<(), AdapterError>,
{
    let mut xml = XmlBuilder::new();
    xml.open("ENVELOPE", &[])?;
    xml.open("HEADER", &[])?;
    xml.leaf("TALLYREQUEST", "Import Data")?;
    xml.close("HEADER")?;
    xml.open("BODY", &[])?;
    xml.open("IMPORTDATA", &[])?;
    xml.open("REQUESTDESC", &[])?;
    xml.leaf("REPORTNAME", report)?;
    if let Some(company) = company {
        xml.open("STATICVARIABLES", &[])?;
        xml.leaf("SVCURRENTCOMPANY", company)?;
        xml.close("STATICVARIABLES")?;
    }
    xml.close("REQUESTDESC")?;
    xml.open("REQUESTDATA", &[])?;
    xml.open("TALLYMESSAGE", &[("xmlns:UDF", "TallyUDF")])?;
    message(&mut xml)?;
    xml.close("TALLYMESSAGE")?;
    xml.close("REQUESTDATA")?;
    xml.close("IMPORTDATA")?;
    xml.close("BODY")?;
    xml.close("ENVELOPE")?;
    xml.finish()
}

pub fn ledger_request(company: Option<&str>, name: &str, group: &str, address: Option<&str>) -> Result<String, AdapterError> {
    envelope(MASTERS_REPORT, company, |xml| {
        xml.open("LEDGER", &[("NAME", name), ("ACTION", "Create")])?;
        xml.leaf("NAME", name)?;
        xml.leaf("PARENT", group)?;
        if let Some(address) = address {
            xml.open("ADDRESS.LIST", &[("TYPE", "String")])?;
            for line in address.lines().map(str::trim).filter(|l| !l.is_empty()) {
                xml.leaf("ADDRESS", line)?;
            }
            xml.close("ADDRESS.LIST")?;
        }
        xml.leaf("ISBILLWISEON", "Yes")?;
        xml.close("LEDGER")
    })
}

pub fn stock_item_request(company: Option<&str>, name: &str, unit: &str, group: &str) -> Result<String, AdapterError> {
    envelope(MASTERS_REPORT, company, |xml| {
        xml.open("STOCKITEM", &[("NAME", name), ("ACTION", "Create")])?;
        xml.leaf("NAME", name)?;
        xml.leaf("PARENT", group)?;
        xml.leaf("BASEUNITS", unit)?;
        xml.close("STOCKITEM")
    })
}

fn qty(quantity: Decimal, unit: &str) -> String {
    format!("{} {}", quantity.normalize(), unit)
}

/// Purchase voucher: party credited with the total, each item debited
/// through the purchase ledger.
pub fn voucher_request(company: Option<&str>, voucher: &VoucherPayload) -> Result<String, AdapterError> {
    let date = voucher.date.format("%Y%m%d").to_string();
    let total = voucher
        .total()
        .ok_or_else(|| AdapterError::Malformed("voucher total out of range".to_string()))?;
    envelope(VOUCHERS_REPORT, company, |xml| {
        xml.open(
            "VOUCHER",
            &[
                ("VCHTYPE", voucher.voucher_type.as_str()),
                ("ACTION", "Create"),
                ("OBJVIEW", "Invoice Voucher View"),
            ],
        )?;
        xml.leaf("DATE", &date)?;
        xml.leaf("VOUCHERTYPENAME", &voucher.voucher_type)?;
        if let Some(number) = &voucher.voucher_number {
            xml.leaf("VOUCHERNUMBER", number)?;
        }
        if let Some(reference) = &voucher.reference {
            xml.leaf("REFERENCE", reference)?;
        }
        xml.leaf("PARTYLEDGERNAME", &voucher.party)?;
        xml.leaf("NARRATION", &voucher.narration)?;
        xml.leaf("ISINVOICE", "Yes")?;

        xml.open("LEDGERENTRIES.LIST", &[])?;
        xml.leaf("LEDGERNAME", &voucher.party)?;
        xml.leaf("ISDEEMEDPOSITIVE", "No")?;
        xml.leaf("ISPARTYLEDGER", "Yes")?;
        xml.leaf("AMOUNT", &total.to_string())?;
        xml.close("LEDGERENTRIES.LIST")?;

        for item in &voucher.items {
            let amount = (-item.amount).to_string();
            let quantity = qty(item.quantity, &item.unit);
            xml.open("ALLINVENTORYENTRIES.LIST", &[])?;
            xml.leaf("STOCKITEMNAME", &item.name)?;
            xml.leaf("ISDEEMEDPOSITIVE", "Yes")?;
            xml.leaf("RATE", &format!("{}/{}", item.rate.normalize(), item.unit))?;
            xml.leaf("AMOUNT", &amount)?;
            xml.leaf("ACTUALQTY", &quantity)?;
            xml.leaf("BILLEDQTY", &quantity)?;
            xml.open("BATCHALLOCATIONS.LIST", &[])?;
            xml.leaf("GODOWNNAME", &voucher.godown)?;
            xml.leaf("BATCHNAME", &voucher.batch)?;
            xml.leaf("AMOUNT", &amount)?;
            xml.leaf("ACTUALQTY", &quantity)?;
            xml.leaf("BILLEDQTY", &quantity)?;
            xml.close("BATCHALLOCATIONS.LIST")?;
            xml.open("ACCOUNTINGALLOCATIONS.LIST", &[])?;
            xml.leaf("LEDGERNAME", &voucher.purchase_ledger)?;
            xml.leaf("ISDEEMEDPOSITIVE", "Yes")?;
            xml.leaf("AMOUNT", &amount)?;
            xml.close("ACCOUNTINGALLOCATIONS.LIST")?;
            xml.close("ALLINVENTORYENTRIES.LIST")?;
        }
        xml.close("VOUCHER")
    })
}

/// Reads the counters out of a server reply. Unknown elements are ignored.
pub fn parse_import_response(xml: &str) -> Result<ImportResponse, AdapterError> {
    let mut reader = Reader::from_str(xml);
    let mut out = ImportResponse::default();
    let mut current: Option<String> = None;
    let mut saw_response = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_uppercase();
                if name == "RESPONSE" {
                    saw_response = true;
                }
                current = Some(name);
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| AdapterError::Malformed(format!("bad ledger response: {}", e)))?;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let count = || text.parse::<u32>().unwrap_or(0);
                match current.as_deref() {
                    Some("CREATED") => out.created = count(),
                    Some("ALTERED") => out.altered = count(),
                    Some("ERRORS") => out.errors = count(),
                    Some("LINEERROR") => out.line_errors.push(text.to_string()),
                    Some("LASTVCHID") if text != "0" => out.last_voucher_id = Some(text.to_string()),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(AdapterError::Malformed(format!("bad ledger response: {}", e))),
        }
    }
    if !saw_response {
        return Err(AdapterError::Malformed("ledger reply has no RESPONSE element".to_string()));
    }
    Ok(out)
}

/// Create-if-missing reading of a master-data import reply.
fn ensure_outcome(response: &ImportResponse) -> Result<EnsureOutcome, AdapterError> {
    if response.already_exists() || (response.created == 0 && response.altered > 0) {
        return Ok(EnsureOutcome::AlreadyExists);
    }
    if response.errors > 0 || !response.line_errors.is_empty() {
        return Err(AdapterError::Upstream {
            message: response.error_message(),
            retryable: false,
        });
    }
    if response.created > 0 {
        Ok(EnsureOutcome::Created)
    } else {
        Err(AdapterError::Malformed("ledger server neither created nor matched the master".to_string()))
    }
}

pub struct TallyHttpConnector {
    url: String,
    company: Option<String>,
    timeout_secs: u64,
    client: Client,
}

impl TallyHttpConnector {
    pub fn new(config: &TallyConfig) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AdapterError::Upstream {
                message: format!("could not build HTTP client: {}", e),
                retryable: false,
            })?;
        Ok(Self {
            url: config.url.clone(),
            company: config.company.clone(),
            timeout_secs: config.timeout.as_secs(),
            client,
        })
    }

    fn send(&self, body: String) -> Result<ImportResponse, AdapterError> {
        debug!(url = %self.url, bytes = body.len(), "posting to ledger server");
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(body)
            .send()
            .map_err(|e| AdapterError::from_transport(e, self.timeout_secs))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| AdapterError::from_transport(e, self.timeout_secs))?;
        if !status.is_success() {
            return Err(AdapterError::from_status(status, &text));
        }
        parse_import_response(&text)
    }
}

impl LedgerConnector for TallyHttpConnector {
    fn ensure_party_ledger(&self, name: &str, group: &str, address: Option<&str>) -> Result<EnsureOutcome, AdapterError> {
        let body = ledger_request(self.company.as_deref(), name, group, address)?;
        let outcome = ensure_outcome(&self.send(body)?)?;
        info!(ledger = name, ?outcome, "party ledger ensured");
        Ok(outcome)
    }

    fn ensure_stock_item(&self, name: &str, unit: &str, group: &str) -> Result<EnsureOutcome, AdapterError> {
        let body = stock_item_request(self.company.as_deref(), name, unit, group)?;
        let outcome = ensure_outcome(&self.send(body)?)?;
        debug!(item = name, ?outcome, "stock item ensured");
        Ok(outcome)
    }

    fn post_voucher(&self, voucher: &VoucherPayload) -> Result<VoucherReceipt, AdapterError> {
        let body = voucher_request(self.company.as_deref(), voucher)?;
        let response = self.send(body)?;
        if response.errors > 0 || response.created == 0 {
            return Err(AdapterError::Upstream {
                message: response.error_message(),
                retryable: false,
            });
        }
        Ok(VoucherReceipt {
            voucher_number: voucher.voucher_number.clone(),
            external_id: response.last_voucher_id,
            message: format!("{} voucher created for {}", voucher.voucher_type, voucher.party),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sink::VoucherItem;
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn voucher() -> VoucherPayload {
        VoucherPayload {
            voucher_type: "Purchase".into(),
            date: NaiveDate::from_ymd_opt(2025, 8, 27).unwrap(),
            voucher_number: Some("INV-7".into()),
            reference: Some("INV-7".into()),
            party: "Acme & Sons".into(),
            party_address: None,
            purchase_ledger: "Imported Goods".into(),
            godown: "Main Location".into(),
            batch: "Primary Batch".into(),
            narration: "Invoice INV-7".into(),
            items: vec![VoucherItem {
                row_index: 0,
                name: "Bolt".into(),
                quantity: Decimal::from(4),
                rate: Decimal::from_str("2.50").unwrap(),
                amount: Decimal::from_str("10.00").unwrap(),
                unit: "PCS".into(),
            }],
        }
    }

    #[test]
    fn voucher_xml_has_balanced_amounts() {
        let xml = voucher_request(Some("Demo Co"), &voucher()).unwrap();
        assert!(xml.contains("<SVCURRENTCOMPANY>Demo Co</SVCURRENTCOMPANY>"));
        assert!(xml.contains(r#"<VOUCHER VCHTYPE="Purchase" ACTION="Create""#));
        assert!(xml.contains("<DATE>20250827</DATE>"));
        assert!(xml.contains("<PARTYLEDGERNAME>Acme &amp; Sons</PARTYLEDGERNAME>"));
        assert!(xml.contains("<AMOUNT>10.00</AMOUNT>"));
        assert!(xml.contains("<AMOUNT>-10.00</AMOUNT>"));
        assert!(xml.contains("<RATE>2.5/PCS</RATE>"));
        assert!(xml.contains("<BILLEDQTY>4 PCS</BILLEDQTY>"));
        assert!(xml.contains("<LEDGERNAME>Imported Goods</LEDGERNAME>"));
    }

    #[test]
    fn master_requests_name_their_parent() {
        let xml = ledger_request(None, "Acme", "Sundry Creditors", Some("1 Road\nCity")).unwrap();
        assert!(xml.contains("<REPORTNAME>All Masters</REPORTNAME>"));
        assert!(!xml.contains("SVCURRENTCOMPANY"));
        assert!(xml.contains("<PARENT>Sundry Creditors</PARENT>"));
        assert!(xml.contains("<ADDRESS>City</ADDRESS>"));
        let xml = stock_item_request(None, "Bolt", "PCS", "Primary").unwrap();
        assert!(xml.contains(r#"<STOCKITEM NAME="Bolt" ACTION="Create">"#));
        assert!(xml.contains("<BASEUNITS>PCS</BASEUNITS>"));
    }

    #[test]
    fn parses_counters_and_line_errors() {
        let reply = "<RESPONSE><CREATED>1</CREATED><ALTERED>0</ALTERED><ERRORS>0</ERRORS><LASTVCHID>42</LASTVCHID></RESPONSE>";
        let r = parse_import_response(reply).unwrap();
        assert_eq!(r.created, 1);
        assert_eq!(r.last_voucher_id.as_deref(), Some("42"));
        assert_eq!(ensure_outcome(&r).unwrap(), EnsureOutcome::Created);

        let reply = "<RESPONSE><LINEERROR>Ledger 'Acme' already exists</LINEERROR><CREATED>0</CREATED><ERRORS>1</ERRORS></RESPONSE>";
        let r = parse_import_response(reply).unwrap();
        assert_eq!(ensure_outcome(&r).unwrap(), EnsureOutcome::AlreadyExists);

        let reply = "<RESPONSE><LINEERROR>Unit 'BOX' does not exist</LINEERROR><ERRORS>1</ERRORS></RESPONSE>";
        let err = ensure_outcome(&parse_import_response(reply).unwrap()).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("BOX"));
    }

    #[test]
    fn rejects_replies_without_response() {
        assert!(matches!(
            parse_import_response("<ENVELOPE><HEADER/></ENVELOPE>"),
            Err(AdapterError::Malformed(_))
        ));
    }
}
