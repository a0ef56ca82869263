//! Raw extracted text to typed values.
//!
//! Every function here is pure. A value that does not fit its declared kind
//! comes back as a [`ConversionError`]; callers keep the raw text and move on.

use crate::models::{FieldOption, SubTemplateField, TemplateField, ValueKind};
use crate::types::FieldValue;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{field}: cannot read '{raw}' as {expected}: {reason}")]
pub struct ConversionError {
    pub field: String,
    pub raw: String,
    pub expected: ValueKind,
    pub reason: String,
}

/// Tried in order; the first that parses wins. Numeric dates are read
/// day-first.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%m-%d-%Y",
    "%d.%m.%Y",
    "%Y/%m/%d",
    "%d-%b-%Y",
    "%d-%B-%Y",
    "%d %B %Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M",
];

/// `%Y` also takes one to three digits; shorter years are rejected.
const MIN_YEAR: i32 = 1000;

/// Grouping separators allowed inside a number: comma, thin space, narrow no-break space.
const DIGIT_GROUPING: &[char] = &[',', '\u{2009}', '\u{202F}'];

const TRUE_WORDS: &[&str] = &["true", "1", "yes", "y", "on", "enable", "enabled", "active"];
const FALSE_WORDS: &[&str] = &["false", "0", "no", "n", "off", "disable", "disabled", "inactive"];

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").expect("valid number regex")
    })
}

fn decimal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)$").expect("valid decimal regex"))
}

fn currency_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(rs\.?|inr|usd|eur|gbp)").expect("valid currency code regex"))
}

fn ordinal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d)(st|nd|rd|th)\b").expect("valid ordinal regex"))
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"))
}

/// Converts one raw value. `None` converts to `Null`; blank input is `Null`
/// for every kind except text, which keeps the empty string.
pub fn convert(
    raw: Option<&str>,
    kind: ValueKind,
    options: &[FieldOption],
    field: &str,
) -> Result<FieldValue, ConversionError> {
    let Some(raw) = raw else {
        return Ok(FieldValue::Null);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(match kind {
            ValueKind::Text => FieldValue::Text(String::new()),
            _ => FieldValue::Null,
        });
    }
    let fail = |reason: &str| ConversionError {
        field: field.to_string(),
        raw: raw.to_string(),
        expected: kind,
        reason: reason.to_string(),
    };

    match kind {
        ValueKind::Text => Ok(FieldValue::Text(trimmed.to_string())),
        ValueKind::Number => parse_number(trimmed).ok_or_else(|| fail("not a number")),
        ValueKind::Integer => match parse_number(trimmed) {
            Some(FieldValue::Integer(i)) => Ok(FieldValue::Integer(i)),
            Some(FieldValue::Float(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Ok(FieldValue::Integer(f as i64))
            }
            Some(_) => Err(fail("not a whole number")),
            None => Err(fail("not a number")),
        },
        ValueKind::Currency => parse_currency(trimmed)
            .map(FieldValue::Decimal)
            .ok_or_else(|| fail("not a monetary amount")),
        ValueKind::Date => parse_date(trimmed)
            .map(FieldValue::Date)
            .ok_or_else(|| fail("no known date format matches")),
        ValueKind::Email => {
            let lower = trimmed.to_lowercase();
            if email_re().is_match(&lower) {
                Ok(FieldValue::Text(lower))
            } else {
                Err(fail("not an email address"))
            }
        }
        ValueKind::Boolean => parse_bool(trimmed)
            .map(FieldValue::Boolean)
            .ok_or_else(|| fail("not a yes/no value")),
        ValueKind::Select => {
            if options.is_empty() {
                return Err(fail("field has no options configured"));
            }
            match_option(trimmed, options)
                .map(|o| FieldValue::Text(o.value.clone()))
                .ok_or_else(|| fail("not one of the configured options"))
        }
    }
}

/// Converts a scalar template field. Tables are not leaves and always fail here.
pub fn convert_field(field: &TemplateField, raw: Option<&str>) -> Result<FieldValue, ConversionError> {
    match field.field_type.value_kind() {
        Some(kind) => convert(raw, kind, &field.options, field.name.as_str()),
        None => Err(ConversionError {
            field: field.name.to_string(),
            raw: raw.unwrap_or_default().to_string(),
            expected: ValueKind::Text,
            reason: "table fields are converted per cell".to_string(),
        }),
    }
}

/// Converts one table cell by its column's data type.
pub fn convert_cell(
    field: &TemplateField,
    column: &SubTemplateField,
    raw: Option<&str>,
) -> Result<FieldValue, ConversionError> {
    let label = format!("{}.{}", field.name, column.name);
    convert(raw, column.data_type.value_kind(), &column.options, &label)
}

fn parse_number(s: &str) -> Option<FieldValue> {
    let cleaned: String = s.trim().chars().filter(|c| !DIGIT_GROUPING.contains(c)).collect();
    if !number_re().is_match(&cleaned) {
        return None;
    }
    if !cleaned.contains(['.', 'e', 'E']) {
        if let Ok(i) = cleaned.parse::<i64>() {
            return Some(FieldValue::Integer(i));
        }
    }
    cleaned.parse::<f64>().ok().filter(|f| f.is_finite()).map(FieldValue::Float)
}

/// Parses a monetary amount into a fixed-point decimal.
pub fn parse_currency(s: &str) -> Option<Decimal> {
    let without_codes = currency_code_re().replace_all(s, "");
    let mut cleaned: String = without_codes
        .chars()
        .filter(|c| !matches!(c, '$' | '₹' | '€' | '£' | '¥' | ',') && !c.is_whitespace())
        .collect();
    if let Some(stripped) = cleaned.strip_suffix("/-") {
        cleaned = stripped.to_string();
    }
    let negative = cleaned.starts_with('(') && cleaned.ends_with(')');
    if negative {
        cleaned = cleaned[1..cleaned.len() - 1].to_string();
    }
    if !decimal_re().is_match(&cleaned) {
        return None;
    }
    let value = Decimal::from_str(&cleaned).ok()?;
    Some(if negative { -value } else { value })
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let cleaned = ordinal_re().replace_all(s.trim(), "$1");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let full_year = |d: &NaiveDate| d.year() >= MIN_YEAR;
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok().filter(full_year))
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(&cleaned, fmt).ok().map(|dt| dt.date()).filter(full_year))
        })
        .or_else(|| {
            DateTime::parse_from_rfc3339(&cleaned)
                .ok()
                .map(|dt| dt.date_naive())
                .filter(full_year)
        })
}

fn parse_bool(s: &str) -> Option<bool> {
    let lower = s.to_lowercase();
    if TRUE_WORDS.contains(&lower.as_str()) {
        Some(true)
    } else if FALSE_WORDS.contains(&lower.as_str()) {
        Some(false)
    } else {
        None
    }
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Exact match on value first, then label, ignoring case and spacing.
fn match_option<'a>(raw: &str, options: &'a [FieldOption]) -> Option<&'a FieldOption> {
    let wanted = collapse(raw);
    options
        .iter()
        .find(|o| collapse(&o.value) == wanted)
        .or_else(|| options.iter().find(|o| collapse(&o.label) == wanted))
}
