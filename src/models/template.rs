use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Field names every template can use without declaring a custom name.
pub const KNOWN_FIELD_NAMES: &[&str] = &[
    "invoice_number",
    "invoice_date",
    "due_date",
    "vendor_name",
    "vendor_address",
    "customer_name",
    "customer_address",
    "subtotal",
    "tax_amount",
    "total_amount",
    "item_description",
    "quantity",
    "unit_price",
    "line_total",
];

/// Canonical lookup key: camelCase split into snake_case, spaces and hyphens
/// to underscores, lowercase. `"TotalAmount"`, `"total amount"` and
/// `"total_amount"` all map to `total_amount`.
pub fn normalize_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev: Option<char> = None;
    for c in raw.trim().chars() {
        if c.is_whitespace() || c == '-' || c == '_' || c == '.' {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        } else if c.is_uppercase() {
            if let Some(p) = prev {
                if (p.is_lowercase() || p.is_ascii_digit()) && !out.ends_with('_') {
                    out.push('_');
                }
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Name of a template field: either one of [`KNOWN_FIELD_NAMES`] or a custom name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldName {
    Known(&'static str),
    Custom(String),
}

impl FieldName {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("field name must not be empty".to_string());
        }
        let key = normalize_key(trimmed);
        if key.is_empty() {
            return Err(format!("field name '{}' has no usable characters", raw));
        }
        if let Some(known) = KNOWN_FIELD_NAMES.iter().find(|k| **k == key) {
            return Ok(FieldName::Known(known));
        }
        Ok(FieldName::Custom(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldName::Known(s) => s,
            FieldName::Custom(s) => s.as_str(),
        }
    }

    pub fn key(&self) -> String {
        normalize_key(self.as_str())
    }

    pub fn is_known(&self) -> bool {
        matches!(self, FieldName::Known(_))
    }

    /// True if `other` names this field after key normalization.
    pub fn matches(&self, other: &str) -> bool {
        self.key() == normalize_key(other)
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FieldName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FieldName::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Leaf value kinds the converter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Text,
    Number,
    Integer,
    Currency,
    Date,
    Email,
    Boolean,
    Select,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::Text => "text",
            ValueKind::Number => "number",
            ValueKind::Integer => "integer",
            ValueKind::Currency => "currency",
            ValueKind::Date => "date",
            ValueKind::Email => "email",
            ValueKind::Boolean => "boolean",
            ValueKind::Select => "select",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Date,
    Email,
    Currency,
    Boolean,
    Select,
    Table,
}

impl FieldType {
    pub const ALL: [FieldType; 8] = [
        FieldType::Text,
        FieldType::Number,
        FieldType::Date,
        FieldType::Email,
        FieldType::Currency,
        FieldType::Boolean,
        FieldType::Select,
        FieldType::Table,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Date => "date",
            FieldType::Email => "email",
            FieldType::Currency => "currency",
            FieldType::Boolean => "boolean",
            FieldType::Select => "select",
            FieldType::Table => "table",
        }
    }

    /// `None` for tables; their cells convert by column data type.
    pub fn value_kind(self) -> Option<ValueKind> {
        match self {
            FieldType::Text => Some(ValueKind::Text),
            FieldType::Number => Some(ValueKind::Number),
            FieldType::Date => Some(ValueKind::Date),
            FieldType::Email => Some(ValueKind::Email),
            FieldType::Currency => Some(ValueKind::Currency),
            FieldType::Boolean => Some(ValueKind::Boolean),
            FieldType::Select => Some(ValueKind::Select),
            FieldType::Table => None,
        }
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "string" => Ok(FieldType::Text),
            "number" | "float" | "integer" => Ok(FieldType::Number),
            "date" => Ok(FieldType::Date),
            "email" => Ok(FieldType::Email),
            "currency" => Ok(FieldType::Currency),
            "boolean" | "bool" => Ok(FieldType::Boolean),
            "select" => Ok(FieldType::Select),
            "table" => Ok(FieldType::Table),
            other => Err(format!("unknown field type '{}'", other)),
        }
    }
}

/// Column data type of a table sub-field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "text")]
    String,
    Integer,
    #[serde(alias = "number")]
    Float,
    Date,
    Boolean,
    Select,
    Currency,
}

impl DataType {
    pub const ALL: [DataType; 7] = [
        DataType::String,
        DataType::Integer,
        DataType::Float,
        DataType::Date,
        DataType::Boolean,
        DataType::Select,
        DataType::Currency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Date => "date",
            DataType::Boolean => "boolean",
            DataType::Select => "select",
            DataType::Currency => "currency",
        }
    }

    pub fn value_kind(self) -> ValueKind {
        match self {
            DataType::String => ValueKind::Text,
            DataType::Integer => ValueKind::Integer,
            DataType::Float => ValueKind::Number,
            DataType::Date => ValueKind::Date,
            DataType::Boolean => ValueKind::Boolean,
            DataType::Select => ValueKind::Select,
            DataType::Currency => ValueKind::Currency,
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" | "text" => Ok(DataType::String),
            "integer" | "int" => Ok(DataType::Integer),
            "float" | "number" | "decimal" => Ok(DataType::Float),
            "date" => Ok(DataType::Date),
            "boolean" | "bool" => Ok(DataType::Boolean),
            "select" => Ok(DataType::Select),
            "currency" => Ok(DataType::Currency),
            other => Err(format!("unknown column data type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOption {
    pub value: String,
    pub label: String,
}

/// One column of a table field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTemplateField {
    pub id: i64,
    pub field_id: i64,
    pub name: String,
    pub data_type: DataType,
    pub instructions: Option<String>,
    pub column_order: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FieldOption>,
}

impl SubTemplateField {
    pub fn matches(&self, name: &str) -> bool {
        normalize_key(&self.name) == normalize_key(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateField {
    pub id: i64,
    pub template_id: i64,
    pub name: FieldName,
    pub field_order: i64,
    pub field_type: FieldType,
    pub instructions: Option<String>,
    /// Columns, ordered by `column_order`. Empty unless `field_type` is table.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_fields: Vec<SubTemplateField>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FieldOption>,
}

impl TemplateField {
    pub fn is_table(&self) -> bool {
        self.field_type == FieldType::Table
    }

    pub fn column(&self, name: &str) -> Option<&SubTemplateField> {
        self.sub_fields.iter().find(|s| s.matches(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub instructions: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A template with its fields resolved in declared order.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateSchema {
    pub template: Template,
    pub fields: Vec<TemplateField>,
}

impl TemplateSchema {
    pub fn id(&self) -> i64 {
        self.template.id
    }

    pub fn field(&self, name: &str) -> Option<&TemplateField> {
        let key = normalize_key(name);
        self.fields.iter().find(|f| f.name.key() == key)
    }

    pub fn field_by_id(&self, id: i64) -> Option<&TemplateField> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn scalar_fields(&self) -> impl Iterator<Item = &TemplateField> {
        self.fields.iter().filter(|f| !f.is_table())
    }

    pub fn table_fields(&self) -> impl Iterator<Item = &TemplateField> {
        self.fields.iter().filter(|f| f.is_table())
    }
}

/// Validated template ready to be written.
#[derive(Debug, Clone)]
pub struct TemplateDraft {
    pub user_id: i64,
    pub name: String,
    pub instructions: Option<String>,
    pub fields: Vec<FieldDraft>,
}

#[derive(Debug, Clone)]
pub struct FieldDraft {
    pub name: FieldName,
    pub field_order: i64,
    pub field_type: FieldType,
    pub instructions: Option<String>,
    pub options: Vec<FieldOption>,
    pub sub_fields: Vec<SubFieldDraft>,
}

#[derive(Debug, Clone)]
pub struct SubFieldDraft {
    pub name: String,
    pub data_type: DataType,
    pub instructions: Option<String>,
    pub column_order: i64,
    pub options: Vec<FieldOption>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_key_handles_camel_spaces_and_hyphens() {
        assert_eq!(normalize_key("TotalAmount"), "total_amount");
        assert_eq!(normalize_key("total amount"), "total_amount");
        assert_eq!(normalize_key(" Invoice-Number "), "invoice_number");
        assert_eq!(normalize_key("unit_price"), "unit_price");
        assert_eq!(normalize_key("GSTIN"), "gstin");
        assert_eq!(normalize_key("line2Total"), "line2_total");
    }

    #[test]
    fn field_name_known_or_custom() {
        assert_eq!(FieldName::parse("InvoiceNumber").unwrap(), FieldName::Known("invoice_number"));
        assert_eq!(
            FieldName::parse(" PO Reference ").unwrap(),
            FieldName::Custom("PO Reference".to_string())
        );
        assert!(FieldName::parse("   ").is_err());
        assert!(FieldName::parse("--").is_err());
    }

    #[test]
    fn field_name_matching_ignores_spelling() {
        let name = FieldName::parse("total_amount").unwrap();
        assert!(name.matches("TotalAmount"));
        assert!(name.matches("Total Amount"));
        assert!(!name.matches("subtotal"));
    }

    #[test]
    fn field_name_serde_round_trips_through_parse() {
        let name: FieldName = serde_json::from_str("\"VendorName\"").unwrap();
        assert!(name.is_known());
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"vendor_name\"");
    }

    #[test]
    fn field_type_parsing() {
        assert_eq!("Currency".parse::<FieldType>().unwrap(), FieldType::Currency);
        assert_eq!(FieldType::Table.value_kind(), None);
        assert!("blob".parse::<FieldType>().is_err());
        assert_eq!("number".parse::<DataType>().unwrap(), DataType::Float);
        assert_eq!(DataType::Integer.value_kind(), ValueKind::Integer);
    }
}
