pub mod credit;
pub mod document;
pub mod template;

pub use credit::{CreditReference, CreditTransaction};
pub use document::{
    AttemptToken, Document, DocumentStatus, NewCellValue, NewLineItem, NewOcrData, OcrData,
    OcrLineItem, OcrLineItemValue, PendingIngestion,
};
pub use template::{
    normalize_key, DataType, FieldDraft, FieldName, FieldOption, FieldType, SubFieldDraft,
    SubTemplateField, Template, TemplateDraft, TemplateField, TemplateSchema, ValueKind,
    KNOWN_FIELD_NAMES,
};
