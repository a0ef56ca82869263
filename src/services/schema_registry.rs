use crate::cache::SchemaCache;
use crate::db::Db;
use crate::error::{IntakeError, Result};
use crate::models::{
    normalize_key, DataType, FieldDraft, FieldName, FieldOption, FieldType, SubFieldDraft,
    Template, TemplateDraft, TemplateSchema,
};
use crate::types::{FieldPayload, OptionPayload, SubFieldPayload, TemplatePayload};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Template definitions and their resolved, cached schemas.
pub struct SchemaRegistry {
    db: Arc<Db>,
    cache: SchemaCache,
}

impl SchemaRegistry {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            cache: SchemaCache::new(),
        }
    }

    pub fn create_template(&self, user_id: i64, payload: &TemplatePayload) -> Result<Arc<TemplateSchema>> {
        if !self.db.user_exists(user_id)? {
            return Err(IntakeError::not_found("user", user_id));
        }
        let draft = validate_template(user_id, payload)?;
        let template_id = self.db.insert_template(&draft)?;
        info!(template_id, user_id, fields = draft.fields.len(), "template created");
        self.schema(template_id)
    }

    /// Adds a field; only future extraction runs see it.
    pub fn add_field(&self, template_id: i64, payload: &FieldPayload) -> Result<Arc<TemplateSchema>> {
        let current = self.schema(template_id)?;
        let next_order = current.fields.iter().map(|f| f.field_order).max().unwrap_or(0) + 1;
        let draft = validate_field(payload, payload.field_order.unwrap_or(next_order))?;
        if current.fields.iter().any(|f| f.name.key() == draft.name.key()) {
            return Err(IntakeError::Validation(format!(
                "template {} already has a field named '{}'",
                template_id, draft.name
            )));
        }
        if current.fields.iter().any(|f| f.field_order == draft.field_order) {
            return Err(IntakeError::Validation(format!(
                "template {} already has a field at order {}",
                template_id, draft.field_order
            )));
        }
        let field_id = self.db.insert_field(template_id, &draft)?;
        self.cache.invalidate(template_id);
        info!(template_id, field_id, field = %draft.name, "field added");
        self.schema(template_id)
    }

    /// Removes a field and, by cascade, every value extracted for it.
    pub fn remove_field(&self, template_id: i64, field_name: &str) -> Result<Arc<TemplateSchema>> {
        let current = self.schema(template_id)?;
        let field = current
            .field(field_name)
            .ok_or_else(|| IntakeError::not_found("field", field_name))?;
        self.db.delete_field(template_id, field.id)?;
        self.cache.invalidate(template_id);
        info!(template_id, field = field_name, "field removed");
        self.schema(template_id)
    }

    pub fn delete_template(&self, template_id: i64) -> Result<()> {
        self.db.delete_template(template_id)?;
        self.cache.invalidate(template_id);
        info!(template_id, "template deleted");
        Ok(())
    }

    pub fn list_templates(&self, user_id: Option<i64>) -> Result<Vec<Template>> {
        self.db.list_templates(user_id)
    }

    pub fn schema(&self, template_id: i64) -> Result<Arc<TemplateSchema>> {
        if let Some(hit) = self.cache.get(template_id) {
            return Ok(hit);
        }
        let schema = self.db.load_template_schema(template_id)?;
        Ok(self.cache.insert(schema))
    }

    /// Drops cached schemas, e.g. after a user delete cascaded templates away.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}

/// Checks a template definition and assigns default orders.
pub fn validate_template(user_id: i64, payload: &TemplatePayload) -> Result<TemplateDraft> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(IntakeError::Validation("template name must not be empty".to_string()));
    }

    let mut next_order = payload
        .fields
        .iter()
        .filter_map(|f| f.field_order)
        .max()
        .unwrap_or(0)
        + 1;
    let mut fields = Vec::with_capacity(payload.fields.len());
    let mut seen_names = HashSet::new();
    let mut seen_orders = HashSet::new();
    for field in &payload.fields {
        let order = match field.field_order {
            Some(o) => o,
            None => {
                next_order += 1;
                next_order - 1
            }
        };
        let draft = validate_field(field, order)?;
        if !seen_names.insert(draft.name.key()) {
            return Err(IntakeError::Validation(format!("duplicate field name '{}'", draft.name)));
        }
        if !seen_orders.insert(draft.field_order) {
            return Err(IntakeError::Validation(format!(
                "duplicate field order {} ('{}')",
                draft.field_order, draft.name
            )));
        }
        fields.push(draft);
    }
    fields.sort_by_key(|f| f.field_order);

    Ok(TemplateDraft {
        user_id,
        name: name.to_string(),
        instructions: clean_text(payload.instructions.as_deref()),
        fields,
    })
}

fn validate_field(payload: &FieldPayload, field_order: i64) -> Result<FieldDraft> {
    let name = FieldName::parse(&payload.name).map_err(IntakeError::Validation)?;
    let field_type: FieldType = payload
        .field_type
        .parse()
        .map_err(|e: String| IntakeError::Validation(format!("field '{}': {}", name, e)))?;

    let sub_fields = if field_type == FieldType::Table {
        if payload.sub_fields.is_empty() {
            return Err(IntakeError::Validation(format!(
                "table field '{}' needs at least one column",
                name
            )));
        }
        validate_columns(&name, &payload.sub_fields)?
    } else {
        if !payload.sub_fields.is_empty() {
            return Err(IntakeError::Validation(format!(
                "field '{}' is {} and cannot have columns",
                name,
                field_type.as_str()
            )));
        }
        Vec::new()
    };

    let options = validate_options(name.as_str(), &payload.options)?;
    if field_type != FieldType::Select && !options.is_empty() {
        warn!(field = %name, "options on a non-select field are ignored");
    }
    if field_type == FieldType::Select && options.is_empty() {
        warn!(field = %name, "select field has no options; every value will fail validation");
    }
    if !name.is_known() {
        info!(field = %name, "custom field name");
    }

    Ok(FieldDraft {
        name,
        field_order,
        field_type,
        instructions: clean_text(payload.instructions.as_deref()),
        options,
        sub_fields,
    })
}

fn validate_columns(field: &FieldName, columns: &[SubFieldPayload]) -> Result<Vec<SubFieldDraft>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(columns.len());
    for (i, col) in columns.iter().enumerate() {
        let name = col.name.trim();
        if normalize_key(name).is_empty() {
            return Err(IntakeError::Validation(format!(
                "column {} of '{}' has no name",
                i + 1,
                field
            )));
        }
        if !seen.insert(normalize_key(name)) {
            return Err(IntakeError::Validation(format!(
                "duplicate column '{}' in '{}'",
                name, field
            )));
        }
        let data_type: DataType = col
            .data_type
            .parse()
            .map_err(|e: String| IntakeError::Validation(format!("column '{}.{}': {}", field, name, e)))?;
        let options = validate_options(name, &col.options)?;
        if data_type == DataType::Select && options.is_empty() {
            warn!(field = %field, column = name, "select column has no options");
        }
        out.push(SubFieldDraft {
            name: name.to_string(),
            data_type,
            instructions: clean_text(col.instructions.as_deref()),
            column_order: col.column_order.unwrap_or(i as i64 + 1),
            options,
        });
    }
    out.sort_by_key(|c| c.column_order);
    Ok(out)
}

fn validate_options(owner: &str, options: &[OptionPayload]) -> Result<Vec<FieldOption>> {
    options
        .iter()
        .map(|o| {
            let value = o.value.trim();
            if value.is_empty() {
                return Err(IntakeError::Validation(format!("empty option value on '{}'", owner)));
            }
            let label = o
                .label
                .as_deref()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .unwrap_or(value);
            Ok(FieldOption {
                value: value.to_string(),
                label: label.to_string(),
            })
        })
        .collect()
}

fn clean_text(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}
