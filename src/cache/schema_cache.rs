use crate::models::TemplateSchema;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Resolved template schemas keyed by template id.
///
/// Lock failures degrade to a cache miss; the registry reloads from the store.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: RwLock<HashMap<i64, Arc<TemplateSchema>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, template_id: i64) -> Option<Arc<TemplateSchema>> {
        let guard = self.entries.read().ok()?;
        guard.get(&template_id).cloned()
    }

    pub fn insert(&self, schema: TemplateSchema) -> Arc<TemplateSchema> {
        let schema = Arc::new(schema);
        if let Ok(mut guard) = self.entries.write() {
            guard.insert(schema.id(), Arc::clone(&schema));
        }
        schema
    }

    pub fn invalidate(&self, template_id: i64) {
        if let Ok(mut guard) = self.entries.write() {
            guard.remove(&template_id);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.entries.write() {
            guard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Template;

    fn schema(id: i64) -> TemplateSchema {
        TemplateSchema {
            template: Template {
                id,
                user_id: 1,
                name: format!("t{}", id),
                instructions: None,
                created_at: String::new(),
                updated_at: String::new(),
            },
            fields: Vec::new(),
        }
    }

    #[test]
    fn insert_get_invalidate() {
        let cache = SchemaCache::new();
        assert!(cache.get(1).is_none());
        cache.insert(schema(1));
        cache.insert(schema(2));
        assert_eq!(cache.get(1).map(|s| s.template.name.clone()), Some("t1".to_string()));
        cache.invalidate(1);
        assert!(cache.get(1).is_none());
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
