//! Entities mirrored from backend rows.

use chrono::{DateTime, Utc};
use rally_supabase::{Row, value_as_text};
use serde_json::Value;

use crate::SyncError;

/// Values of a set of fields captured before an optimistic write.
///
/// `None` records that the field was absent, so restoring removes it.
pub type FieldSnapshot = Vec<(String, Option<Value>)>;

/// A single identified record.
///
/// Identity is the `id`; every other column is opaque payload, read through
/// the typed accessors which return `None` for absent or mistyped fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: String,
    fields: Row,
}

impl Entity {
    /// Build an entity from an id and payload. An `id` key in `fields` is
    /// ignored.
    pub fn new(id: impl Into<String>, mut fields: Row) -> Self {
        fields.remove("id");
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Validate a backend row. The row must carry a string or integer `id`.
    pub fn from_row(mut row: Row) -> Result<Self, SyncError> {
        let id = match row.remove("id") {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
            Some(other) => {
                return Err(SyncError::InvalidRow(format!("unsupported id {}", other)));
            }
            None => return Err(SyncError::InvalidRow("row has no id".to_string())),
        };
        Ok(Self { id, fields: row })
    }

    /// Extract the id from a possibly partial row (e.g. `old` on deletes).
    pub fn id_of(row: &Row) -> Option<String> {
        match row.get("id")? {
            Value::Null => None,
            value => Some(value_as_text(value)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fields(&self) -> &Row {
        &self.fields
    }

    /// Row form including `id`.
    pub fn to_row(&self) -> Row {
        let mut row = self.fields.clone();
        row.insert("id".to_string(), Value::String(self.id.clone()));
        row
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.field(name)?.as_bool()
    }

    pub fn i64_field(&self, name: &str) -> Option<i64> {
        self.field(name)?.as_i64()
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name)?.as_str()
    }

    pub fn timestamp_field(&self, name: &str) -> Option<DateTime<Utc>> {
        let raw = self.str_field(name)?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp_field("created_at")
    }

    /// Parent reference for reply-like entities. Null and absent are both
    /// "no parent".
    pub fn parent_id(&self) -> Option<String> {
        match self.field("parent_id")? {
            Value::Null => None,
            value => Some(value_as_text(value)),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        if name != "id" {
            self.fields.insert(name, value.into());
        }
    }

    /// Shallow-merge a patch. Returns whether any field changed.
    pub fn merge(&mut self, patch: &Row) -> bool {
        let mut changed = false;
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            if self.fields.get(key) != Some(value) {
                self.fields.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Capture the current values of `names`.
    pub fn snapshot(&self, names: &[&str]) -> FieldSnapshot {
        names
            .iter()
            .map(|name| (name.to_string(), self.fields.get(*name).cloned()))
            .collect()
    }

    /// Put captured fields back exactly, leaving all other fields alone.
    /// Returns whether any field changed.
    pub fn restore(&mut self, snapshot: &FieldSnapshot) -> bool {
        let mut changed = false;
        for (name, value) in snapshot {
            match value {
                Some(value) => {
                    if self.fields.get(name) != Some(value) {
                        self.fields.insert(name.clone(), value.clone());
                        changed = true;
                    }
                }
                None => changed |= self.fields.remove(name).is_some(),
            }
        }
        changed
    }
}

/// Convert a `serde_json::json!` object literal into a [`Row`].
///
/// Non-object values yield an empty row.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_row_requires_id() {
        assert!(matches!(
            Entity::from_row(row(json!({"title": "x"}))),
            Err(SyncError::InvalidRow(_))
        ));
        assert!(Entity::from_row(row(json!({"id": ""}))).is_err());
        assert!(Entity::from_row(row(json!({"id": {"nested": true}}))).is_err());

        let numeric = Entity::from_row(row(json!({"id": 42, "title": "x"}))).unwrap();
        assert_eq!(numeric.id(), "42");
        assert!(numeric.field("id").is_none());
    }

    #[test]
    fn test_accessors_tolerate_mistyped_fields() {
        let entity = Entity::from_row(row(json!({
            "id": "e1",
            "liked": "yes",
            "count": 3,
            "created_at": "2024-05-01T10:00:00Z",
            "parent_id": null
        })))
        .unwrap();

        assert_eq!(entity.bool_field("liked"), None);
        assert_eq!(entity.i64_field("count"), Some(3));
        assert_eq!(entity.str_field("count"), None);
        assert!(entity.created_at().is_some());
        assert_eq!(entity.parent_id(), None);
    }

    #[test]
    fn test_merge_reports_changes() {
        let mut entity = Entity::from_row(row(json!({"id": "e1", "a": 1, "b": 2}))).unwrap();
        assert!(!entity.merge(&row(json!({"a": 1, "id": "other"}))));
        assert!(entity.merge(&row(json!({"b": 3, "c": 4}))));
        assert_eq!(entity.id(), "e1");
        assert_eq!(entity.i64_field("b"), Some(3));
        assert_eq!(entity.i64_field("c"), Some(4));
    }

    #[test]
    fn test_snapshot_restore_is_field_scoped() {
        let mut entity = Entity::from_row(row(json!({"id": "e1", "liked": false, "title": "a"}))).unwrap();
        let snapshot = entity.snapshot(&["liked", "likes_count"]);

        entity.set("liked", true);
        entity.set("likes_count", 1);
        entity.set("title", "b");

        assert!(entity.restore(&snapshot));
        assert_eq!(entity.bool_field("liked"), Some(false));
        assert!(entity.field("likes_count").is_none());
        assert_eq!(entity.str_field("title"), Some("b"));
    }
}
