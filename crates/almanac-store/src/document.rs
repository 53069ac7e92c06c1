use almanac_core::error::Result;
use almanac_core::types::{Document, DocumentSnapshot, FieldUpdates, FieldValue};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

/// Operations a backing document database must offer.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document by id.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<DocumentSnapshot>>;

    /// Merge `data` into the document, creating it if absent.
    async fn set_merge(&self, collection: &str, id: &str, data: Document) -> Result<()>;

    /// Apply `fields` to an existing document.
    /// Returns `false` without writing anything if the document does not exist.
    async fn update(&self, collection: &str, id: &str, fields: FieldUpdates) -> Result<bool>;

    /// Stream every document in a collection. Each call starts a new scan.
    fn stream<'a>(&'a self, collection: &'a str) -> BoxStream<'a, Result<DocumentSnapshot>>;
}

/// Merge `patch` into `target`. Nested maps merge recursively, everything
/// else is replaced.
pub fn merge_document(target: &mut Document, patch: Document) {
    for (key, value) in patch {
        match value {
            Value::Object(incoming) => {
                if let Some(Value::Object(existing)) = target.get_mut(&key) {
                    merge_document(existing, incoming);
                } else {
                    target.insert(key, Value::Object(incoming));
                }
            }
            value => {
                target.insert(key, value);
            }
        }
    }
}

/// Apply a partial update to `target`.
pub fn apply_updates(target: &mut Document, fields: FieldUpdates) {
    for (path, value) in fields {
        apply_update(target, &path, value);
    }
}

fn apply_update(target: &mut Document, path: &str, value: FieldValue) {
    let Some((head, rest)) = path.split_once('.') else {
        match value {
            FieldValue::Set(v) => {
                target.insert(path.to_string(), v);
            }
            FieldValue::Delete => {
                target.remove(path);
            }
        }
        return;
    };

    match value {
        FieldValue::Delete => {
            if let Some(Value::Object(child)) = target.get_mut(head) {
                apply_update(child, rest, FieldValue::Delete);
            }
        }
        set => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !child.is_object() {
                *child = Value::Object(Document::new());
            }
            if let Value::Object(child) = child {
                apply_update(child, rest, set);
            }
        }
    }
}
