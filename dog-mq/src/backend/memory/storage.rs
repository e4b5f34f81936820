use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::backend::{
    Backend, BoxStream, Document, Filter, FindOptions, Sort, SortOrder, Update, ID,
};
use crate::error::{BackendError, BackendResult};
use crate::types::{Capabilities, Capability};

// collection -> _id -> document
type Collections = HashMap<String, BTreeMap<String, Document>>;

/// In-memory backend for testing and single-process deployments.
///
/// Every operation takes the collection lock once, so each call is atomic
/// with respect to every other call on the same backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub(crate) collections: Arc<RwLock<Collections>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection, ignoring filters (test helper)
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

fn doc_id(collection: &str, doc: &Document) -> BackendResult<String> {
    match doc.get(ID) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(BackendError::Internal(format!(
            "unsupported _id {other} in {collection}"
        ))),
        None => Ok(Uuid::new_v4().to_string()),
    }
}

fn insert_into(
    docs: &mut BTreeMap<String, Document>,
    collection: &str,
    mut doc: Document,
) -> BackendResult<String> {
    let id = doc_id(collection, &doc)?;
    if docs.contains_key(&id) {
        return Err(BackendError::DuplicateKey {
            collection: collection.to_string(),
            id,
        });
    }
    doc.entry(ID).or_insert_with(|| Value::String(id.clone()));
    docs.insert(id.clone(), doc);
    Ok(id)
}

fn select<'a>(
    docs: &'a BTreeMap<String, Document>,
    filter: &Filter,
    sort: Option<&Sort>,
) -> Vec<(&'a String, &'a Document)> {
    let mut hits: Vec<_> = docs.iter().filter(|(_, d)| filter.matches(d)).collect();
    if let Some(sort) = sort {
        hits.sort_by(|(_, a), (_, b)| sort.compare_docs(a, b));
    }
    hits
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn insert(&self, collection: &str, doc: Document) -> BackendResult<String> {
        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();
        insert_into(docs, collection, doc)
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
    ) -> BackendResult<Vec<String>> {
        let mut collections = self.collections.write();
        let stored = collections.entry(collection.to_string()).or_default();
        docs.into_iter()
            .map(|doc| insert_into(stored, collection, doc))
            .collect()
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> BackendResult<Option<Document>> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.values().find(|d| filter.matches(d)).cloned()))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> BackendResult<BoxStream<BackendResult<Document>>> {
        let page: Vec<Document> = {
            let collections = self.collections.read();
            match collections.get(collection) {
                None => Vec::new(),
                Some(docs) => {
                    let sort = options.sort.as_ref();
                    let after = match (sort, &options.after) {
                        (Some(sort), Some(marker)) => match sort.order {
                            SortOrder::Ascending => {
                                Some(Filter::Gt(sort.field.clone(), marker.clone()))
                            }
                            SortOrder::Descending => {
                                Some(Filter::Lt(sort.field.clone(), marker.clone()))
                            }
                        },
                        _ => None,
                    };
                    select(docs, filter, sort)
                        .into_iter()
                        .filter(|(_, d)| after.as_ref().map_or(true, |f| f.matches(d)))
                        .take(options.limit.unwrap_or(usize::MAX))
                        .map(|(_, d)| d.clone())
                        .collect()
                }
            }
        };
        Ok(Box::pin(futures::stream::iter(
            page.into_iter().map(Ok::<Document, BackendError>),
        )))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> BackendResult<u64> {
        let collections = self.collections.read();
        Ok(collections.get(collection).map_or(0, |docs| {
            docs.values().filter(|d| filter.matches(d)).count() as u64
        }))
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> BackendResult<bool> {
        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();

        let hit = docs
            .iter()
            .find(|(_, d)| filter.matches(d))
            .map(|(id, _)| id.clone());
        if let Some(id) = hit {
            if let Some(doc) = docs.get_mut(&id) {
                update.apply(doc);
                // _id is immutable
                doc.insert(ID.to_string(), Value::String(id));
            }
            return Ok(true);
        }
        if !upsert {
            return Ok(false);
        }

        let mut doc = Document::new();
        for (field, value) in filter.equalities() {
            doc.insert(field.to_string(), value.clone());
        }
        update.apply(&mut doc);
        insert_into(docs, collection, doc)?;
        Ok(true)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> BackendResult<u64> {
        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut updated = 0;
        for (id, doc) in docs.iter_mut() {
            if filter.matches(doc) {
                update.apply(doc);
                doc.insert(ID.to_string(), Value::String(id.clone()));
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> BackendResult<u64> {
        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let hit = docs
            .iter()
            .find(|(_, d)| filter.matches(d))
            .map(|(id, _)| id.clone());
        Ok(hit.and_then(|id| docs.remove(&id)).map_or(0, |_| 1))
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> BackendResult<u64> {
        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, d| !filter.matches(d));
        Ok((before - docs.len()) as u64)
    }

    async fn find_and_delete_many(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: usize,
    ) -> BackendResult<Vec<Document>> {
        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(Vec::new());
        };
        let hits: Vec<String> = select(docs, filter, sort)
            .into_iter()
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect();
        Ok(hits.iter().filter_map(|id| docs.remove(id)).collect())
    }

    fn capabilities(&self) -> Capabilities {
        [
            Capability::Fifo,
            Capability::Claims,
            Capability::AtLeastOnce,
            Capability::HighThroughput,
        ]
        .into()
    }

    async fn is_alive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    async fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        for k in 1..=5 {
            backend
                .insert("items", doc(json!({"_id": format!("q/{k}"), "k": k, "q": "q"})))
                .await
                .unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let backend = seeded().await;
        let err = backend
            .insert("items", doc(json!({"_id": "q/1", "k": 1})))
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(backend.len("items"), 5);
    }

    #[tokio::test]
    async fn insert_many_keeps_the_prefix_before_a_failure() {
        let backend = MemoryBackend::new();
        let err = backend
            .insert_many(
                "items",
                vec![
                    doc(json!({"_id": "a"})),
                    doc(json!({"_id": "b"})),
                    doc(json!({"_id": "a"})),
                    doc(json!({"_id": "c"})),
                ],
            )
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(backend.len("items"), 2);
    }

    #[tokio::test]
    async fn find_pages_after_a_marker() {
        let backend = seeded().await;
        let opts = FindOptions::sorted(Sort::asc("k"))
            .after(Some(json!(2)))
            .limit(2);
        let docs: Vec<Document> = backend
            .find("items", &Filter::eq("q", "q"), &opts)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let ks: Vec<_> = docs.iter().map(|d| d["k"].as_i64().unwrap()).collect();
        assert_eq!(ks, vec![3, 4]);
    }

    #[tokio::test]
    async fn conditional_update_acts_as_compare_and_set() {
        let backend = seeded().await;
        let claim = Filter::id("q/1").and(Filter::Eq("owner".into(), Value::Null));

        let first = backend
            .update_one("items", &claim, &Update::new().set("owner", "a"), false)
            .await
            .unwrap();
        let second = backend
            .update_one("items", &claim, &Update::new().set("owner", "b"), false)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        let stored = backend.find_one("items", &Filter::id("q/1")).await.unwrap().unwrap();
        assert_eq!(stored["owner"], json!("a"));
    }

    #[tokio::test]
    async fn upsert_seeds_from_filter_equalities() {
        let backend = MemoryBackend::new();
        let matched = backend
            .update_one(
                "counters",
                &Filter::id("p/q"),
                &Update::new().inc("v", 1),
                true,
            )
            .await
            .unwrap();
        assert!(matched);
        let counter = backend.find_one("counters", &Filter::id("p/q")).await.unwrap().unwrap();
        assert_eq!(counter["v"], json!(1));
    }

    #[tokio::test]
    async fn find_and_delete_many_takes_the_lowest_run() {
        let backend = seeded().await;
        let popped = backend
            .find_and_delete_many("items", &Filter::gt("k", 1), Some(&Sort::asc("k")), 2)
            .await
            .unwrap();
        let ks: Vec<_> = popped.iter().map(|d| d["k"].as_i64().unwrap()).collect();
        assert_eq!(ks, vec![2, 3]);
        assert_eq!(backend.count("items", &Filter::All).await.unwrap(), 3);

        let rest = backend
            .find_and_delete_many("items", &Filter::All, None, 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(backend.is_empty("items"));
    }

    #[tokio::test]
    async fn delete_many_reports_count() {
        let backend = seeded().await;
        let removed = backend.delete_many("items", &Filter::lte("k", 3)).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(backend.delete_many("nothing", &Filter::All).await.unwrap(), 0);
    }
}
