//! Storage primitives consumed by the controllers.
//!
//! A backend stores JSON documents in named collections and evaluates a small
//! filter language over top-level fields. Every call is atomic on its own;
//! conditional filters on [`Backend::update_one`] are the compare-and-set
//! primitive that claiming and catalog creation are built on.

#[cfg(feature = "memory")]
pub mod memory;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use serde_json::{Map, Value};

use crate::error::{BackendResult, BrokerError, BrokerResult};
use crate::types::{Capabilities, Pool};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// A stored record; `_id` is the primary key
pub type Document = Map<String, Value>;

/// Primary key field
pub const ID: &str = "_id";

static NULL: Value = Value::Null;

/// Predicate over top-level document fields
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    /// `Eq(field, Null)` also matches documents without the field
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::Eq(field.to_string(), value.into())
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Self::Ne(field.to_string(), value.into())
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Self::Lt(field.to_string(), value.into())
    }

    pub fn lte(field: &str, value: impl Into<Value>) -> Self {
        Self::Lte(field.to_string(), value.into())
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Self::Gt(field.to_string(), value.into())
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Self::Gte(field.to_string(), value.into())
    }

    pub fn is_in<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn id(id: impl Into<Value>) -> Self {
        Self::Eq(ID.to_string(), id.into())
    }

    /// Conjunction, flattening nested `And`s
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            }
            (f, Filter::And(mut b)) => {
                b.insert(0, f);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut a) => {
                a.push(other);
                Filter::Or(a)
            }
            f => Filter::Or(vec![f, other]),
        }
    }

    /// Reference evaluation used by in-process drivers
    pub fn matches(&self, doc: &Document) -> bool {
        let field = |name: &str| doc.get(name).unwrap_or(&NULL);
        match self {
            Filter::All => true,
            Filter::Eq(name, v) => compare(field(name), v) == Some(Ordering::Equal),
            Filter::Ne(name, v) => compare(field(name), v) != Some(Ordering::Equal),
            Filter::Lt(name, v) => compare_present(doc, name, v) == Some(Ordering::Less),
            Filter::Lte(name, v) => matches!(
                compare_present(doc, name, v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::Gt(name, v) => compare_present(doc, name, v) == Some(Ordering::Greater),
            Filter::Gte(name, v) => matches!(
                compare_present(doc, name, v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::In(name, vs) => vs
                .iter()
                .any(|v| compare(field(name), v) == Some(Ordering::Equal)),
            Filter::And(fs) => fs.iter().all(|f| f.matches(doc)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(doc)),
        }
    }

    /// Field values pinned by equality, used to seed upserted documents
    pub fn equalities(&self) -> Vec<(&str, &Value)> {
        match self {
            Filter::Eq(name, v) => vec![(name.as_str(), v)],
            Filter::And(fs) => fs.iter().flat_map(Filter::equalities).collect(),
            _ => Vec::new(),
        }
    }
}

fn compare_present(doc: &Document, name: &str, v: &Value) -> Option<Ordering> {
    match doc.get(name) {
        None | Some(Value::Null) => None,
        Some(actual) => compare(actual, v),
    }
}

/// Order two JSON scalars of the same kind; mixed kinds are incomparable
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}

/// Field patch applied by `update_one` / `update_many`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Document,
    pub inc: Vec<(String, i64)>,
    pub unset: Vec<String>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    pub fn inc(mut self, field: &str, by: i64) -> Self {
        self.inc.push((field.to_string(), by));
        self
    }

    pub fn unset(mut self, field: &str) -> Self {
        self.unset.push(field.to_string());
        self
    }

    pub fn apply(&self, doc: &mut Document) {
        for (k, v) in &self.set {
            doc.insert(k.clone(), v.clone());
        }
        for (k, by) in &self.inc {
            let current = doc.get(k).and_then(Value::as_i64).unwrap_or(0);
            doc.insert(k.clone(), Value::from(current + by));
        }
        for k in &self.unset {
            doc.remove(k);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

impl Sort {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            order: SortOrder::Ascending,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            order: SortOrder::Descending,
        }
    }

    pub fn compare_docs(&self, a: &Document, b: &Document) -> Ordering {
        let x = a.get(&self.field).unwrap_or(&NULL);
        let y = b.get(&self.field).unwrap_or(&NULL);
        let ord = compare(x, y).unwrap_or(Ordering::Equal);
        match self.order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    }
}

/// Paging for `find`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<Sort>,
    /// Only documents strictly after this value of the sort field
    pub after: Option<Value>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted(sort: Sort) -> Self {
        Self {
            sort: Some(sort),
            ..Self::default()
        }
    }

    pub fn after(mut self, marker: Option<Value>) -> Self {
        self.after = marker;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Physical storage for one pool (or the control store)
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Insert one document; duplicate `_id` fails `DuplicateKey`
    async fn insert(&self, collection: &str, doc: Document) -> BackendResult<String>;

    /// Ordered insert: stops at the first failure, earlier documents stay
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> BackendResult<Vec<String>>;

    async fn find_one(&self, collection: &str, filter: &Filter) -> BackendResult<Option<Document>>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> BackendResult<BoxStream<BackendResult<Document>>>;

    async fn count(&self, collection: &str, filter: &Filter) -> BackendResult<u64>;

    /// Patch the first match; with `upsert` a missing match is created from the
    /// filter's equalities. Returns whether a document was matched or created.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> BackendResult<bool>;

    async fn update_many(&self, collection: &str, filter: &Filter, update: &Update)
        -> BackendResult<u64>;

    async fn delete_one(&self, collection: &str, filter: &Filter) -> BackendResult<u64>;

    async fn delete_many(&self, collection: &str, filter: &Filter) -> BackendResult<u64>;

    /// Remove and return up to `limit` matches in `sort` order, atomically:
    /// either every returned document is gone or none is
    async fn find_and_delete_many(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: usize,
    ) -> BackendResult<Vec<Document>>;

    fn capabilities(&self) -> Capabilities;

    async fn is_alive(&self) -> bool;
}

/// Connects pools whose URI uses one scheme
#[async_trait]
pub trait BackendFactory: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// Capabilities every backend from this driver provides
    fn capabilities(&self) -> Capabilities;

    async fn connect(&self, pool: &Pool) -> BackendResult<Arc<dyn Backend>>;
}

/// Startup-time mapping from URI scheme to driver
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Arc<dyn BackendFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver compiled into this build
    pub fn with_builtin() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "memory")]
        registry.register(Arc::new(memory::MemoryDriver::new()));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn BackendFactory>) {
        self.drivers.insert(driver.scheme(), driver);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn BackendFactory>> {
        self.drivers.get(scheme).cloned()
    }

    pub fn for_pool(&self, pool: &Pool) -> BrokerResult<Arc<dyn BackendFactory>> {
        self.get(pool.scheme()).ok_or_else(|| {
            BrokerError::validation(format!(
                "no storage driver for scheme {:?} (pool {})",
                pool.scheme(),
                pool.name
            ))
        })
    }

    pub fn schemes(&self) -> Vec<&'static str> {
        let mut schemes: Vec<_> = self.drivers.keys().copied().collect();
        schemes.sort_unstable();
        schemes
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}
