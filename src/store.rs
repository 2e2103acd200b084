use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::StoreError;

/// A typed attribute value as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Str(String),
    Num(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    StrSet(BTreeSet<String>),
    NumSet(BTreeSet<i64>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<i64> {
        match self {
            Self::Num(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::StrSet(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_num_set(&self) -> Option<&BTreeSet<i64>> {
        match self {
            Self::NumSet(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Num(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for AttrValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// A stored row: attribute short-name to value.
pub type Row = HashMap<String, AttrValue>;

/// Predicate algebra for conditional writes.
///
/// Every mutator takes one of these; a predicate that evaluates to false
/// against the current row (absent rows have no attributes) is signaled as
/// [`StoreError::PreconditionFailed`].
#[derive(Debug, Clone)]
pub enum Expr {
    Eq(String, AttrValue),
    Not(Box<Expr>),
    Exists(String),
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    In(String, Vec<AttrValue>),
    BeginsWith(String, String),
}

impl Expr {
    pub fn eq(attr: &str, value: impl Into<AttrValue>) -> Self {
        Self::Eq(attr.to_string(), value.into())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Self::Not(Box::new(expr))
    }

    pub fn exists(attr: &str) -> Self {
        Self::Exists(attr.to_string())
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Self::Or(Box::new(left), Box::new(right))
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Self::And(Box::new(left), Box::new(right))
    }

    pub fn is_in(attr: &str, values: Vec<AttrValue>) -> Self {
        Self::In(attr.to_string(), values)
    }

    pub fn begins_with(attr: &str, prefix: &str) -> Self {
        Self::BeginsWith(attr.to_string(), prefix.to_string())
    }

    /// Evaluates the predicate against a row. Absent attributes never
    /// compare equal and never begin with anything.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Eq(attr, value) => row.get(attr) == Some(value),
            Self::Not(expr) => !expr.matches(row),
            Self::Exists(attr) => row.contains_key(attr),
            Self::Or(left, right) => left.matches(row) || right.matches(row),
            Self::And(left, right) => left.matches(row) && right.matches(row),
            Self::In(attr, values) => match row.get(attr) {
                Some(value) => values.contains(value),
                None => false,
            },
            Self::BeginsWith(attr, prefix) => match row.get(attr).and_then(AttrValue::as_str) {
                Some(value) => value.starts_with(prefix),
                None => false,
            },
        }
    }
}

/// Mutation applied by `conditional_update`.
#[derive(Debug, Clone, Default)]
pub struct Update {
    pub sets: Vec<(String, AttrValue)>,
    pub removes: Vec<String>,
    pub increments: Vec<(String, i64)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, attr: &str, value: impl Into<AttrValue>) -> Self {
        self.sets.push((attr.to_string(), value.into()));
        self
    }

    pub fn remove(mut self, attr: &str) -> Self {
        self.removes.push(attr.to_string());
        self
    }

    /// Numeric increment; an absent attribute is treated as zero.
    pub fn increment(mut self, attr: &str, delta: i64) -> Self {
        self.increments.push((attr.to_string(), delta));
        self
    }
}

/// Primary key of a row.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub hash: AttrValue,
    pub range: Option<AttrValue>,
}

impl Key {
    pub fn hash(hash: impl Into<AttrValue>) -> Self {
        Self {
            hash: hash.into(),
            range: None,
        }
    }

    pub fn with_range(hash: impl Into<AttrValue>, range: impl Into<AttrValue>) -> Self {
        Self {
            hash: hash.into(),
            range: Some(range.into()),
        }
    }
}

/// Secondary index description: rows appear in an index only while the
/// index hash attribute is present on the row.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub name: &'static str,
    pub hash_attr: &'static str,
    pub range_attr: Option<&'static str>,
}

/// Table description handed to `ensure_table`.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: &'static str,
    pub hash_attr: &'static str,
    pub range_attr: Option<&'static str>,
    pub indices: Vec<IndexSchema>,
}

impl TableSchema {
    pub(crate) fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indices.iter().find(|index| index.name == name)
    }
}

/// Cursor for paged queries and scans.
///
/// ```ignore
/// let mut iter = PageIterator::new().page_size(100);
/// while iter.has_next() {
///     for row in store.query_index(table, None, hash.clone(), None, &mut iter).await? {
///         ...
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct PageIterator {
    page_size: usize,
    marker: Option<String>,
    begun: bool,
}

impl PageIterator {
    pub fn new() -> Self {
        Self {
            page_size: 100,
            marker: None,
            begun: false,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn size(&self) -> usize {
        self.page_size
    }

    pub fn has_next(&self) -> bool {
        !self.begun || self.marker.is_some()
    }

    pub fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    /// Called by drivers after serving a page.
    pub fn advance(&mut self, marker: Option<String>) {
        self.begun = true;
        self.marker = marker;
    }
}

impl Default for PageIterator {
    fn default() -> Self {
        Self::new()
    }
}

/// Narrow interface over the transactional key-value store.
///
/// Contract highlights:
/// - `conditional_update` evaluates the predicate against the current row
///   (an absent row has no attributes), applies the mutation atomically,
///   creates the row if it did not exist, and returns the post-update row.
/// - `conditional_delete` with a predicate fails with `PreconditionFailed`
///   when the predicate does not hold; deleting an absent row without a
///   predicate is a no-op.
/// - `query_index`/`scan_index` with `index = None` address the primary
///   key; rows belong to a secondary index only while its hash attribute
///   is present.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError>;

    async fn get(&self, table: &str, key: &Key) -> Result<Option<Row>, StoreError>;

    async fn put(&self, table: &str, row: Row) -> Result<(), StoreError>;

    async fn conditional_update(
        &self,
        table: &str,
        key: &Key,
        update: Update,
        condition: Option<Expr>,
    ) -> Result<Row, StoreError>;

    async fn conditional_delete(
        &self,
        table: &str,
        key: &Key,
        condition: Option<Expr>,
    ) -> Result<(), StoreError>;

    async fn query_index(
        &self,
        table: &str,
        index: Option<&str>,
        hash: AttrValue,
        range_begins_with: Option<&str>,
        iter: &mut PageIterator,
    ) -> Result<Vec<Row>, StoreError>;

    async fn scan_index(
        &self,
        table: &str,
        index: Option<&str>,
        iter: &mut PageIterator,
    ) -> Result<Vec<Row>, StoreError>;
}

#[cfg(test)]
mod test_store {
    use super::*;

    fn row(attrs: &[(&str, AttrValue)]) -> Row {
        attrs
            .iter()
            .map(|(attr, value)| (attr.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn eq_and_exists() {
        let row = row(&[("mid", AttrValue::from("#"))]);
        assert!(Expr::eq("mid", "#").matches(&row));
        assert!(!Expr::eq("mid", "$").matches(&row));
        assert!(Expr::exists("mid").matches(&row));
        assert!(!Expr::exists("agn").matches(&row));
        assert!(Expr::not(Expr::exists("agn")).matches(&row));
    }

    #[test]
    fn in_and_begins_with() {
        let row = row(&[("mid", AttrValue::from("$"))]);
        assert!(Expr::is_in("mid", vec![AttrValue::from("#"), AttrValue::from("$")]).matches(&row));
        assert!(!Expr::is_in("mid", vec![AttrValue::from("#")]).matches(&row));
        assert!(Expr::begins_with("mid", "$").matches(&row));
        assert!(!Expr::begins_with("agn", "$").matches(&row));
    }

    #[test]
    fn absent_attributes_never_compare() {
        let empty = Row::new();
        assert!(!Expr::eq("mid", "#").matches(&empty));
        assert!(Expr::or(Expr::eq("mid", "#"), Expr::not(Expr::exists("mid"))).matches(&empty));
    }

    #[test]
    fn page_iterator_protocol() {
        let mut iter = PageIterator::new().page_size(2);
        assert!(iter.has_next());
        iter.advance(Some("2".to_string()));
        assert!(iter.has_next());
        iter.advance(None);
        assert!(!iter.has_next());
    }
}
