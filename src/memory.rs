use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::{
    AttrValue, Expr, Key, KeyValueStore, PageIterator, Row, TableSchema, Update,
};

/// Hermetic in-memory implementation of the key-value façade.
///
/// One mutex guards all tables, which makes every conditional operation
/// atomic the same way a single-item transactional store would. Paging is
/// offset-based; the marker is the offset of the next row.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    schemas: HashMap<String, TableSchema>,
    tables: HashMap<String, BTreeMap<MemKey, Row>>,
}

/// Orderable key part; `None` sorts first so rows missing the range
/// attribute stay stable at the front of an index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    None,
    Num(i64),
    Str(String),
    Other(String),
}

type MemKey = (KeyPart, KeyPart);

fn key_part(value: Option<&AttrValue>) -> KeyPart {
    match value {
        None => KeyPart::None,
        Some(AttrValue::Num(value)) => KeyPart::Num(*value),
        Some(AttrValue::Str(value)) => KeyPart::Str(value.clone()),
        Some(other) => KeyPart::Other(format!("{:?}", other)),
    }
}

impl MemoryState {
    fn schema(&self, table: &str) -> Result<&TableSchema, StoreError> {
        self.schemas
            .get(table)
            .ok_or_else(|| StoreError::Connection(format!("unknown table {}", table)))
    }

    fn storage_key(&self, table: &str, key: &Key) -> Result<MemKey, StoreError> {
        let schema = self.schema(table)?;
        match (schema.range_attr, &key.range) {
            (Some(_), Some(range)) => Ok((key_part(Some(&key.hash)), key_part(Some(range)))),
            (None, None) => Ok((key_part(Some(&key.hash)), KeyPart::None)),
            _ => Err(StoreError::Codec(format!(
                "key shape does not match table {}",
                table
            ))),
        }
    }

    fn row_key(&self, table: &str, row: &Row) -> Result<MemKey, StoreError> {
        let schema = self.schema(table)?;
        let hash = row.get(schema.hash_attr).ok_or_else(|| {
            StoreError::Codec(format!("row is missing key attribute {}", schema.hash_attr))
        })?;
        let range = match schema.range_attr {
            Some(attr) => Some(row.get(attr).ok_or_else(|| {
                StoreError::Codec(format!("row is missing key attribute {}", attr))
            })?),
            None => None,
        };
        Ok((key_part(Some(hash)), key_part(range)))
    }

    /// Resolves an index name to its (hash, range) attribute pair; `None`
    /// addresses the primary key.
    fn index_attrs(
        &self,
        table: &str,
        index: Option<&str>,
    ) -> Result<(String, Option<String>), StoreError> {
        let schema = self.schema(table)?;
        match index {
            None => Ok((
                schema.hash_attr.to_string(),
                schema.range_attr.map(str::to_string),
            )),
            Some(name) => {
                let index = schema.index(name).ok_or_else(|| {
                    StoreError::Connection(format!("unknown index {} on table {}", name, table))
                })?;
                Ok((
                    index.hash_attr.to_string(),
                    index.range_attr.map(str::to_string),
                ))
            }
        }
    }
}

fn page<T>(rows: Vec<T>, iter: &mut PageIterator) -> Vec<T> {
    let offset: usize = iter
        .marker()
        .and_then(|marker| marker.parse().ok())
        .unwrap_or(0);
    let page: Vec<T> = rows.into_iter().skip(offset).take(iter.size()).collect();
    let next = offset + page.len();
    if page.len() < iter.size() {
        iter.advance(None);
    } else {
        iter.advance(Some(next.to_string()));
    }
    page
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .schemas
            .entry(schema.name.to_string())
            .or_insert_with(|| schema.clone());
        state.tables.entry(schema.name.to_string()).or_default();
        Ok(())
    }

    async fn get(&self, table: &str, key: &Key) -> Result<Option<Row>, StoreError> {
        let state = self.state.lock().await;
        let storage_key = state.storage_key(table, key)?;
        Ok(state
            .tables
            .get(table)
            .and_then(|rows| rows.get(&storage_key))
            .cloned())
    }

    async fn put(&self, table: &str, row: Row) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let storage_key = state.row_key(table, &row)?;
        state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::Connection(format!("unknown table {}", table)))?
            .insert(storage_key, row);
        Ok(())
    }

    async fn conditional_update(
        &self,
        table: &str,
        key: &Key,
        update: Update,
        condition: Option<Expr>,
    ) -> Result<Row, StoreError> {
        let mut state = self.state.lock().await;
        let storage_key = state.storage_key(table, key)?;
        let (hash_attr, range_attr) = state.index_attrs(table, None)?;
        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::Connection(format!("unknown table {}", table)))?;

        let current = rows.get(&storage_key).cloned().unwrap_or_default();
        if let Some(condition) = &condition {
            if !condition.matches(&current) {
                return Err(StoreError::PreconditionFailed(format!(
                    "{} {:?}",
                    table, condition
                )));
            }
        }

        let mut row = current;
        // A fresh row carries its own key attributes.
        row.entry(hash_attr).or_insert_with(|| key.hash.clone());
        if let (Some(attr), Some(range)) = (range_attr, &key.range) {
            row.entry(attr).or_insert_with(|| range.clone());
        }
        for (attr, value) in update.sets {
            row.insert(attr, value);
        }
        for attr in update.removes {
            row.remove(&attr);
        }
        for (attr, delta) in update.increments {
            let current = match row.get(&attr) {
                Some(AttrValue::Num(value)) => *value,
                Some(_) => {
                    return Err(StoreError::Codec(format!(
                        "attribute {} is not numeric",
                        attr
                    )))
                }
                None => 0,
            };
            row.insert(attr, AttrValue::Num(current + delta));
        }
        rows.insert(storage_key, row.clone());
        Ok(row)
    }

    async fn conditional_delete(
        &self,
        table: &str,
        key: &Key,
        condition: Option<Expr>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let storage_key = state.storage_key(table, key)?;
        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::Connection(format!("unknown table {}", table)))?;
        let current = rows.get(&storage_key).cloned().unwrap_or_default();
        if let Some(condition) = &condition {
            if !condition.matches(&current) {
                return Err(StoreError::PreconditionFailed(format!(
                    "{} {:?}",
                    table, condition
                )));
            }
        }
        rows.remove(&storage_key);
        Ok(())
    }

    async fn query_index(
        &self,
        table: &str,
        index: Option<&str>,
        hash: AttrValue,
        range_begins_with: Option<&str>,
        iter: &mut PageIterator,
    ) -> Result<Vec<Row>, StoreError> {
        let state = self.state.lock().await;
        let (hash_attr, range_attr) = state.index_attrs(table, index)?;
        let mut matches: Vec<Row> = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::Connection(format!("unknown table {}", table)))?
            .values()
            .filter(|row| row.get(&hash_attr) == Some(&hash))
            .filter(|row| match range_begins_with {
                None => true,
                Some(prefix) => match range_attr
                    .as_deref()
                    .and_then(|attr| row.get(attr))
                    .and_then(AttrValue::as_str)
                {
                    Some(value) => value.starts_with(prefix),
                    None => false,
                },
            })
            .cloned()
            .collect();
        if let Some(attr) = &range_attr {
            matches.sort_by(|a, b| key_part(a.get(attr)).cmp(&key_part(b.get(attr))));
        }
        Ok(page(matches, iter))
    }

    async fn scan_index(
        &self,
        table: &str,
        index: Option<&str>,
        iter: &mut PageIterator,
    ) -> Result<Vec<Row>, StoreError> {
        let state = self.state.lock().await;
        let (hash_attr, range_attr) = state.index_attrs(table, index)?;
        let mut matches: Vec<Row> = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::Connection(format!("unknown table {}", table)))?
            .values()
            .filter(|row| index.is_none() || row.contains_key(&hash_attr))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            let left = (key_part(a.get(&hash_attr)), key_part(range_attr.as_deref().and_then(|attr| a.get(attr))));
            let right = (key_part(b.get(&hash_attr)), key_part(range_attr.as_deref().and_then(|attr| b.get(attr))));
            left.cmp(&right)
        });
        Ok(page(matches, iter))
    }
}
