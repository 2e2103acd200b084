use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::{
    AttrValue, Expr, Key, KeyValueStore, PageIterator, Row, TableSchema, Update,
};

/// Connection settings for the durable SurrealDB-backed store, read from
/// the environment by default.
#[derive(Debug)]
pub struct DbConnection {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub namespace: String,
    pub database: String,
}

impl Default for DbConnection {
    fn default() -> Self {
        Self {
            username: env::var("TASKMON_USERNAME").unwrap_or_default(),
            password: env::var("TASKMON_PASSWORD").unwrap_or_default(),
            port: env::var("TASKMON_PORT")
                .unwrap_or("8000".to_string())
                .parse::<u16>()
                .unwrap_or(8000),
            host: env::var("TASKMON_HOST").unwrap_or_default(),
            namespace: env::var("TASKMON_NAMESPACE").unwrap_or_default(),
            database: env::var("TASKMON_DB").unwrap_or_default(),
        }
    }
}

/// SurrealDB driver for the key-value façade.
///
/// Every record stores its attribute row under a single `attrs` object;
/// the record id is derived from the key so conditional operations can
/// address exactly one record. Conditional update/delete run inside a
/// transaction: the predicate is evaluated over a snapshot (`$cur`) and
/// the mutation only happens when it holds, which is what gives the
/// façade its single-item compare-and-set semantics.
#[derive(Debug)]
pub struct Db {
    pub client: Arc<Surreal<Client>>,
    schemas: Mutex<HashMap<String, TableSchema>>,
}

impl Db {
    pub async fn new(config: Option<DbConnection>) -> Result<Self, StoreError> {
        let config: DbConnection = config.unwrap_or_default();
        let address: String = format!("{}:{}", config.host, config.port);
        match Surreal::new::<Ws>(address).await {
            Ok(client) => {
                if let Err(error) = client
                    .signin(Root {
                        username: config.username.as_str(),
                        password: config.password.as_str(),
                    })
                    .await
                {
                    return Err(StoreError::Connection(error.to_string()));
                }
                if let Err(error) = client
                    .use_ns(config.namespace)
                    .use_db(config.database)
                    .await
                {
                    return Err(StoreError::Connection(error.to_string()));
                }
                Ok(Self {
                    client: Arc::new(client),
                    schemas: Mutex::new(HashMap::new()),
                })
            }
            Err(error) => Err(StoreError::Connection(error.to_string())),
        }
    }

    async fn schema(&self, table: &str) -> Result<TableSchema, StoreError> {
        let schemas = self.schemas.lock().await;
        schemas
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::Connection(format!("unknown table {}", table)))
    }

    /// Record id string for a key; hash and range parts joined by a unit
    /// separator so composite keys stay unambiguous.
    fn record_key(key: &Key) -> String {
        let hash = key_part(&key.hash);
        match &key.range {
            Some(range) => format!("{}\u{1f}{}", hash, key_part(range)),
            None => hash,
        }
    }
}

fn key_part(value: &AttrValue) -> String {
    match value {
        AttrValue::Str(value) => value.clone(),
        AttrValue::Num(value) => crate::codec::sort_key(*value),
        other => format!("{:?}", other),
    }
}

/// JSON image of an attribute value. Bytes and sets are wrapped in
/// single-key objects so they survive the round trip unambiguously.
fn attr_to_json(value: &AttrValue) -> Value {
    match value {
        AttrValue::Str(value) => Value::String(value.clone()),
        AttrValue::Num(value) => Value::Number(Number::from(*value)),
        AttrValue::Bool(value) => Value::Bool(*value),
        AttrValue::Bytes(bytes) => {
            let hex: String = bytes.iter().map(|byte| format!("{:02x}", byte)).collect();
            let mut wrapper = Map::new();
            wrapper.insert("$bin".to_string(), Value::String(hex));
            Value::Object(wrapper)
        }
        AttrValue::StrSet(values) => {
            let mut wrapper = Map::new();
            wrapper.insert(
                "$ss".to_string(),
                Value::Array(values.iter().map(|value| Value::String(value.clone())).collect()),
            );
            Value::Object(wrapper)
        }
        AttrValue::NumSet(values) => {
            let mut wrapper = Map::new();
            wrapper.insert(
                "$ns".to_string(),
                Value::Array(
                    values
                        .iter()
                        .map(|value| Value::Number(Number::from(*value)))
                        .collect(),
                ),
            );
            Value::Object(wrapper)
        }
    }
}

fn attr_from_json(value: &Value) -> Option<AttrValue> {
    match value {
        Value::String(value) => Some(AttrValue::Str(value.clone())),
        Value::Number(value) => value.as_i64().map(AttrValue::Num),
        Value::Bool(value) => Some(AttrValue::Bool(*value)),
        Value::Object(wrapper) => {
            if let Some(Value::String(hex)) = wrapper.get("$bin") {
                let mut bytes = Vec::with_capacity(hex.len() / 2);
                for index in (0..hex.len()).step_by(2) {
                    bytes.push(u8::from_str_radix(hex.get(index..index + 2)?, 16).ok()?);
                }
                return Some(AttrValue::Bytes(bytes));
            }
            if let Some(Value::Array(values)) = wrapper.get("$ss") {
                return Some(AttrValue::StrSet(
                    values
                        .iter()
                        .filter_map(|value| value.as_str().map(str::to_string))
                        .collect(),
                ));
            }
            if let Some(Value::Array(values)) = wrapper.get("$ns") {
                return Some(AttrValue::NumSet(
                    values.iter().filter_map(Value::as_i64).collect(),
                ));
            }
            None
        }
        _ => None,
    }
}

fn row_to_json(row: &Row) -> Value {
    let mut object = Map::new();
    for (attr, value) in row {
        object.insert(attr.clone(), attr_to_json(value));
    }
    Value::Object(object)
}

fn row_from_json(value: &Value) -> Row {
    let mut row = Row::new();
    if let Value::Object(object) = value {
        for (attr, value) in object {
            if let Some(value) = attr_from_json(value) {
                row.insert(attr.clone(), value);
            }
        }
    }
    row
}

/// Renders a predicate over the `$cur` snapshot, pushing literals into the
/// bound-parameter map. Attribute short names are `[A-Za-z0-9]` only, so
/// direct interpolation is safe.
fn render_expr(expr: &Expr, params: &mut Map<String, Value>) -> String {
    let mut bind = |value: Value, params: &mut Map<String, Value>| {
        let name = format!("p{}", params.len());
        params.insert(name.clone(), value);
        name
    };
    match expr {
        Expr::Eq(attr, value) => {
            let name = bind(attr_to_json(value), params);
            format!("($cur.{} = ${})", attr, name)
        }
        Expr::Not(inner) => format!("(!{})", render_expr(inner, params)),
        Expr::Exists(attr) => format!("($cur.{} != NONE)", attr),
        Expr::Or(left, right) => format!(
            "({} OR {})",
            render_expr(left, params),
            render_expr(right, params)
        ),
        Expr::And(left, right) => format!(
            "({} AND {})",
            render_expr(left, params),
            render_expr(right, params)
        ),
        Expr::In(attr, values) => {
            let name = bind(
                Value::Array(values.iter().map(attr_to_json).collect()),
                params,
            );
            format!("($cur.{} IN ${})", attr, name)
        }
        Expr::BeginsWith(attr, prefix) => {
            let name = bind(Value::String(prefix.clone()), params);
            format!("string::starts_with($cur.{} ?? '', ${})", attr, name)
        }
    }
}

fn render_update(update: &Update, params: &mut Map<String, Value>) -> String {
    let mut assignments: Vec<String> = Vec::new();
    for (attr, value) in &update.sets {
        let name = format!("p{}", params.len());
        params.insert(name.clone(), attr_to_json(value));
        assignments.push(format!("attrs.{} = ${}", attr, name));
    }
    for attr in &update.removes {
        assignments.push(format!("attrs.{} = NONE", attr));
    }
    for (attr, delta) in &update.increments {
        assignments.push(format!("attrs.{} = ($cur.{} ?? 0) + {}", attr, attr, delta));
    }
    assignments.join(", ")
}

#[async_trait]
impl KeyValueStore for Db {
    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let stmt = format!("DEFINE TABLE IF NOT EXISTS `{}`;", schema.name);
        if let Err(error) = self.client.query(stmt).await {
            return Err(StoreError::Connection(error.to_string()));
        }
        let mut schemas = self.schemas.lock().await;
        schemas
            .entry(schema.name.to_string())
            .or_insert_with(|| schema.clone());
        Ok(())
    }

    async fn get(&self, table: &str, key: &Key) -> Result<Option<Row>, StoreError> {
        let stmt = "SELECT VALUE attrs FROM type::thing($table, $key);";
        match self
            .client
            .query(stmt)
            .bind(("table", table.to_string()))
            .bind(("key", Self::record_key(key)))
            .await
        {
            Ok(mut response) => match response.take::<Vec<Value>>(0) {
                Ok(rows) => Ok(rows.first().map(row_from_json)),
                Err(error) => Err(StoreError::Connection(error.to_string())),
            },
            Err(error) => Err(StoreError::Connection(error.to_string())),
        }
    }

    async fn put(&self, table: &str, row: Row) -> Result<(), StoreError> {
        let schema = self.schema(table).await?;
        let hash = row
            .get(schema.hash_attr)
            .ok_or_else(|| StoreError::Codec(format!("row is missing {}", schema.hash_attr)))?
            .clone();
        let key = match schema.range_attr {
            Some(attr) => Key {
                hash,
                range: Some(
                    row.get(attr)
                        .ok_or_else(|| StoreError::Codec(format!("row is missing {}", attr)))?
                        .clone(),
                ),
            },
            None => Key { hash, range: None },
        };
        let stmt = "UPSERT type::thing($table, $key) CONTENT { attrs: $attrs };";
        match self
            .client
            .query(stmt)
            .bind(("table", table.to_string()))
            .bind(("key", Self::record_key(&key)))
            .bind(("attrs", row_to_json(&row)))
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => Err(StoreError::Connection(error.to_string())),
        }
    }

    async fn conditional_update(
        &self,
        table: &str,
        key: &Key,
        update: Update,
        condition: Option<Expr>,
    ) -> Result<Row, StoreError> {
        let schema = self.schema(table).await?;
        let mut params = Map::new();
        let predicate = match &condition {
            Some(expr) => render_expr(expr, &mut params),
            None => "true".to_string(),
        };
        // A fresh row carries its own key attributes.
        let mut update = update;
        update.sets.insert(
            0,
            (schema.hash_attr.to_string(), key.hash.clone()),
        );
        if let (Some(attr), Some(range)) = (schema.range_attr, &key.range) {
            update.sets.insert(1, (attr.to_string(), range.clone()));
        }
        let assignments = render_update(&update, &mut params);
        // Statement slots: 0 = LET $cur, 1 = LET $ok, 2 = IF. The UPSERT
        // addresses one record, so a present slot-2 value means the
        // predicate held; an absent one means it failed.
        let stmt = format!(
            "BEGIN TRANSACTION; \
             LET $cur = (SELECT VALUE attrs FROM type::thing($table, $key))[0]; \
             LET $ok = {predicate}; \
             IF $ok {{ UPSERT type::thing($table, $key) SET {assignments} RETURN AFTER }}; \
             COMMIT TRANSACTION;"
        );
        match self
            .client
            .query(stmt)
            .bind(("table", table.to_string()))
            .bind(("key", Self::record_key(key)))
            .bind(params)
            .await
        {
            Ok(mut response) => match response.take::<Option<Value>>(2) {
                Ok(Some(result)) => {
                    let record = match &result {
                        Value::Array(records) => records.first().cloned().unwrap_or(Value::Null),
                        other => other.clone(),
                    };
                    match record.get("attrs") {
                        Some(attrs) => Ok(row_from_json(attrs)),
                        None => Err(StoreError::Codec(format!(
                            "malformed record in table {}",
                            table
                        ))),
                    }
                }
                Ok(None) => Err(StoreError::PreconditionFailed(format!(
                    "{} {:?}",
                    table, condition
                ))),
                Err(error) => Err(StoreError::Connection(error.to_string())),
            },
            Err(error) => Err(StoreError::Connection(error.to_string())),
        }
    }

    async fn conditional_delete(
        &self,
        table: &str,
        key: &Key,
        condition: Option<Expr>,
    ) -> Result<(), StoreError> {
        let mut params = Map::new();
        let predicate = match &condition {
            Some(expr) => render_expr(expr, &mut params),
            None => "true".to_string(),
        };
        // Statement slots: 0 = LET $cur, 1 = LET $ok, 2 = IF; the IF block
        // yields true after deleting, false when the predicate failed.
        let stmt = format!(
            "BEGIN TRANSACTION; \
             LET $cur = (SELECT VALUE attrs FROM type::thing($table, $key))[0]; \
             LET $ok = {predicate}; \
             IF $ok {{ DELETE type::thing($table, $key); RETURN true; }} ELSE {{ RETURN false; }}; \
             COMMIT TRANSACTION;"
        );
        match self
            .client
            .query(stmt)
            .bind(("table", table.to_string()))
            .bind(("key", Self::record_key(key)))
            .bind(params)
            .await
        {
            Ok(mut response) => match response.take::<Option<bool>>(2) {
                Ok(Some(true)) => Ok(()),
                Ok(_) => Err(StoreError::PreconditionFailed(format!(
                    "{} {:?}",
                    table, condition
                ))),
                Err(error) => Err(StoreError::Connection(error.to_string())),
            },
            Err(error) => Err(StoreError::Connection(error.to_string())),
        }
    }

    async fn query_index(
        &self,
        table: &str,
        index: Option<&str>,
        hash: AttrValue,
        range_begins_with: Option<&str>,
        iter: &mut PageIterator,
    ) -> Result<Vec<Row>, StoreError> {
        let schema = self.schema(table).await?;
        let (hash_attr, range_attr) = match index {
            None => (schema.hash_attr, schema.range_attr),
            Some(name) => {
                let index = schema.index(name).ok_or_else(|| {
                    StoreError::Connection(format!("unknown index {} on table {}", name, table))
                })?;
                (index.hash_attr, index.range_attr)
            }
        };
        let offset: usize = iter
            .marker()
            .and_then(|marker| marker.parse().ok())
            .unwrap_or(0);
        let mut stmt = format!(
            "SELECT VALUE attrs FROM type::table($table) WHERE attrs.{} = $hash",
            hash_attr
        );
        if let Some(attr) = range_attr {
            if range_begins_with.is_some() {
                stmt.push_str(&format!(
                    " AND string::starts_with(attrs.{} ?? '', $prefix)",
                    attr
                ));
            }
            stmt.push_str(&format!(" ORDER BY attrs.{} ASC", attr));
        }
        stmt.push_str(&format!(" LIMIT {} START {};", iter.size(), offset));
        let mut query = self
            .client
            .query(stmt)
            .bind(("table", table.to_string()))
            .bind(("hash", attr_to_json(&hash)));
        if let Some(prefix) = range_begins_with {
            query = query.bind(("prefix", prefix.to_string()));
        }
        match query.await {
            Ok(mut response) => match response.take::<Vec<Value>>(0) {
                Ok(values) => {
                    let rows: Vec<Row> = values.iter().map(row_from_json).collect();
                    if rows.len() < iter.size() {
                        iter.advance(None);
                    } else {
                        iter.advance(Some((offset + rows.len()).to_string()));
                    }
                    Ok(rows)
                }
                Err(error) => Err(StoreError::Connection(error.to_string())),
            },
            Err(error) => Err(StoreError::Connection(error.to_string())),
        }
    }

    async fn scan_index(
        &self,
        table: &str,
        index: Option<&str>,
        iter: &mut PageIterator,
    ) -> Result<Vec<Row>, StoreError> {
        let schema = self.schema(table).await?;
        let hash_attr = match index {
            None => schema.hash_attr,
            Some(name) => {
                schema
                    .index(name)
                    .ok_or_else(|| {
                        StoreError::Connection(format!(
                            "unknown index {} on table {}",
                            name, table
                        ))
                    })?
                    .hash_attr
            }
        };
        let offset: usize = iter
            .marker()
            .and_then(|marker| marker.parse().ok())
            .unwrap_or(0);
        let filter = match index {
            None => String::new(),
            Some(_) => format!(" WHERE attrs.{} != NONE", hash_attr),
        };
        let stmt = format!(
            "SELECT VALUE attrs FROM type::table($table){} ORDER BY attrs.{} ASC LIMIT {} START {};",
            filter,
            hash_attr,
            iter.size(),
            offset
        );
        match self
            .client
            .query(stmt)
            .bind(("table", table.to_string()))
            .await
        {
            Ok(mut response) => match response.take::<Vec<Value>>(0) {
                Ok(values) => {
                    let rows: Vec<Row> = values.iter().map(row_from_json).collect();
                    if rows.len() < iter.size() {
                        iter.advance(None);
                    } else {
                        iter.advance(Some((offset + rows.len()).to_string()));
                    }
                    Ok(rows)
                }
                Err(error) => Err(StoreError::Connection(error.to_string())),
            },
            Err(error) => Err(StoreError::Connection(error.to_string())),
        }
    }
}

#[cfg(test)]
mod test_database {
    use super::*;
    use crate::codec::task_table_schema;

    fn configure_database_env() {
        env::set_var("TASKMON_USERNAME", "test".to_string());
        env::set_var("TASKMON_PASSWORD", "test".to_string());
        env::set_var("TASKMON_PORT", "8000".to_string());
        env::set_var("TASKMON_HOST", "127.0.0.1".to_string());
        env::set_var("TASKMON_NAMESPACE", "taskmon_dev".to_string());
        env::set_var("TASKMON_DB", "taskmon".to_string());
    }

    #[tokio::test]
    #[ignore = "requires a running SurrealDB"]
    async fn test_connection_using_env() {
        configure_database_env();
        let result: Result<Db, StoreError> = Db::new(None).await;
        assert!(result.is_ok(), "{}", result.unwrap_err());
    }

    #[tokio::test]
    #[ignore = "requires a running SurrealDB"]
    async fn test_conditional_update_round_trip() {
        configure_database_env();
        let db = Db::new(None).await.unwrap();
        db.ensure_table(&task_table_schema()).await.unwrap();
        let key = Key::hash(1i64);
        let row = db
            .conditional_update(
                "monitor-tasks",
                &key,
                Update::new().set("mid", "#").increment("cnt", 1),
                None,
            )
            .await
            .unwrap();
        assert_eq!(row.get("mid"), Some(&AttrValue::from("#")));
    }
}
