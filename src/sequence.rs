use std::sync::Arc;

use crate::codec::SEQUENCES_TABLE;
use crate::error::StoreError;
use crate::store::{Key, KeyValueStore, Update};

/// Monotonic ID generator: a conditional increment-and-read on a single
/// store row keyed by name. Total: the first call creates the row.
#[derive(Clone)]
pub struct Sequence {
    store: Arc<dyn KeyValueStore>,
}

impl Sequence {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Returns the post-increment value of the named sequence.
    pub async fn next(&self, name: &str) -> Result<i64, StoreError> {
        let row = self
            .store
            .conditional_update(
                SEQUENCES_TABLE,
                &Key::hash(name),
                Update::new().increment("Seq", 1),
                None,
            )
            .await?;
        row.get("Seq")
            .and_then(crate::store::AttrValue::as_num)
            .ok_or_else(|| StoreError::Codec(format!("sequence {} has no numeric 'Seq'", name)))
    }
}

#[cfg(test)]
mod test_sequence {
    use super::*;
    use crate::codec::sequence_table_schema;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn parallel_callers_get_distinct_increasing_values() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_table(&sequence_table_schema()).await.unwrap();
        let sequence = Sequence::new(store);

        let mut handles = Vec::new();
        for _ in 0..25 {
            let sequence = sequence.clone();
            handles.push(tokio::spawn(
                async move { sequence.next("monitor-tasks").await },
            ));
        }
        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap());
        }
        values.sort_unstable();
        let expected: Vec<i64> = (1..=25).collect();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn independent_names_do_not_interfere() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_table(&sequence_table_schema()).await.unwrap();
        let sequence = Sequence::new(store);
        assert_eq!(sequence.next("a").await.unwrap(), 1);
        assert_eq!(sequence.next("b").await.unwrap(), 1);
        assert_eq!(sequence.next("a").await.unwrap(), 2);
    }
}
