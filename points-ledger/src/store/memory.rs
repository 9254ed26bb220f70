//! In-process store
//!
//! Fallback backend for demo and offline mode. Same commit semantics as the
//! RocksDB store; contents are lost when the process exits.

use super::{
    ensure_distinct_keys, ChangeEvent, ChangeStream, Collection, CommitOutcome, LedgerStore,
    ScanDirection, Versioned, WriteOp,
};
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;

type Table = BTreeMap<String, Versioned>;

/// In-memory store
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Collection, Table>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    /// Empty store with a change channel of `change_buffer` slots
    pub fn new(change_buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(change_buffer.max(1));
        let tables = Collection::ALL
            .iter()
            .map(|collection| (*collection, Table::new()))
            .collect();
        Self {
            tables: RwLock::new(tables),
            changes,
        }
    }

    /// Number of records in a collection
    pub fn len(&self, collection: Collection) -> usize {
        self.tables
            .read()
            .get(&collection)
            .map(|table| table.len())
            .unwrap_or(0)
    }

    /// Whether a collection is empty
    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Versioned>> {
        Ok(self
            .tables
            .read()
            .get(&collection)
            .and_then(|table| table.get(key))
            .cloned())
    }

    async fn run_atomic(&self, ops: Vec<WriteOp>) -> Result<CommitOutcome> {
        ensure_distinct_keys(&ops)?;

        let mut applied = Vec::new();
        {
            let mut tables = self.tables.write();

            // Check every precondition before touching anything
            for op in &ops {
                let current = tables
                    .get(&op.collection())
                    .and_then(|table| table.get(op.key()))
                    .map(|value| value.version);
                if !op.expect().holds(current) {
                    return Ok(CommitOutcome::Aborted {
                        collection: op.collection(),
                        key: op.key().to_string(),
                    });
                }
            }

            for op in ops {
                if let WriteOp::Put {
                    collection,
                    key,
                    value,
                    ..
                } = op
                {
                    let table = tables.entry(collection).or_default();
                    let version = table.get(&key).map(|v| v.version).unwrap_or(0) + 1;
                    table.insert(
                        key.clone(),
                        Versioned {
                            version,
                            bytes: value,
                        },
                    );
                    applied.push(ChangeEvent {
                        collection,
                        key,
                        version,
                    });
                }
            }
        }

        for event in applied {
            // No receivers is fine
            let _ = self.changes.send(event);
        }

        Ok(CommitOutcome::Committed)
    }

    async fn scan(
        &self,
        collection: Collection,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Versioned)>> {
        let tables = self.tables.read();
        let table = match tables.get(&collection) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };
        let limit = limit.unwrap_or(usize::MAX);
        let rows: Vec<(String, Versioned)> = match direction {
            ScanDirection::Forward => table
                .iter()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ScanDirection::Reverse => table
                .iter()
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(rows)
    }

    fn subscribe(&self, collection: Collection) -> Option<ChangeStream> {
        Some(ChangeStream::new(collection, self.changes.subscribe()))
    }
}
