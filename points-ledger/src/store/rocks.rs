//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `users` - Accounts (key: user id)
//! - `tokens` - Voteable tokens (key: normalized name)
//! - `votes` - Append-only vote log (key: UUIDv7, so key order is time order)
//! - `transactions` - Append-only journal (key: transaction id)
//! - `settings` - Singleton settings row (key: `system`)
//!
//! Values are bincode-encoded [`Versioned`] envelopes. Commits are checked
//! and written under one commit lock, then applied as a single `WriteBatch`.

use super::{
    ensure_distinct_keys, ChangeEvent, ChangeStream, Collection, CommitOutcome, LedgerStore,
    ScanDirection, Versioned, WriteOp,
};
use crate::{
    error::{Error, Result},
    Config,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// RocksDB-backed store
///
/// RocksDB calls block, so every operation runs on the blocking pool and
/// the caller's timeout stays effective while a write stalls.
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<RocksInner>,
}

struct RocksInner {
    db: DB,
    commit_lock: Mutex<()>,
    sync_writes: bool,
    changes: broadcast::Sender<ChangeEvent>,
}

impl fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.inner.db.path())
            .field("sync_writes", &self.inner.sync_writes)
            .finish()
    }
}

impl RocksStore {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Collection::ALL
            .iter()
            .map(|collection| {
                ColumnFamilyDescriptor::new(collection.name(), Self::cf_options(*collection))
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = Collection::ALL.len(),
            "Opened RocksDB store"
        );

        let (changes, _) = broadcast::channel(config.store.change_buffer.max(1));

        Ok(Self {
            inner: Arc::new(RocksInner {
                db,
                commit_lock: Mutex::new(()),
                sync_writes: config.rocksdb.sync_writes,
                changes,
            }),
        })
    }

    fn cf_options(collection: Collection) -> Options {
        let mut opts = Options::default();
        match collection {
            // Append-only logs compress well and are read rarely
            Collection::Votes | Collection::Transactions => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            // Hot rows, favour read speed
            Collection::Users | Collection::Tokens | Collection::Settings => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RocksInner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| Error::StoreUnavailable(format!("RocksDB task failed: {}", e)))?
    }
}

impl RocksInner {
    fn cf_handle(&self, collection: Collection) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(collection.name())
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", collection)))
    }

    fn read(&self, collection: Collection, key: &str) -> Result<Option<Versioned>> {
        let cf = self.cf_handle(collection)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn commit(&self, ops: Vec<WriteOp>) -> Result<CommitOutcome> {
        let mut applied = Vec::new();
        {
            let _guard = self.commit_lock.lock();

            let mut current_versions = Vec::with_capacity(ops.len());
            for op in &ops {
                let current = self.read(op.collection(), op.key())?.map(|v| v.version);
                if !op.expect().holds(current) {
                    return Ok(CommitOutcome::Aborted {
                        collection: op.collection(),
                        key: op.key().to_string(),
                    });
                }
                current_versions.push(current);
            }

            let mut batch = WriteBatch::default();
            for (op, current) in ops.into_iter().zip(current_versions) {
                if let WriteOp::Put {
                    collection,
                    key,
                    value,
                    ..
                } = op
                {
                    let version = current.unwrap_or(0) + 1;
                    let envelope = bincode::serialize(&Versioned {
                        version,
                        bytes: value,
                    })?;
                    batch.put_cf(self.cf_handle(collection)?, key.as_bytes(), &envelope);
                    applied.push(ChangeEvent {
                        collection,
                        key,
                        version,
                    });
                }
            }

            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(self.sync_writes);

            // Atomic commit
            self.db.write_opt(batch, &write_opts)?;
        }

        tracing::debug!(writes = applied.len(), "RocksDB batch written");

        for event in applied {
            let _ = self.changes.send(event);
        }

        Ok(CommitOutcome::Committed)
    }

    fn scan(
        &self,
        collection: Collection,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Versioned)>> {
        let cf = self.cf_handle(collection)?;
        let mode = match direction {
            ScanDirection::Forward => IteratorMode::Start,
            ScanDirection::Reverse => IteratorMode::End,
        };

        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, mode) {
            if let Some(limit) = limit {
                if rows.len() >= limit {
                    break;
                }
            }
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| Error::Storage(format!("Non UTF-8 key in {}: {}", collection, e)))?;
            let versioned: Versioned = bincode::deserialize(&value)?;
            rows.push((key, versioned));
        }

        Ok(rows)
    }
}

#[async_trait]
impl LedgerStore for RocksStore {
    fn backend_name(&self) -> &'static str {
        "rocksdb"
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Versioned>> {
        let key = key.to_string();
        self.blocking(move |inner| inner.read(collection, &key)).await
    }

    async fn run_atomic(&self, ops: Vec<WriteOp>) -> Result<CommitOutcome> {
        ensure_distinct_keys(&ops)?;
        self.blocking(move |inner| inner.commit(ops)).await
    }

    async fn scan(
        &self,
        collection: Collection,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Versioned)>> {
        self.blocking(move |inner| inner.scan(collection, direction, limit))
            .await
    }

    fn subscribe(&self, collection: Collection) -> Option<ChangeStream> {
        Some(ChangeStream::new(collection, self.inner.changes.subscribe()))
    }
}
