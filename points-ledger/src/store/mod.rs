//! Ledger store abstraction
//!
//! The ledger talks to persistence only through [`LedgerStore`]: keyed
//! versioned values grouped in collections, one multi-record atomic commit
//! with optimistic preconditions, ordered scans and an optional change
//! stream. Two backends exist:
//!
//! - [`rocks::RocksStore`] - durable, one column family per collection
//! - [`memory::MemoryStore`] - in-process fallback for demo and offline mode
//!
//! Services never call a backend directly. They go through [`Gateway`],
//! which bounds every call with a timeout and (de)serializes typed records.

pub mod memory;
pub mod rocks;

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;

/// Persisted collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// User accounts (key: user id)
    Users,
    /// Voteable tokens (key: normalized name)
    Tokens,
    /// Vote records (key: UUIDv7)
    Votes,
    /// Transaction journal (key: transaction id)
    Transactions,
    /// Singleton settings row
    Settings,
}

impl Collection {
    /// Every collection, in declaration order
    pub const ALL: [Collection; 5] = [
        Collection::Users,
        Collection::Tokens,
        Collection::Votes,
        Collection::Transactions,
        Collection::Settings,
    ];

    /// Collection name (column family name in RocksDB)
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Tokens => "tokens",
            Collection::Votes => "votes",
            Collection::Transactions => "transactions",
            Collection::Settings => "settings",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Stored value with its version; versions start at 1 and grow by 1 per write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    /// Version of this value
    pub version: u64,
    /// Encoded record
    pub bytes: Vec<u8>,
}

/// Precondition attached to a write or check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// No precondition
    Any,
    /// Key must not exist
    Absent,
    /// Key must exist at exactly this version
    Version(u64),
}

impl Expect {
    /// Whether the current version satisfies the precondition
    pub fn holds(&self, current: Option<u64>) -> bool {
        match (self, current) {
            (Expect::Any, _) => true,
            (Expect::Absent, None) => true,
            (Expect::Absent, Some(_)) => false,
            (Expect::Version(expected), Some(actual)) => *expected == actual,
            (Expect::Version(_), None) => false,
        }
    }
}

/// One operation in an atomic commit
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Write a value if the precondition holds
    Put {
        /// Collection
        collection: Collection,
        /// Key
        key: String,
        /// Encoded value
        value: Vec<u8>,
        /// Precondition
        expect: Expect,
    },
    /// Assert a precondition without writing
    Check {
        /// Collection
        collection: Collection,
        /// Key
        key: String,
        /// Precondition
        expect: Expect,
    },
}

impl WriteOp {
    /// Collection the operation targets
    pub fn collection(&self) -> Collection {
        match self {
            WriteOp::Put { collection, .. } | WriteOp::Check { collection, .. } => *collection,
        }
    }

    /// Key the operation targets
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Check { key, .. } => key,
        }
    }

    /// Precondition
    pub fn expect(&self) -> Expect {
        match self {
            WriteOp::Put { expect, .. } | WriteOp::Check { expect, .. } => *expect,
        }
    }
}

/// Result of an atomic commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every operation applied
    Committed,
    /// A precondition failed; nothing applied
    Aborted {
        /// Collection of the first failed precondition
        collection: Collection,
        /// Key of the first failed precondition
        key: String,
    },
}

/// Scan order by key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Ascending keys
    Forward,
    /// Descending keys
    Reverse,
}

/// Notification that a key changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Collection
    pub collection: Collection,
    /// Key
    pub key: String,
    /// New version
    pub version: u64,
}

/// What a change stream yielded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// A key in the watched collection changed
    Changed(ChangeEvent),
    /// The receiver fell behind and missed this many notifications
    Lagged(u64),
    /// The store dropped its sender
    Closed,
}

/// Change notifications for one collection
#[derive(Debug)]
pub struct ChangeStream {
    collection: Collection,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl ChangeStream {
    /// Wrap a broadcast receiver, keeping only events of `collection`
    pub fn new(collection: Collection, receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            collection,
            receiver,
        }
    }

    /// Wait for the next relevant signal
    pub async fn next(&mut self) -> StreamSignal {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.collection == self.collection => {
                    return StreamSignal::Changed(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return StreamSignal::Lagged(missed)
                }
                Err(broadcast::error::RecvError::Closed) => return StreamSignal::Closed,
            }
        }
    }
}

/// Persistence backend contract
#[async_trait]
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// Backend name for logs
    fn backend_name(&self) -> &'static str;

    /// Read one value
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Versioned>>;

    /// Apply all operations or none
    async fn run_atomic(&self, ops: Vec<WriteOp>) -> Result<CommitOutcome>;

    /// Ordered scan of a collection
    async fn scan(
        &self,
        collection: Collection,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Versioned)>>;

    /// Change stream, `None` for backends that cannot push
    fn subscribe(&self, collection: Collection) -> Option<ChangeStream>;

    /// Unconditional single write
    async fn put(&self, collection: Collection, key: &str, value: Vec<u8>) -> Result<()> {
        let op = WriteOp::Put {
            collection,
            key: key.to_string(),
            value,
            expect: Expect::Any,
        };
        match self.run_atomic(vec![op]).await? {
            CommitOutcome::Committed => Ok(()),
            CommitOutcome::Aborted { collection, key } => Err(Error::ConcurrentConflict(
                format!("{}/{}", collection, key),
            )),
        }
    }
}

/// Reject batches that touch the same key twice
pub(crate) fn ensure_distinct_keys(ops: &[WriteOp]) -> Result<()> {
    let mut seen = HashSet::with_capacity(ops.len());
    for op in ops {
        if !seen.insert((op.collection(), op.key())) {
            return Err(Error::Storage(format!(
                "Key {}/{} appears twice in one commit",
                op.collection(),
                op.key()
            )));
        }
    }
    Ok(())
}

/// Build an atomic commit from typed records
#[derive(Debug, Default)]
pub struct Batch {
    ops: Vec<WriteOp>,
}

impl Batch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record that must not exist yet
    pub fn create<T: Serialize>(&mut self, collection: Collection, key: &str, value: &T) -> Result<()> {
        self.push_put(collection, key, value, Expect::Absent)
    }

    /// Replace a record read at `version`
    pub fn update<T: Serialize>(
        &mut self,
        collection: Collection,
        key: &str,
        value: &T,
        version: u64,
    ) -> Result<()> {
        self.push_put(collection, key, value, Expect::Version(version))
    }

    /// Write without a precondition
    pub fn put<T: Serialize>(&mut self, collection: Collection, key: &str, value: &T) -> Result<()> {
        self.push_put(collection, key, value, Expect::Any)
    }

    /// Assert a precondition without writing
    pub fn check(&mut self, collection: Collection, key: &str, expect: Expect) {
        self.ops.push(WriteOp::Check {
            collection,
            key: key.to_string(),
            expect,
        });
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume into raw operations
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    fn push_put<T: Serialize>(
        &mut self,
        collection: Collection,
        key: &str,
        value: &T,
        expect: Expect,
    ) -> Result<()> {
        self.ops.push(WriteOp::Put {
            collection,
            key: key.to_string(),
            value: bincode::serialize(value)?,
            expect,
        });
        Ok(())
    }
}

/// Typed, timeout-bounded access to a [`LedgerStore`]
#[derive(Clone, Debug)]
pub struct Gateway {
    store: Arc<dyn LedgerStore>,
    timeout: Duration,
}

impl Gateway {
    /// Wrap a store
    pub fn new(store: Arc<dyn LedgerStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Read and decode one record with its version
    pub async fn load<T: DeserializeOwned>(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<(T, u64)>> {
        let value = self.guarded("get", self.store.get(collection, key)).await?;
        match value {
            Some(versioned) => {
                let record: T = bincode::deserialize(&versioned.bytes)?;
                Ok(Some((record, versioned.version)))
            }
            None => Ok(None),
        }
    }

    /// Scan and decode a collection in key order
    pub async fn scan<T: DeserializeOwned>(
        &self,
        collection: Collection,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<T>> {
        Ok(self
            .scan_versioned(collection, direction, limit)
            .await?
            .into_iter()
            .map(|(record, _)| record)
            .collect())
    }

    /// Scan and decode a collection in key order, keeping versions
    pub async fn scan_versioned<T: DeserializeOwned>(
        &self,
        collection: Collection,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<(T, u64)>> {
        let rows = self
            .guarded("scan", self.store.scan(collection, direction, limit))
            .await?;
        rows.into_iter()
            .map(|(_, versioned)| {
                bincode::deserialize::<T>(&versioned.bytes)
                    .map(|record| (record, versioned.version))
                    .map_err(Error::from)
            })
            .collect()
    }

    /// Filter, order and bound a collection
    pub async fn query<T, F, O>(
        &self,
        collection: Collection,
        filter: F,
        mut order: O,
        limit: Option<usize>,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
        O: FnMut(&T, &T) -> Ordering,
    {
        let mut records: Vec<T> = self
            .scan::<T>(collection, ScanDirection::Forward, None)
            .await?
            .into_iter()
            .filter(|record| filter(record))
            .collect();
        records.sort_by(|a, b| order(a, b));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Commit a batch; a failed precondition becomes `ConcurrentConflict`
    pub async fn commit(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let op_count = batch.len();
        match self
            .guarded("run_atomic", self.store.run_atomic(batch.into_ops()))
            .await?
        {
            CommitOutcome::Committed => {
                tracing::debug!(ops = op_count, "Batch committed");
                Ok(())
            }
            CommitOutcome::Aborted { collection, key } => {
                tracing::debug!(%collection, key = %key, "Batch aborted on precondition");
                Err(Error::ConcurrentConflict(format!("{}/{}", collection, key)))
            }
        }
    }

    /// Change stream for a collection
    pub fn subscribe(&self, collection: Collection) -> Option<ChangeStream> {
        self.store.subscribe(collection)
    }

    async fn guarded<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op, timeout_ms = self.timeout.as_millis() as u64, "Store call timed out");
                Err(Error::StoreUnavailable(format!(
                    "{} timed out after {:?}",
                    op, self.timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_holds() {
        assert!(Expect::Any.holds(None));
        assert!(Expect::Any.holds(Some(3)));
        assert!(Expect::Absent.holds(None));
        assert!(!Expect::Absent.holds(Some(1)));
        assert!(Expect::Version(2).holds(Some(2)));
        assert!(!Expect::Version(2).holds(Some(3)));
        assert!(!Expect::Version(1).holds(None));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let ops = vec![
            WriteOp::Check {
                collection: Collection::Users,
                key: "u1".to_string(),
                expect: Expect::Any,
            },
            WriteOp::Put {
                collection: Collection::Users,
                key: "u1".to_string(),
                value: vec![],
                expect: Expect::Any,
            },
        ];
        assert!(ensure_distinct_keys(&ops).is_err());
        assert!(ensure_distinct_keys(&ops[..1]).is_ok());
    }

    #[derive(Debug)]
    struct StalledStore;

    #[async_trait]
    impl LedgerStore for StalledStore {
        fn backend_name(&self) -> &'static str {
            "stalled"
        }

        async fn get(&self, _: Collection, _: &str) -> Result<Option<Versioned>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }

        async fn run_atomic(&self, _: Vec<WriteOp>) -> Result<CommitOutcome> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(CommitOutcome::Committed)
        }

        async fn scan(
            &self,
            _: Collection,
            _: ScanDirection,
            _: Option<usize>,
        ) -> Result<Vec<(String, Versioned)>> {
            Ok(vec![])
        }

        fn subscribe(&self, _: Collection) -> Option<ChangeStream> {
            None
        }
    }

    #[tokio::test]
    async fn test_gateway_times_out() {
        let gateway = Gateway::new(Arc::new(StalledStore), Duration::from_millis(20));
        let result = gateway.load::<String>(Collection::Users, "u1").await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    }
}
