//! Checkpoint records, the versioned snapshot schema and checkpoint stores.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Retention;
use crate::ops::GroupSnapshot;
use crate::streaming::WindowSnapshot;
use crate::types::{ExecError, OperatorId, QueryId, Result, Row};

/// Current snapshot schema version. Snapshots carrying any other version are
/// rejected on read.
pub const SNAPSHOT_VERSION: u32 = 2;

/// Versioned, per-operator-type snapshot of operator state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatorSnapshot {
    /// Schema version the snapshot was written with.
    pub version: u32,
    /// Operator-type specific state.
    pub body: SnapshotBody,
}

impl OperatorSnapshot {
    /// Wraps a body with the current schema version.
    pub fn new(body: SnapshotBody) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            body,
        }
    }
}

/// Operator-type specific snapshot payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotBody {
    /// Row-producing operators (scan, filter, project, join probe).
    Rows {
        /// Input positions consumed.
        position: u64,
        /// Output rows not yet delivered downstream.
        emitted: Vec<Row>,
    },
    /// Grouped aggregation.
    Aggregate {
        /// Input positions consumed.
        position: u64,
        /// Partial group states.
        groups: Vec<GroupSnapshot>,
    },
    /// Streaming windowed aggregation.
    Window {
        /// Greatest event time seen.
        watermark: Option<i64>,
        /// Open windows.
        windows: Vec<WindowSnapshot>,
        /// Events dropped for arriving after their window closed.
        late_dropped: u64,
    },
}

/// One durable checkpoint of one operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Owning query.
    pub query_id: QueryId,
    /// Owning operator.
    pub operator_id: OperatorId,
    /// Monotonically increasing per (query, operator).
    pub sequence: u64,
    /// Operator state.
    pub snapshot: OperatorSnapshot,
    /// Milliseconds since the Unix epoch when the record was taken.
    pub timestamp_ms: u64,
}

impl CheckpointRecord {
    /// Creates a record stamped with the current wall time.
    pub fn new(
        query_id: QueryId,
        operator_id: OperatorId,
        sequence: u64,
        snapshot: OperatorSnapshot,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            query_id,
            operator_id,
            sequence,
            snapshot,
            timestamp_ms,
        }
    }
}

/// Pluggable durable storage for checkpoints, keyed by (query, operator).
pub trait CheckpointStore: Send + Sync {
    /// Persists a record, superseding older ones per the store's retention.
    fn write(&self, record: &CheckpointRecord) -> Result<()>;

    /// Returns the newest record for the operator, if any.
    fn read_latest(&self, query: &QueryId, operator: &OperatorId)
        -> Result<Option<CheckpointRecord>>;

    /// Removes every record of one operator.
    fn clear_operator(&self, query: &QueryId, operator: &OperatorId) -> Result<()>;

    /// Removes every record of a query.
    fn clear_query(&self, query: &QueryId) -> Result<()>;
}

type StoreKey = (QueryId, OperatorId);

/// Process-local checkpoint store with keep-latest / keep-last-N retention.
pub struct InMemoryCheckpointStore {
    retention: Retention,
    records: Mutex<HashMap<StoreKey, VecDeque<CheckpointRecord>>>,
}

impl InMemoryCheckpointStore {
    /// Creates a store with the given retention.
    pub fn new(retention: Retention) -> Self {
        Self {
            retention,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Sequence numbers currently retained for an operator, oldest first.
    pub fn sequences(&self, query: &QueryId, operator: &OperatorId) -> Vec<u64> {
        self.records
            .lock()
            .get(&(query.clone(), operator.clone()))
            .map(|q| q.iter().map(|r| r.sequence).collect())
            .unwrap_or_default()
    }

    /// Number of (query, operator) keys with at least one record.
    pub fn key_count(&self) -> usize {
        self.records.lock().len()
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new(Retention::KeepLatest)
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn write(&self, record: &CheckpointRecord) -> Result<()> {
        let keep = match self.retention {
            Retention::KeepLatest => 1,
            Retention::KeepLastN(n) => n.max(1),
        };
        let mut records = self.records.lock();
        let history = records
            .entry((record.query_id.clone(), record.operator_id.clone()))
            .or_default();
        history.push_back(record.clone());
        while history.len() > keep {
            history.pop_front();
        }
        Ok(())
    }

    fn read_latest(
        &self,
        query: &QueryId,
        operator: &OperatorId,
    ) -> Result<Option<CheckpointRecord>> {
        Ok(self
            .records
            .lock()
            .get(&(query.clone(), operator.clone()))
            .and_then(|q| q.back().cloned()))
    }

    fn clear_operator(&self, query: &QueryId, operator: &OperatorId) -> Result<()> {
        self.records
            .lock()
            .remove(&(query.clone(), operator.clone()));
        Ok(())
    }

    fn clear_query(&self, query: &QueryId) -> Result<()> {
        self.records.lock().retain(|(q, _), _| q != query);
        Ok(())
    }
}

/// Filesystem store: one file per (query, operator), overwritten on every
/// checkpoint.
///
/// Layout: `<root>/<query>/<operator>.ckpt`, holding a little-endian CRC32
/// of the payload followed by the JSON-encoded record. Writes go to a
/// temporary file that is renamed over the previous record.
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn query_dir(&self, query: &QueryId) -> PathBuf {
        self.root.join(escape(query.as_str()))
    }

    fn record_path(&self, query: &QueryId, operator: &OperatorId) -> PathBuf {
        self.query_dir(query)
            .join(format!("{}.ckpt", escape(operator.as_str())))
    }
}

const CHECKSUM_LEN: usize = 4;

/// Percent-escapes every byte outside `[A-Za-z0-9_-]`, so distinct ids
/// never share a file name.
fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

impl CheckpointStore for FileCheckpointStore {
    fn write(&self, record: &CheckpointRecord) -> Result<()> {
        let dir = self.query_dir(&record.query_id);
        fs::create_dir_all(&dir)?;
        let path = self.record_path(&record.query_id, &record.operator_id);
        let tmp = path.with_extension("ckpt.tmp");
        let encoded = serde_json::to_vec(record)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_latest(
        &self,
        query: &QueryId,
        operator: &OperatorId,
    ) -> Result<Option<CheckpointRecord>> {
        let path = self.record_path(query, operator);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some((header, payload)) = bytes.split_first_chunk::<CHECKSUM_LEN>() else {
            return Err(ExecError::checkpoint(operator, "truncated checkpoint file"));
        };
        if u32::from_le_bytes(*header) != crc32fast::hash(payload) {
            return Err(ExecError::checkpoint(operator, "checkpoint checksum mismatch"));
        }
        let record: CheckpointRecord = serde_json::from_slice(payload)?;
        if &record.query_id != query || &record.operator_id != operator {
            return Err(ExecError::checkpoint(
                operator,
                format!(
                    "checkpoint file holds {}/{}",
                    record.query_id.as_str(),
                    record.operator_id.as_str()
                ),
            ));
        }
        if record.snapshot.version != SNAPSHOT_VERSION {
            return Err(ExecError::checkpoint(
                operator,
                format!(
                    "snapshot version {} is not supported (expected {})",
                    record.snapshot.version, SNAPSHOT_VERSION
                ),
            ));
        }
        Ok(Some(record))
    }

    fn clear_operator(&self, query: &QueryId, operator: &OperatorId) -> Result<()> {
        match fs::remove_file(self.record_path(query, operator)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn clear_query(&self, query: &QueryId) -> Result<()> {
        match fs::remove_dir_all(self.query_dir(query)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
