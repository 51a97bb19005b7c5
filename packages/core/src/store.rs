//! ACGS-Core: Versioned JSON Store
//!
//! Durable persistence for the only state the bus owns long-term:
//! deliberation items and dead-letter messages. The on-disk format is
//! opaque JSON lines, one record per line, each wrapped with a schema
//! version so older readers can skip records they do not understand.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::PathBuf;

use crate::error::BusError;

/// Current schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord<T> {
    schema_version: u32,
    saved_at: DateTime<Utc>,
    record: T,
}

/// Append-oriented JSON-lines store.
pub struct JsonStore<T> {
    path: PathBuf,
    // Serializes writers; readers re-open the file independently.
    write_lock: Mutex<()>,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> JsonStore<T> {
    /// Open (or create) a store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BusError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BusError::internal(format!("create store dir: {e}")))?;
        }
        if !path.exists() {
            File::create(&path).map_err(|e| BusError::internal(format!("create store: {e}")))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        })
    }

    /// Append one record.
    pub fn append(&self, record: &T) -> Result<(), BusError> {
        let stored = StoredRecord {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            record,
        };
        let line = serde_json::to_string(&stored)
            .map_err(|e| BusError::internal(format!("encode record: {e}")))?;

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| BusError::internal(format!("open store: {e}")))?;
        writeln!(file, "{line}").map_err(|e| BusError::internal(format!("append record: {e}")))?;
        Ok(())
    }

    /// Rewrite the store with exactly these records.
    pub fn replace_all(&self, records: &[T]) -> Result<(), BusError> {
        let _guard = self.write_lock.lock();
        let mut file = File::create(&self.path)
            .map_err(|e| BusError::internal(format!("rewrite store: {e}")))?;
        for record in records {
            let stored = StoredRecord {
                schema_version: SCHEMA_VERSION,
                saved_at: Utc::now(),
                record,
            };
            let line = serde_json::to_string(&stored)
                .map_err(|e| BusError::internal(format!("encode record: {e}")))?;
            writeln!(file, "{line}")
                .map_err(|e| BusError::internal(format!("write record: {e}")))?;
        }
        Ok(())
    }

    /// Load all records with a schema version this build understands.
    /// Unknown versions and corrupt lines are skipped with a warning, not
    /// treated as fatal.
    pub fn load(&self) -> Result<Vec<T>, BusError> {
        let file =
            File::open(&self.path).map_err(|e| BusError::internal(format!("open store: {e}")))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| BusError::internal(format!("read store: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredRecord<T>>(&line) {
                Ok(stored) if stored.schema_version <= SCHEMA_VERSION => {
                    records.push(stored.record)
                }
                Ok(stored) => {
                    tracing::warn!(
                        line = lineno,
                        version = stored.schema_version,
                        "skipping record with newer schema version"
                    );
                }
                Err(e) => {
                    tracing::warn!(line = lineno, error = %e, "skipping corrupt store record");
                }
            }
        }
        Ok(records)
    }

    /// Number of readable records.
    pub fn len(&self) -> Result<usize, BusError> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, BusError> {
        Ok(self.len()? == 0)
    }
}
