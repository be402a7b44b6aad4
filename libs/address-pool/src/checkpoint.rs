// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Durable checkpointing of the current workload→address assignment set.
//!
//! The pool persists the full allocation set on every successful assign and
//! unassign, inside its own critical section. A sink only needs to replace
//! the previous payload wholesale and to read it back on restart.

use std::{
    net::IpAddr,
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::SystemTime,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::{WorkloadKey, WorkloadMetadata};

/// On-disk format version tag. Bump on incompatible layout changes.
pub const CHECKPOINT_FORMAT_VERSION: &str = "ipam-pool/1";

/// Checkpoint persistence errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// No checkpoint has ever been persisted.
    #[error("no checkpoint found")]
    NotFound,
    /// Durable read or write failed.
    #[error("checkpoint I/O failed")]
    Io(#[from] std::io::Error),
    /// Payload did not decode to a known format.
    #[error("invalid checkpoint payload")]
    Invalid(#[source] anyhow::Error),
}

/// One persisted allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub key: WorkloadKey,
    /// Assigned address, string-encoded for format stability.
    pub address: String,
    pub metadata: WorkloadMetadata,
    /// When the address was assigned.
    pub assigned_at: SystemTime,
}

impl CheckpointEntry {
    /// Decodes the string-encoded address back into an [IpAddr].
    pub(crate) fn parse_address(&self) -> anyhow::Result<IpAddr> {
        self.address
            .parse()
            .with_context(|| format!("invalid checkpointed address {:?}", self.address))
    }
}

/// The full persisted allocation set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub version: String,
    pub allocations: Vec<CheckpointEntry>,
}

impl CheckpointData {
    pub fn new(allocations: Vec<CheckpointEntry>) -> Self {
        Self {
            version: CHECKPOINT_FORMAT_VERSION.to_string(),
            allocations,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

/// Durable persistence of the current allocation set.
///
/// [CheckpointSink::persist] is invoked synchronously by the pool while it
/// holds its lock; implementations must not call back into the pool.
pub trait CheckpointSink: Send + Sync {
    /// Replaces the previously persisted allocation set.
    fn persist(&self, data: &CheckpointData) -> Result<(), CheckpointError>;

    /// Returns the last persisted allocation set, or
    /// [CheckpointError::NotFound] if none was ever written.
    fn restore(&self) -> Result<CheckpointData, CheckpointError>;
}

impl<T: CheckpointSink + ?Sized> CheckpointSink for std::sync::Arc<T> {
    fn persist(&self, data: &CheckpointData) -> Result<(), CheckpointError> {
        (**self).persist(data)
    }

    fn restore(&self) -> Result<CheckpointData, CheckpointError> {
        (**self).restore()
    }
}

/// Sink that records nothing.
///
/// Valid where restart recovery is not required: persist always succeeds and
/// restore yields the empty set.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheckpoint;

impl CheckpointSink for NoopCheckpoint {
    fn persist(&self, _data: &CheckpointData) -> Result<(), CheckpointError> {
        Ok(())
    }

    fn restore(&self) -> Result<CheckpointData, CheckpointError> {
        Ok(CheckpointData::empty())
    }
}

/// In-memory sink capturing the last persisted payload.
///
/// Primarily a test double: it can be armed to reject writes the way a
/// broken disk would.
#[derive(Debug, Default)]
pub struct InMemoryCheckpoint {
    inner: Mutex<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    data: Option<CheckpointData>,
    failing: bool,
}

impl InMemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms or disarms write-failure injection.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// The last persisted payload, if any.
    pub fn data(&self) -> Option<CheckpointData> {
        self.lock().data.clone()
    }

    /// Seeds the sink with a payload for a later restore.
    pub fn seed(&self, data: CheckpointData) {
        self.lock().data = Some(data);
    }
}

impl CheckpointSink for InMemoryCheckpoint {
    fn persist(&self, data: &CheckpointData) -> Result<(), CheckpointError> {
        let mut inner = self.lock();
        if inner.failing {
            return Err(CheckpointError::Io(std::io::Error::other(
                "injected checkpoint failure",
            )));
        }
        inner.data = Some(data.clone());
        Ok(())
    }

    fn restore(&self) -> Result<CheckpointData, CheckpointError> {
        self.lock().data.clone().ok_or(CheckpointError::NotFound)
    }
}

/// File-backed sink.
///
/// Writes replace the checkpoint atomically (temp file plus rename), so a
/// crash mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CheckpointSink for FileCheckpoint {
    fn persist(&self, data: &CheckpointData) -> Result<(), CheckpointError> {
        ipam_io_util::write_json_atomic(&self.path, data)?;
        Ok(())
    }

    fn restore(&self) -> Result<CheckpointData, CheckpointError> {
        let data: CheckpointData = match ipam_io_util::read_json(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound);
            }
            Err(err) => return Err(CheckpointError::Io(err)),
        };
        if data.version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::Invalid(anyhow::anyhow!(
                "unsupported checkpoint version {:?}",
                data.version
            )));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sandbox: &str, address: &str) -> CheckpointEntry {
        CheckpointEntry {
            key: WorkloadKey::new("net0", sandbox, "eth0"),
            address: address.to_string(),
            metadata: WorkloadMetadata::new("default", "sample-pod"),
            assigned_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_file_checkpoint_roundtrip() {
        let path = ipam_io_util::get_tmp_path("checkpoint.json");
        let _ = std::fs::remove_file(&path);
        let sink = FileCheckpoint::new(&path);

        let missing = sink.restore().expect_err("first run has no checkpoint");
        assert!(matches!(missing, CheckpointError::NotFound));

        let data = CheckpointData::new(vec![entry("sandbox-1", "1.1.1.1")]);
        sink.persist(&data).expect("persist should succeed");
        let restored = sink.restore().expect("restore should succeed");
        assert_eq!(restored, data);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_file_checkpoint_rejects_unknown_version() {
        let path = ipam_io_util::get_tmp_path("checkpoint_version.json");
        let sink = FileCheckpoint::new(&path);

        let mut data = CheckpointData::new(vec![entry("sandbox-1", "1.1.1.1")]);
        data.version = "ipam-pool/999".to_string();
        sink.persist(&data).expect("persist should succeed");

        let err = sink.restore().expect_err("restore should reject version");
        assert!(matches!(err, CheckpointError::Invalid(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_in_memory_checkpoint_failure_injection() {
        let sink = InMemoryCheckpoint::new();
        let data = CheckpointData::new(vec![entry("sandbox-1", "1.1.1.1")]);
        sink.persist(&data).expect("persist should succeed");

        sink.set_failing(true);
        let updated = CheckpointData::new(vec![entry("sandbox-2", "1.1.1.2")]);
        sink.persist(&updated).expect_err("persist should fail");

        // The previous payload must survive the failed write.
        assert_eq!(sink.data(), Some(data));
    }

    #[test]
    fn test_entry_address_parsing() {
        assert_eq!(
            entry("s", "10.0.0.1").parse_address().unwrap(),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert!(entry("s", "not-an-ip").parse_address().is_err());
    }
}
