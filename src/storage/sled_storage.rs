//! Sled-backed storage
//!
//! Execution trees are stored bincode-encoded and zstd-compressed in the
//! `processes` tree, jobs bincode-encoded in the `jobs` tree. Each value is
//! prefixed with its big-endian version so a commit can check expectations
//! without decoding documents. Batches run as one multi-tree transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, Transactional, TransactionalTree,
};
use std::path::Path;
use tracing::{debug, info};

use super::{check_version, Storage, Write, WriteBatch};
use crate::core::errors::{EngineError, Result};
use crate::execution::tree::{ExecutionId, ExecutionTree};
use crate::jobs::model::JobRecord;

const PROCESSES_TREE: &str = "processes";
const JOBS_TREE: &str = "jobs";
const COMPRESSION_LEVEL: i32 = 3;

pub struct SledStorage {
    db: sled::Db,
    processes: sled::Tree,
    jobs: sled::Tree,
}

impl SledStorage {
    /// Open (or create) a database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let storage = Self::from_db(db)?;
        info!("Opened sled storage at {}", path.as_ref().display());
        Ok(storage)
    }

    /// Temporary database removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let processes = db.open_tree(PROCESSES_TREE)?;
        let jobs = db.open_tree(JOBS_TREE)?;
        Ok(Self {
            db,
            processes,
            jobs,
        })
    }
}

fn version_of(bytes: &[u8]) -> Result<u64> {
    let prefix: [u8; 8] = bytes
        .get(..8)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| EngineError::Serialization {
            format: "sled",
            message: "value shorter than its version prefix".to_string(),
        })?;
    Ok(u64::from_be_bytes(prefix))
}

fn with_version(version: u64, payload: Vec<u8>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + payload.len());
    bytes.extend_from_slice(&version.to_be_bytes());
    bytes.extend_from_slice(&payload);
    bytes
}

fn encode_tree(tree: &ExecutionTree) -> Result<Vec<u8>> {
    let serialized = bincode::serialize(tree)?;
    let compressed = zstd::encode_all(&*serialized, COMPRESSION_LEVEL)?;
    Ok(with_version(tree.version, compressed))
}

fn decode_tree(bytes: &[u8]) -> Result<ExecutionTree> {
    let version = version_of(bytes)?;
    let decompressed = zstd::decode_all(&bytes[8..])?;
    let mut tree: ExecutionTree = bincode::deserialize(&decompressed)?;
    tree.version = version;
    tree.mark_clean();
    Ok(tree)
}

fn encode_job(job: &JobRecord) -> Result<Vec<u8>> {
    Ok(with_version(job.version, bincode::serialize(job)?))
}

fn decode_job(bytes: &[u8]) -> Result<JobRecord> {
    let version = version_of(bytes)?;
    let mut job: JobRecord = bincode::deserialize(&bytes[8..])?;
    job.version = version;
    Ok(job)
}

fn stored_version(
    tree: &TransactionalTree,
    key: &[u8],
) -> std::result::Result<Option<u64>, ConflictableTransactionError<EngineError>> {
    match tree.get(key)? {
        Some(bytes) => version_of(&bytes)
            .map(Some)
            .map_err(ConflictableTransactionError::Abort),
        None => Ok(None),
    }
}

fn abort(err: EngineError) -> ConflictableTransactionError<EngineError> {
    ConflictableTransactionError::Abort(err)
}

#[async_trait]
impl Storage for SledStorage {
    async fn load_process(&self, process_instance_id: &str) -> Result<Option<ExecutionTree>> {
        match self.processes.get(process_instance_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_tree(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        match self.jobs.get(job_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_job(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn jobs_for_execution(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
    ) -> Result<Vec<JobRecord>> {
        let mut jobs = Vec::new();
        for entry in self.jobs.iter() {
            let (_, bytes) = entry?;
            let job = decode_job(&bytes)?;
            if job.process_instance_id.as_deref() == Some(process_instance_id)
                && job.execution_id == Some(execution)
            {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        let mut jobs = Vec::new();
        for entry in self.jobs.iter() {
            let (_, bytes) = entry?;
            let job = decode_job(&bytes)?;
            if job.is_acquirable(now) {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let mut jobs = Vec::new();
        for entry in self.jobs.iter() {
            let (_, bytes) = entry?;
            jobs.push(decode_job(&bytes)?);
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let count = batch.len();
        let result = (&self.processes, &self.jobs).transaction(|(processes, jobs)| {
            for write in batch.writes() {
                match write {
                    Write::PutProcess { tree, expected } => {
                        let id = tree.process_instance_id();
                        let found = stored_version(processes, id.as_bytes())?;
                        let version =
                            check_version("process", id, *expected, found).map_err(abort)?;
                        let mut tree = tree.clone();
                        tree.version = version;
                        let bytes = encode_tree(&tree).map_err(abort)?;
                        processes.insert(id.as_bytes(), bytes)?;
                    }
                    Write::PutJob { job, expected } => {
                        let found = stored_version(jobs, job.id.as_bytes())?;
                        let version =
                            check_version("job", &job.id, *expected, found).map_err(abort)?;
                        let mut job = job.clone();
                        job.version = version;
                        let bytes = encode_job(&job).map_err(abort)?;
                        jobs.insert(job.id.as_bytes(), bytes)?;
                    }
                    Write::DeleteJob { job_id, expected } => {
                        let found = stored_version(jobs, job_id.as_bytes())?;
                        check_version("job", job_id, *expected, found).map_err(abort)?;
                        jobs.remove(job_id.as_bytes())?;
                    }
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                debug!(writes = count, "Committed write batch");
                Ok(())
            }
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
