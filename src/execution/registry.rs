//! The async job registry.
//!
//! Every long-running operation follows the same shape: submit returns
//! an execution id immediately, a per-device worker drives the record
//! to a terminal state, and the status endpoint snapshots it until
//! eviction. Submission is admission-controlled by the bounded device
//! mailbox; a full mailbox is `DeviceBusy`, never a blocked caller.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

use crate::adapters::CancelToken;
use crate::error::{Error, Result};
use crate::execution::executor::ExecutorConfig;
use crate::execution::record::{
    ExecutionId, ExecutionRecord, OperationKind, StatusResponse,
};
use crate::execution::worker::{spawn_worker, DeviceHandle, JobPayload, QueuedJob};
use crate::persistence::Persistence;
use crate::registry::DeviceKey;

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long terminal records stay queryable
    pub retain_terminal: Duration,
    /// Bounded mailbox depth per device
    pub queue_capacity: usize,
    /// Hard execution cap
    pub exec_cap: Duration,
    /// Extended cap for the script kind
    pub script_cap: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retain_terminal: Duration::minutes(5),
            queue_capacity: 16,
            exec_cap: Duration::hours(1),
            script_cap: Duration::hours(2),
        }
    }
}

impl RegistryConfig {
    fn cap_for(&self, kind: OperationKind) -> Duration {
        match kind {
            OperationKind::Script => self.script_cap,
            _ => self.exec_cap,
        }
    }
}

/// Uniform async job registry over the host's device workers.
pub struct JobRegistry {
    records: RwLock<HashMap<ExecutionId, Arc<RwLock<ExecutionRecord>>>>,
    cancels: RwLock<HashMap<ExecutionId, CancelToken>>,
    queues: Mutex<HashMap<DeviceKey, mpsc::Sender<QueuedJob>>>,
    executor_config: ExecutorConfig,
    history: Option<Arc<dyn Persistence>>,
    config: RegistryConfig,
}

impl JobRegistry {
    pub fn new(
        config: RegistryConfig,
        executor_config: ExecutorConfig,
        history: Option<Arc<dyn Persistence>>,
    ) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            cancels: RwLock::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            executor_config,
            history,
            config,
        }
    }

    /// Register a device handle and spawn its worker. Re-registration
    /// replaces the mailbox; the old worker drains and exits.
    pub fn register_device(&self, handle: DeviceHandle) {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        spawn_worker(
            handle.clone(),
            rx,
            self.executor_config.clone(),
            self.history.clone(),
        );
        let mut queues = self.queues.lock().expect("queue lock poisoned");
        queues.insert(handle.key.clone(), tx);
        tracing::info!(device = %handle.key, "device worker registered");
    }

    /// Submit a job. Returns the execution id without waiting for the
    /// worker to pick it up.
    pub fn submit(
        &self,
        kind: OperationKind,
        device: &DeviceKey,
        payload: JobPayload,
    ) -> Result<ExecutionId> {
        let sender = {
            let queues = self.queues.lock().expect("queue lock poisoned");
            queues
                .get(device)
                .cloned()
                .ok_or_else(|| Error::not_found("device", device.to_string()))?
        };

        let record = ExecutionRecord::new(kind, device.clone());
        let execution_id = record.execution_id;
        let record = Arc::new(RwLock::new(record));
        let cancel = CancelToken::new();

        let job = QueuedJob {
            record: record.clone(),
            cancel: cancel.clone(),
            payload,
            max_duration: self.config.cap_for(kind),
        };

        match sender.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(Error::DeviceBusy {
                    device_id: device.device_id.clone(),
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(Error::Internal(format!(
                    "worker mailbox for {} is closed",
                    device
                )));
            }
        }

        self.records
            .write()
            .expect("records lock poisoned")
            .insert(execution_id, record);
        self.cancels
            .write()
            .expect("cancels lock poisoned")
            .insert(execution_id, cancel);

        tracing::debug!(execution = %execution_id, device = %device, ?kind, "job submitted");
        Ok(execution_id)
    }

    /// Snapshot a record. Idempotent.
    pub fn status(&self, execution_id: ExecutionId) -> Result<StatusResponse> {
        let records = self.records.read().expect("records lock poisoned");
        let record = records
            .get(&execution_id)
            .ok_or_else(|| Error::not_found("execution", execution_id.to_string()))?;
        let record = record.read().expect("record lock poisoned");
        Ok(record.snapshot())
    }

    /// Best-effort cancel. Idempotent; unknown ids are `NotFound`.
    pub fn cancel(&self, execution_id: ExecutionId) -> Result<()> {
        let cancels = self.cancels.read().expect("cancels lock poisoned");
        let token = cancels
            .get(&execution_id)
            .ok_or_else(|| Error::not_found("execution", execution_id.to_string()))?;
        token.cancel();
        Ok(())
    }

    /// Remove terminal records past the retention window. Returns how
    /// many were evicted.
    pub fn evict_terminal(&self) -> usize {
        let cutoff = Utc::now() - self.config.retain_terminal;
        let mut evicted = Vec::new();
        {
            let mut records = self.records.write().expect("records lock poisoned");
            records.retain(|id, record| {
                let record = record.read().expect("record lock poisoned");
                let stale = record.status.is_terminal()
                    && record.completed_at.map(|t| t < cutoff).unwrap_or(false);
                if stale {
                    evicted.push(*id);
                }
                !stale
            });
        }
        let mut cancels = self.cancels.write().expect("cancels lock poisoned");
        for id in &evicted {
            cancels.remove(id);
        }
        evicted.len()
    }

    /// All live records for a device (operational queries).
    pub fn records_for_device(&self, device: &DeviceKey) -> Vec<StatusResponse> {
        let records = self.records.read().expect("records lock poisoned");
        records
            .values()
            .filter_map(|record| {
                let record = record.read().ok()?;
                (record.owner_device == *device).then(|| record.snapshot())
            })
            .collect()
    }

    /// Poll a record as a stream: one snapshot per tick, ending after
    /// the first terminal snapshot. Logs grow monotonically across
    /// items, so consumers append-deduplicate by length.
    pub fn status_stream(
        self: Arc<Self>,
        execution_id: ExecutionId,
        every: std::time::Duration,
    ) -> impl futures::Stream<Item = StatusResponse> {
        futures::stream::unfold(
            (self, false, true),
            move |(registry, done, first)| async move {
                if done {
                    return None;
                }
                if !first {
                    tokio::time::sleep(every).await;
                }
                let status = registry.status(execution_id).ok()?;
                let terminal = status.status.is_terminal();
                Some((status, (registry, terminal, false)))
            },
        )
    }

    /// Spawn a periodic eviction task.
    pub fn spawn_eviction(self: Arc<Self>, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_terminal();
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted terminal execution records");
                }
            }
        })
    }
}
