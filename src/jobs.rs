//! Background download queue.
//!
//! Enqueued downloads are recorded as `pending`, picked up by a fixed set of
//! workers (`running`) and finish as `completed` or `error`. Workers go
//! through the same admission controller as synchronous downloads. Records
//! live in memory only.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{
        Mutex,
        mpsc::{self, error::TrySendError},
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    download::{DownloadResponse, ValidatedDownload, perform_download},
    state::AppState,
};

const MAX_JOB_RECORDS: usize = 2_000;
/// Jobs waiting for a worker. Enqueues beyond this are refused.
pub const JOB_QUEUE_CAPACITY: usize = 500;
pub const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl JobStatus {
    fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<usize>,
    pub result: Option<DownloadResponse>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct QueuedJob {
    id: String,
    order: ValidatedDownload,
}

pub type JobReceiver = mpsc::Receiver<QueuedJob>;

#[derive(Debug, Error)]
#[error("Job queue is full, try again later")]
pub struct QueueFull;

#[derive(Debug, Default)]
struct JobRegistry {
    records: HashMap<String, JobRecord>,
    order: VecDeque<String>,
}

impl JobRegistry {
    fn insert(&mut self, record: JobRecord) {
        self.order.push_back(record.id.clone());
        self.records.insert(record.id.clone(), record);
        self.trim();
    }

    /// Drops the oldest finished records once over capacity. Pending and
    /// running jobs are always kept.
    fn trim(&mut self) {
        let mut excess = self.records.len().saturating_sub(MAX_JOB_RECORDS);
        if excess == 0 {
            return;
        }
        let records = &mut self.records;
        self.order.retain(|id| {
            if excess == 0 {
                return true;
            }
            let finished = records
                .get(id)
                .is_none_or(|record| record.status.is_finished());
            if finished {
                records.remove(id);
                excess -= 1;
            }
            !finished
        });
    }

    fn remove(&mut self, id: &str) {
        if self.records.remove(id).is_some() {
            self.order.retain(|queued| queued != id);
        }
    }

    fn update(&mut self, id: &str, apply: impl FnOnce(&mut JobRecord)) {
        if let Some(record) = self.records.get_mut(id) {
            apply(record);
            record.updated_at = Utc::now();
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    registry: Arc<Mutex<JobRegistry>>,
    sender: mpsc::Sender<QueuedJob>,
}

impl JobQueue {
    pub fn new() -> (Self, JobReceiver) {
        Self::with_capacity(JOB_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let queue = Self {
            registry: Arc::new(Mutex::new(JobRegistry::default())),
            sender,
        };
        (queue, receiver)
    }

    /// Records a pending job and hands it to the workers. Returns its id, or
    /// [`QueueFull`] when too many jobs are already waiting.
    pub async fn enqueue(&self, order: ValidatedDownload) -> Result<String, QueueFull> {
        let id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let url = order.job.url.clone();

        self.registry.lock().await.insert(JobRecord {
            id: id.clone(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            worker: None,
            result: None,
            error: None,
        });

        match self.sender.try_send(QueuedJob {
            id: id.clone(),
            order,
        }) {
            Ok(()) => info!(job_id = %id, %url, "Enqueued download job"),
            Err(TrySendError::Full(_)) => {
                warn!(%url, "Job queue is full, refusing download job");
                self.registry.lock().await.remove(&id);
                return Err(QueueFull);
            }
            Err(TrySendError::Closed(_)) => {
                let message = "Job workers are not running".to_string();
                error!(job_id = %id, "{message}");
                self.registry.lock().await.update(&id, |record| {
                    record.status = JobStatus::Error;
                    record.error = Some(message);
                });
            }
        }

        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<JobRecord> {
        self.registry.lock().await.records.get(id).cloned()
    }

    /// Newest first.
    pub async fn list(&self, limit: usize) -> Vec<JobRecord> {
        let registry = self.registry.lock().await;
        registry
            .order
            .iter()
            .rev()
            .filter_map(|id| registry.records.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    async fn update(&self, id: &str, apply: impl FnOnce(&mut JobRecord)) {
        self.registry.lock().await.update(id, apply);
    }
}

/// Starts `count` workers sharing `receiver`. They stop once `cancel` fires.
pub fn spawn_workers(
    state: AppState,
    receiver: JobReceiver,
    count: usize,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    (1..=count.max(1))
        .map(|worker| {
            let state = state.clone();
            let receiver = Arc::clone(&receiver);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                info!(worker, "Job worker started");
                loop {
                    let next = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            job = receiver.recv() => job,
                        }
                    };
                    let Some(job) = next else { break };
                    run_job(&state, worker, job).await;
                }
                info!(worker, "Job worker stopped");
            })
        })
        .collect()
}

async fn run_job(state: &AppState, worker: usize, job: QueuedJob) {
    state
        .jobs
        .update(&job.id, |record| {
            record.status = JobStatus::Running;
            record.worker = Some(worker);
        })
        .await;

    match perform_download(state, job.order).await {
        Ok(response) => {
            info!(job_id = %job.id, filename = %response.filename, "Download job completed");
            state
                .jobs
                .update(&job.id, |record| {
                    record.status = JobStatus::Completed;
                    record.result = Some(response);
                })
                .await;
        }
        Err(download_error) => {
            error!(job_id = %job.id, "Download job failed: {download_error}");
            state
                .jobs
                .update(&job.id, |record| {
                    record.status = JobStatus::Error;
                    record.error = Some(download_error.to_string());
                })
                .await;
        }
    }
}
