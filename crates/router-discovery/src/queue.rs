//! Bounded background queue for routed requests
//!
//! Submitting returns a job id right away; a single worker drains the queue
//! through `DiscoveryService::send_request_with_fallback` and records how
//! each job ended, so failures are retrievable instead of lost. Only the
//! most recent finished records are kept.

use chrono::{DateTime, Utc};
use router_core::{Request, Result, RouterError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::client::FallbackHandler;
use crate::service::DiscoveryService;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed { used_mcp: bool, result: Value },
    Failed { error: String },
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub method: String,
    pub status: JobStatus,
    pub queued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct Job {
    id: Uuid,
    request: Request,
}

/// Finished records kept by `RequestQueue::start`
pub const DEFAULT_RETAINED_JOBS: usize = 1024;

struct Jobs {
    records: HashMap<Uuid, JobRecord>,
    /// Finished job ids, oldest first
    finished: VecDeque<Uuid>,
    retained: usize,
}

impl Jobs {
    fn new(retained: usize) -> Self {
        Self {
            records: HashMap::new(),
            finished: VecDeque::new(),
            retained,
        }
    }

    fn set_status(&mut self, job_id: Uuid, status: JobStatus) {
        let Some(record) = self.records.get_mut(&job_id) else {
            return;
        };
        let finished = status.is_finished();
        if finished {
            record.finished_at = Some(Utc::now());
        }
        record.status = status;

        if finished {
            self.finished.push_back(job_id);
            while self.finished.len() > self.retained {
                if let Some(oldest) = self.finished.pop_front() {
                    self.records.remove(&oldest);
                    debug!("Dropped record of finished job {}", oldest);
                }
            }
        }
    }
}

type JobTable = Arc<Mutex<Jobs>>;

pub struct RequestQueue {
    sender: mpsc::Sender<Job>,
    jobs: JobTable,
    finished: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl RequestQueue {
    /// Spawn the worker. At most `capacity` jobs wait in the queue.
    pub fn start(
        service: Arc<DiscoveryService>,
        fallback: Arc<dyn FallbackHandler>,
        capacity: usize,
    ) -> Self {
        Self::start_with_retention(service, fallback, capacity, DEFAULT_RETAINED_JOBS)
    }

    /// Like `start`, keeping at most `retained` finished job records
    pub fn start_with_retention(
        service: Arc<DiscoveryService>,
        fallback: Arc<dyn FallbackHandler>,
        capacity: usize,
        retained: usize,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Job>(capacity.max(1));
        let jobs: JobTable = Arc::new(Mutex::new(Jobs::new(retained.max(1))));
        let finished = Arc::new(Notify::new());

        let worker_jobs = jobs.clone();
        let worker_finished = finished.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                set_status(&worker_jobs, job.id, JobStatus::Running).await;
                debug!("Running job {}", job.id);

                let outcome = service
                    .send_request_with_fallback(&job.request, fallback.as_ref())
                    .await;
                let status = match outcome {
                    Ok((result, used_mcp)) => {
                        info!("Job {} completed (used_mcp={})", job.id, used_mcp);
                        JobStatus::Completed { used_mcp, result }
                    }
                    Err(e) => {
                        error!("Job {} failed: {}", job.id, e);
                        JobStatus::Failed { error: e.to_string() }
                    }
                };
                set_status(&worker_jobs, job.id, status).await;
                worker_finished.notify_waiters();
            }
            debug!("Request queue closed, worker exiting");
        });

        Self {
            sender,
            jobs,
            finished,
            worker,
        }
    }

    async fn track(&self, request: &Request) -> Uuid {
        let id = Uuid::new_v4();
        self.jobs.lock().await.records.insert(
            id,
            JobRecord {
                job_id: id,
                method: request.method.clone(),
                status: JobStatus::Queued,
                queued_at: Utc::now(),
                finished_at: None,
            },
        );
        id
    }

    /// Enqueue, waiting for space if the queue is full
    pub async fn submit(&self, request: Request) -> Result<Uuid> {
        let id = self.track(&request).await;
        if self.sender.send(Job { id, request }).await.is_err() {
            self.jobs.lock().await.records.remove(&id);
            return Err(RouterError::QueueError("Request queue is closed".into()));
        }
        debug!("Job {} queued", id);
        Ok(id)
    }

    /// Enqueue without waiting; a full queue is an error
    pub async fn try_submit(&self, request: Request) -> Result<Uuid> {
        let id = self.track(&request).await;
        match self.sender.try_send(Job { id, request }) {
            Ok(()) => Ok(id),
            Err(e) => {
                self.jobs.lock().await.records.remove(&id);
                Err(match e {
                    mpsc::error::TrySendError::Full(_) => {
                        RouterError::QueueError("Request queue is full".into())
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        RouterError::QueueError("Request queue is closed".into())
                    }
                })
            }
        }
    }

    /// `None` for unknown ids and for finished jobs whose record was dropped
    pub async fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs
            .lock()
            .await
            .records
            .get(&job_id)
            .map(|r| r.status.clone())
    }

    pub async fn record(&self, job_id: Uuid) -> Option<JobRecord> {
        self.jobs.lock().await.records.get(&job_id).cloned()
    }

    /// Number of job records currently held, queued or finished
    pub async fn tracked_jobs(&self) -> usize {
        self.jobs.lock().await.records.len()
    }

    /// Wait until the job completes or fails. `None` for unknown ids.
    pub async fn wait(&self, job_id: Uuid) -> Option<JobStatus> {
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.status(job_id).await {
                Some(status) if status.is_finished() => return Some(status),
                Some(_) => notified.await,
                None => return None,
            }
        }
    }

    /// Stop accepting jobs, let the worker drain what is queued, and wait for it
    pub async fn shutdown(self) {
        let RequestQueue { sender, worker, .. } = self;
        drop(sender);
        if let Err(e) = worker.await {
            error!("Request queue worker ended abnormally: {}", e);
        }
    }
}

async fn set_status(jobs: &JobTable, job_id: Uuid, status: JobStatus) {
    jobs.lock().await.set_status(job_id, status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FnFallback;
    use router_config::DiscoverySettings;
    use router_core::RetryPolicy;
    use serde_json::json;

    fn fallback_only() -> Arc<DiscoveryService> {
        Arc::new(DiscoveryService::new(
            None,
            &DiscoverySettings::default(),
            RetryPolicy::immediate(0),
        ))
    }

    fn echo_fallback() -> Arc<dyn FallbackHandler> {
        Arc::new(FnFallback::new(|request: Request| async move {
            if request.method == "fail" {
                Err(RouterError::server("fallback refused"))
            } else {
                Ok(json!({"answered": request.method}))
            }
        }))
    }

    #[tokio::test]
    async fn test_jobs_complete_with_status() {
        let queue = RequestQueue::start(fallback_only(), echo_fallback(), 4);

        let id = queue.submit(Request::new("chat", "summarize")).await.unwrap();
        let status = queue.wait(id).await.unwrap();
        assert_eq!(
            status,
            JobStatus::Completed {
                used_mcp: false,
                result: json!({"answered": "summarize"})
            }
        );
        assert!(queue.record(id).await.unwrap().finished_at.is_some());

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_are_retrievable() {
        let queue = RequestQueue::start(fallback_only(), echo_fallback(), 4);

        let id = queue.submit(Request::new("chat", "fail")).await.unwrap();
        match queue.wait(id).await.unwrap() {
            JobStatus::Failed { error } => assert!(error.contains("fallback refused")),
            other => panic!("unexpected {:?}", other),
        }

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_rejects_try_submit() {
        let blocker = Arc::new(Notify::new());
        let gate = blocker.clone();
        let fallback: Arc<dyn FallbackHandler> =
            Arc::new(FnFallback::new(move |_request: Request| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, RouterError>(Value::Null)
                }
            }));
        let queue = RequestQueue::start(fallback_only(), fallback, 1);

        let first = queue.submit(Request::new("chat", "one")).await.unwrap();
        // Wait for the worker to pick up the first job so it is no longer queued
        while queue.status(first).await != Some(JobStatus::Running) {
            tokio::task::yield_now().await;
        }
        queue.try_submit(Request::new("chat", "two")).await.unwrap();
        let err = queue.try_submit(Request::new("chat", "three")).await.unwrap_err();
        assert!(matches!(err, RouterError::QueueError(_)));

        blocker.notify_one();
        queue.wait(first).await.unwrap();
        blocker.notify_one();
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_only_recent_finished_jobs_are_kept() {
        let queue = RequestQueue::start_with_retention(fallback_only(), echo_fallback(), 4, 2);

        let mut ids = Vec::new();
        for method in ["one", "two", "three", "four"] {
            let id = queue.submit(Request::new("chat", method)).await.unwrap();
            queue.wait(id).await.unwrap();
            ids.push(id);
        }

        assert_eq!(queue.tracked_jobs().await, 2);
        assert!(queue.status(ids[0]).await.is_none());
        assert!(queue.status(ids[1]).await.is_none());
        assert_eq!(queue.record(ids[2]).await.unwrap().method, "three");
        assert!(queue.status(ids[3]).await.unwrap().is_finished());

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let queue = RequestQueue::start(fallback_only(), echo_fallback(), 1);
        assert!(queue.status(Uuid::new_v4()).await.is_none());
        assert!(queue.wait(Uuid::new_v4()).await.is_none());
        queue.shutdown().await;
    }
}
