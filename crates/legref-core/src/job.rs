use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::reference::Reference;

const MAX_EVENT_HISTORY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// One progress event pushed by the orchestrator; mirrors the
/// `(percent, phase_label, technical_message, active_agents[])`
/// callback shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub percent: u8,
    pub phase: String,
    pub message: String,
    pub active_agents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub references: Vec<Reference>,
    pub inferred_references: Vec<Reference>,
    pub rounds_used: u32,
    pub converged: bool,
    pub stage_errors: Vec<String>,
}

struct JobSlot {
    state: JobState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    progress: ProgressEvent,
    report: Option<RunReport>,
    error: Option<String>,
    tx: broadcast::Sender<ProgressEvent>,
    history: Vec<ProgressEvent>,
    cancel: Arc<tokio::sync::Notify>,
    cancelled: bool,
}

/// Thread-safe map of jobs, guarded by a single mutex (spec 4.12 / 5).
/// Cancellation is a `Notify` the orchestrator polls at stage
/// boundaries rather than a hard abort of in-flight work.
pub struct JobManager {
    jobs: Mutex<HashMap<String, JobSlot>>,
}

impl JobManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub async fn create(&self) -> String {
        let id = format!("job-{}", Uuid::new_v4());
        let (tx, _) = broadcast::channel(256);
        let mut jobs = self.jobs.lock().await;
        jobs.insert(
            id.clone(),
            JobSlot {
                state: JobState::Pending,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                progress: ProgressEvent {
                    percent: 0,
                    phase: "pending".into(),
                    message: String::new(),
                    active_agents: Vec::new(),
                },
                report: None,
                error: None,
                tx,
                history: Vec::new(),
                cancel: Arc::new(tokio::sync::Notify::new()),
                cancelled: false,
            },
        );
        id
    }

    pub async fn start(&self, id: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(id) {
            if job.state == JobState::Pending {
                job.state = JobState::Running;
                job.started_at = Some(Utc::now());
            }
        }
    }

    pub async fn cancel_token(&self, id: &str) -> Option<Arc<tokio::sync::Notify>> {
        let jobs = self.jobs.lock().await;
        jobs.get(id).map(|j| j.cancel.clone())
    }

    /// Requests cancellation. Returns false if the job is already
    /// terminal or unknown.
    pub async fn cancel(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(id) else {
            return false;
        };
        if job.state.is_terminal() {
            return false;
        }
        job.cancelled = true;
        job.cancel.notify_waiters();
        if job.state == JobState::Pending {
            job.state = JobState::Cancelled;
            job.completed_at = Some(Utc::now());
        }
        true
    }

    pub async fn is_cancelled(&self, id: &str) -> bool {
        let jobs = self.jobs.lock().await;
        jobs.get(id).map(|j| j.cancelled).unwrap_or(false)
    }

    pub async fn update_progress(&self, id: &str, event: ProgressEvent) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(id) {
            let _ = job.tx.send(event.clone());
            job.progress = event.clone();
            job.history.push(event);
            if job.history.len() > MAX_EVENT_HISTORY {
                job.history.remove(0);
            }
        }
    }

    pub async fn complete(&self, id: &str, report: RunReport) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(id) {
            job.state = JobState::Completed;
            job.completed_at = Some(Utc::now());
            job.report = Some(report);
        }
    }

    pub async fn fail(&self, id: &str, error: String) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(id) {
            job.state = JobState::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some(error);
        }
    }

    pub async fn mark_cancelled(&self, id: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(id) {
            job.state = JobState::Cancelled;
            job.completed_at = Some(Utc::now());
        }
    }

    pub async fn state(&self, id: &str) -> Option<JobState> {
        let jobs = self.jobs.lock().await;
        jobs.get(id).map(|j| j.state)
    }

    pub async fn subscribe(
        &self,
        id: &str,
    ) -> Option<(Vec<ProgressEvent>, broadcast::Receiver<ProgressEvent>)> {
        let jobs = self.jobs.lock().await;
        jobs.get(id)
            .map(|j| (j.history.clone(), j.tx.subscribe()))
    }

    /// Evicts terminal jobs older than `max_age_s`.
    pub async fn cleanup(&self, max_age_s: i64) {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        jobs.retain(|_, job| {
            if !job.state.is_terminal() {
                return true;
            }
            let Some(completed) = job.completed_at else {
                return true;
            };
            (now - completed).num_seconds() < max_age_s
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_pending_running_completed() {
        let mgr = JobManager::new();
        let id = mgr.create().await;
        assert_eq!(mgr.state(&id).await, Some(JobState::Pending));
        mgr.start(&id).await;
        assert_eq!(mgr.state(&id).await, Some(JobState::Running));
        mgr.complete(
            &id,
            RunReport {
                references: Vec::new(),
                inferred_references: Vec::new(),
                rounds_used: 1,
                converged: true,
                stage_errors: Vec::new(),
            },
        )
        .await;
        assert_eq!(mgr.state(&id).await, Some(JobState::Completed));
    }

    #[tokio::test]
    async fn cancel_before_start_goes_terminal_immediately() {
        let mgr = JobManager::new();
        let id = mgr.create().await;
        assert!(mgr.cancel(&id).await);
        assert_eq!(mgr.state(&id).await, Some(JobState::Cancelled));
        assert!(!mgr.cancel(&id).await);
    }

    #[tokio::test]
    async fn cancel_while_running_sets_flag_without_forcing_terminal() {
        let mgr = JobManager::new();
        let id = mgr.create().await;
        mgr.start(&id).await;
        assert!(mgr.cancel(&id).await);
        assert!(mgr.is_cancelled(&id).await);
        assert_eq!(mgr.state(&id).await, Some(JobState::Running));
    }

    #[tokio::test]
    async fn subscribers_receive_progress_history_and_live_events() {
        let mgr = JobManager::new();
        let id = mgr.create().await;
        mgr.update_progress(
            &id,
            ProgressEvent {
                percent: 15,
                phase: "extract".into(),
                message: "round 1".into(),
                active_agents: vec!["A".into()],
            },
        )
        .await;
        let (history, _rx) = mgr.subscribe(&id).await.expect("job exists");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].percent, 15);
    }
}
