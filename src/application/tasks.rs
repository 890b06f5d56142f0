//! Per-owner single-flight admission of creation jobs.
//!
//! An owner has at most one active creation task. A second request for the same owner is
//! rejected immediately instead of being queued. The active marker is cleared when the job
//! finishes, whether it returned an error or panicked.

use std::{
    any::Any,
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex},
};

use dashmap::{DashMap, mapref::entry::Entry};
use metrics::gauge;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    application::collaborators::BuildError,
    domain::types::{Dimensions, OwnerId},
    util::lock::mutex_lock,
};

pub type TaskId = Uuid;

/// Outcome labels stamped by the pipeline once a task's work is fully done.
pub const OUTCOME_SUCCESS: &str = "Success";
pub const OUTCOME_FAILED: &str = "Failed";

#[derive(Debug, Error)]
#[error("creation task `{active}` is already running for owner `{owner}`")]
pub struct EnqueueRejected {
    pub owner: OwnerId,
    pub active: TaskId,
}

/// Request parameters recorded with a task for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskParams {
    pub name: String,
    pub dimensions: Dimensions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    JobSucceeded,
    JobFailed { reason: String },
    Completed { outcome: String },
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub owner: OwnerId,
    pub params: TaskParams,
    pub status: TaskStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

struct ManagerState {
    active: DashMap<OwnerId, TaskId>,
    tasks: DashMap<TaskId, TaskSnapshot>,
    history: Mutex<VecDeque<TaskId>>,
    history_limit: usize,
}

impl ManagerState {
    fn update(&self, id: TaskId, apply: impl FnOnce(&mut TaskSnapshot)) {
        if let Some(mut snapshot) = self.tasks.get_mut(&id) {
            apply(&mut snapshot);
        }
    }

    fn retire(&self, id: TaskId) {
        let mut history = mutex_lock(&self.history, "application::tasks", "retire");
        history.push_back(id);
        while history.len() > self.history_limit {
            if let Some(evicted) = history.pop_front() {
                self.tasks.remove(&evicted);
            }
        }
    }
}

/// Admission gate and status board for creation tasks.
#[derive(Clone)]
pub struct CreationTaskManager {
    state: Arc<ManagerState>,
}

impl CreationTaskManager {
    /// `history_limit` bounds how many finished tasks stay queryable.
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Arc::new(ManagerState {
                active: DashMap::new(),
                tasks: DashMap::new(),
                history: Mutex::new(VecDeque::new()),
                history_limit,
            }),
        }
    }

    /// Admit `job` for `owner` and start it in the background, or reject when the owner
    /// already has an active task. A rejected job is never started.
    pub fn enqueue<T, F, Fut>(
        &self,
        owner: OwnerId,
        params: TaskParams,
        job: F,
    ) -> Result<CreationTask<T>, EnqueueRejected>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BuildError>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let guard = match self.state.active.entry(owner) {
            Entry::Vacant(vacant) => {
                vacant.insert(id);
                ActiveGuard {
                    owner,
                    id,
                    state: Arc::clone(&self.state),
                }
            }
            Entry::Occupied(occupied) => {
                let active = *occupied.get();
                warn!(
                    target = "application::tasks",
                    owner = %owner,
                    active = %active,
                    "creation task rejected, owner already has one running"
                );
                return Err(EnqueueRejected { owner, active });
            }
        };

        self.state.tasks.insert(
            id,
            TaskSnapshot {
                id,
                owner,
                params,
                status: TaskStatus::Running,
                started_at: OffsetDateTime::now_utc(),
                finished_at: None,
            },
        );
        gauge!("mapforge_creation_tasks_active").increment(1.0);
        debug!(target = "application::tasks", task = %id, owner = %owner, "creation task admitted");

        let work = job();
        let handle = tokio::spawn(async move {
            let guard = guard;
            let result = work.await;
            guard.finish(match &result {
                Ok(_) => TaskStatus::JobSucceeded,
                Err(err) => TaskStatus::JobFailed {
                    reason: err.to_string(),
                },
            });
            result
        });

        Ok(CreationTask {
            ticket: TaskTicket {
                id,
                manager: self.clone(),
            },
            handle,
        })
    }

    pub fn is_active(&self, owner: OwnerId) -> bool {
        self.state.active.contains_key(&owner)
    }

    pub fn find(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.state.tasks.get(&id).map(|entry| entry.value().clone())
    }

    /// Tasks whose job is still running.
    pub fn active(&self) -> Vec<TaskSnapshot> {
        self.state
            .active
            .iter()
            .filter_map(|entry| self.find(*entry.value()))
            .collect()
    }

    /// Finished tasks still retained, newest first.
    pub fn recent(&self) -> Vec<TaskSnapshot> {
        let history = mutex_lock(&self.state.history, "application::tasks", "recent");
        history.iter().rev().filter_map(|id| self.find(*id)).collect()
    }

    fn stamp(&self, id: TaskId, outcome: String) {
        self.state.update(id, |snapshot| {
            snapshot.status = TaskStatus::Completed { outcome };
            snapshot.finished_at.get_or_insert_with(OffsetDateTime::now_utc);
        });
    }
}

/// Clears the owner's active marker when the job future completes or unwinds.
struct ActiveGuard {
    owner: OwnerId,
    id: TaskId,
    state: Arc<ManagerState>,
}

impl ActiveGuard {
    fn finish(self, status: TaskStatus) {
        self.state.update(self.id, |snapshot| {
            if snapshot.status.is_running() {
                snapshot.status = status;
            }
            snapshot.finished_at = Some(OffsetDateTime::now_utc());
        });
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.update(self.id, |snapshot| {
            if snapshot.status.is_running() {
                snapshot.status = TaskStatus::JobFailed {
                    reason: "job aborted".to_string(),
                };
                snapshot.finished_at = Some(OffsetDateTime::now_utc());
            }
        });
        let id = self.id;
        self.state.active.remove_if(&self.owner, |_, active| *active == id);
        self.state.retire(id);
        gauge!("mapforge_creation_tasks_active").decrement(1.0);
    }
}

/// Cloneable reference used to stamp a task's final outcome.
#[derive(Clone)]
pub struct TaskTicket {
    id: TaskId,
    manager: CreationTaskManager,
}

impl TaskTicket {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Record a human-readable outcome once the caller's work is done.
    pub fn complete(&self, outcome: impl Into<String>) {
        self.manager.stamp(self.id, outcome.into());
    }
}

/// An admitted task: its ticket plus the running job.
pub struct CreationTask<T> {
    ticket: TaskTicket,
    handle: JoinHandle<Result<T, BuildError>>,
}

impl<T> CreationTask<T> {
    pub fn id(&self) -> TaskId {
        self.ticket.id
    }

    pub fn ticket(&self) -> TaskTicket {
        self.ticket.clone()
    }

    /// Wait for the job. Panics inside the job surface as [`BuildError::Panicked`].
    pub async fn result(self) -> Result<T, BuildError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                let payload = err.into_panic();
                Err(BuildError::Panicked(panic_message(&*payload)))
            }
            Err(_) => Err(BuildError::Aborted),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
