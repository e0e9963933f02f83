//! Background work: by-reference downloads and container unpacking.
//!
//! Request handlers never run tasks themselves. They collect them in an
//! [`AfterCommit`] while the operation runs and hand them to a
//! [`TaskScheduler`] once the transaction has committed.

pub mod runner;

use crate::{packaging::PackagingError, services::storage_service::StorageError};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    FetchByReference { version_id: Uuid },
    UnpackObject { version_id: Uuid },
}

impl Task {
    pub fn version_id(self) -> Uuid {
        match self {
            Task::FetchByReference { version_id } | Task::UnpackObject { version_id } => version_id,
        }
    }
}

/// Fire-and-forget task submission with at-least-once delivery.
pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, task: Task);
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("object version {0} has no by-reference URL")]
    MissingUrl(Uuid),
    #[error("no deposit owns bucket {0}")]
    DepositMissing(Uuid),
    #[error("packaging format `{0}` is not supported")]
    UnknownPackaging(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error(transparent)]
    Packaging(#[from] PackagingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl TaskError {
    /// Whether running the task again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Fetch(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status().is_some_and(|status| status.is_server_error())
            }
            TaskError::Sqlx(_) => true,
            TaskError::Storage(StorageError::Io(_) | StorageError::Sqlx(_)) => true,
            TaskError::Packaging(PackagingError::Io(_)) => true,
            _ => false,
        }
    }
}

/// Tasks queued by an operation, released only after it commits.
///
/// Dropping an `AfterCommit` without calling [`AfterCommit::run`] discards
/// the tasks, which is what a rolled back operation wants.
#[derive(Debug, Default)]
pub struct AfterCommit {
    tasks: Vec<Task>,
}

impl AfterCommit {
    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn run(self, scheduler: &dyn TaskScheduler) {
        for task in self.tasks {
            debug!(?task, "scheduling task");
            scheduler.schedule(task);
        }
    }
}
