//! In-process task queue drained by a pool of tokio workers.

use super::{Task, TaskError, TaskScheduler};
use crate::services::by_reference::Pipeline;
use backon::{ExponentialBuilder, Retryable};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{error, info, warn};

/// Scheduler backed by an unbounded channel.
#[derive(Clone)]
pub struct QueueScheduler {
    sender: mpsc::UnboundedSender<Task>,
}

impl QueueScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TaskScheduler for QueueScheduler {
    fn schedule(&self, task: Task) {
        if self.sender.send(task).is_err() {
            warn!(?task, "task queue closed; task dropped");
        }
    }
}

/// Retry policy for a single task.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

/// Spawn `workers` tasks that execute queued work until the channel closes.
pub fn spawn_workers(
    receiver: mpsc::UnboundedReceiver<Task>,
    pipeline: Pipeline,
    workers: usize,
    policy: RetryPolicy,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    (0..workers.max(1))
        .map(|worker| {
            let receiver = receiver.clone();
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(task) = next else {
                        break;
                    };
                    run_task(&pipeline, task, policy).await;
                }
                info!(worker, "task worker stopped");
            })
        })
        .collect()
}

/// Run one task with retries; the final failure is logged.
pub async fn run_task(pipeline: &Pipeline, task: Task, policy: RetryPolicy) {
    let notify = |err: &TaskError, delay: Duration| {
        warn!(
            ?task,
            next_delay_ms = delay.as_millis() as u64,
            error = %err,
            "task failed, will retry"
        );
    };
    let result = (|| async { pipeline.execute(task).await })
        .retry(policy.backoff())
        .when(TaskError::is_retryable)
        .notify(notify)
        .await;
    if let Err(err) = result {
        error!(?task, error = %err, "task failed");
    }
}
