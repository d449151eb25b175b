// SPDX-License-Identifier: GPL-3.0-only

//! FIFO work queue executing deferred jobs on a single worker task

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{Result, WatchError};

/// A named unit of deferred work.
pub struct Job {
    name: &'static str,
    future: BoxFuture<'static, Result<()>>,
}

impl Job {
    pub fn new<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name,
            future: future.boxed(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn run(self) -> Result<()> {
        self.future.await
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("name", &self.name).finish()
    }
}

/// Accepts jobs for asynchronous execution in submission order.
///
/// `submit` must not block; it runs on the event delivery path.
pub trait JobQueue: Send + Sync {
    fn submit(&self, job: Job) -> Result<()>;
}

/// Unbounded FIFO queue drained by one worker task.
#[derive(Clone)]
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl WorkQueue {
    /// Start the worker. It exits once `cancel` fires or every queue handle is dropped.
    pub fn spawn(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(process_jobs(receiver, cancel));
        (Self { sender }, handle)
    }
}

impl JobQueue for WorkQueue {
    fn submit(&self, job: Job) -> Result<()> {
        self.sender.send(job).map_err(|_| WatchError::QueueClosed)
    }
}

async fn process_jobs(mut receiver: mpsc::UnboundedReceiver<Job>, cancel: CancellationToken) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let name = job.name();
        tracing::debug!("Job start: {name}");
        match AssertUnwindSafe(job.run()).catch_unwind().await {
            Ok(Ok(())) => tracing::debug!("Job complete: {name}"),
            Ok(Err(e)) => tracing::error!("Job {name} failed: {e}"),
            Err(_) => tracing::error!("Job {name} panicked"),
        }
    }

    // Jobs still queued at shutdown are dropped unrun. A dropped resync job
    // never releases its gate, which only matters if the queue is restarted.
    receiver.close();
    let mut dropped = 0usize;
    while let Ok(job) = receiver.try_recv() {
        tracing::debug!("Dropping queued job at shutdown: {}", job.name());
        dropped += 1;
    }
    tracing::debug!("Work queue exiting ({dropped} job(s) dropped)");
}
