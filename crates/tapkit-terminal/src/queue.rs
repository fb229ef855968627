//! FIFO command queue with single-command execution.
//!
//! Every device-directed lifecycle command goes through one bounded queue
//! consumed by a single worker task, so at most one command runs against
//! the driver at a time and commands settle in submission order. A
//! command's future is built only when its turn arrives; its failure
//! neither blocks nor cancels the commands behind it.

use futures::future::BoxFuture;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::error::{Result, TerminalError};

struct Job {
    label: &'static str,
    run: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

/// Submission handle to the queue worker.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Job>,
}

impl CommandQueue {
    /// Spawn the worker on `tasks` and return the submission handle.
    pub fn start(capacity: usize, tasks: &mut JoinSet<()>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity);
        tasks.spawn(async move {
            while let Some(job) = rx.recv().await {
                debug!(command = job.label, "command started");
                (job.run)().await;
                debug!(command = job.label, "command settled");
            }
            debug!("command queue drained");
        });
        CommandQueue { tx }
    }

    /// Run `op` once its turn arrives and hand back its result.
    ///
    /// Fails with [`TerminalError::QueueClosed`] once the worker is gone.
    pub async fn enqueue<T, F, Fut>(&self, label: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            label,
            run: Box::new(move || {
                Box::pin(async move {
                    let result = op().await;
                    let _ = done_tx.send(result);
                })
            }),
        };

        trace!(command = label, "command queued");
        self.tx
            .send(job)
            .await
            .map_err(|_| TerminalError::QueueClosed)?;

        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(TerminalError::QueueClosed),
        }
    }
}
