//! Structured task group with shared failure.
//!
//! Every session runs its tasks inside one [`WorkGroup`]. The first task that
//! fails cancels the group's token and aborts its siblings; the group then
//! reports that first failure. Cancelling the parent token from outside ends
//! the group with [`ReconnectError::Cancelled`].

use core::future::Future;

use calimero_reconnect_primitives::ReconnectError;
use eyre::{eyre, Report, Result as EyreResult};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug)]
pub struct WorkGroup {
    name: &'static str,
    parent: CancellationToken,
    token: CancellationToken,
    tasks: JoinSet<(&'static str, EyreResult<()>)>,
}

impl WorkGroup {
    #[must_use]
    pub fn new(name: &'static str, parent: &CancellationToken) -> Self {
        Self {
            name,
            parent: parent.clone(),
            token: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    /// Token cancelled when any task of the group fails.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, task: &'static str, future: F)
    where
        F: Future<Output = EyreResult<()>> + Send + 'static,
    {
        let _handle = self
            .tasks
            .spawn(async move { (task, future.await) });
    }

    /// Wait for every task. Returns the first failure, if any.
    pub async fn join(mut self) -> EyreResult<()> {
        let mut first_failure: Option<Report> = None;

        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((task, Ok(()))) => {
                    debug!(group = self.name, task, "task finished");
                    continue;
                }
                Ok((task, Err(err))) => {
                    if first_failure.is_none() {
                        error!(group = self.name, task, %err, "task failed, aborting group");
                    }
                    err
                }
                Err(err) if err.is_cancelled() => continue,
                Err(err) => eyre!("task of {} panicked: {err}", self.name),
            };

            if first_failure.is_none() {
                self.token.cancel();
                self.tasks.abort_all();
                first_failure = Some(failure);
            }
        }

        if let Some(failure) = first_failure {
            return Err(failure);
        }

        if self.parent.is_cancelled() {
            return Err(ReconnectError::Cancelled.into());
        }

        Ok(())
    }
}

/// Error returned by a task that stopped because its group was cancelled.
pub(crate) fn cancelled(task: &'static str) -> Report {
    warn!(task, "Reconnect interrupted");
    ReconnectError::Cancelled.into()
}
