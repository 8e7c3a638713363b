//! Call context: deadline and cancellation.
//!
//! Every cache and backing-store call the protocol issues is wrapped in
//! [`Context::run`], which refuses to start once the context is done and
//! aborts the call as soon as the deadline passes or a cancel handle fires.

use std::future::Future;
use std::time::Duration;

use futures_util::future::{select_all, BoxFuture, FutureExt};
use lockstep_core::{LockstepError, LockstepResult};
use tokio::sync::watch;
use tokio::time::Instant;

/// Deadline plus cancellation signals, cheap to clone and share across
/// concurrent sub-calls.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancels: Vec<watch::Receiver<bool>>,
}

/// Fires the cancellation signal of every context derived from it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context that never expires and cannot be canceled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that expires after `timeout`. An earlier deadline
    /// already on the context wins.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derive a cancelable context. Cancellation of the parent still
    /// applies to the child.
    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancels.push(rx);
        (self, CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_canceled(&self) -> bool {
        self.cancels.iter().any(|rx| *rx.borrow())
    }

    /// `Err` once the context is canceled or past its deadline.
    pub fn check(&self) -> LockstepResult<()> {
        if self.is_canceled() {
            return Err(LockstepError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(LockstepError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Run `fut` under this context.
    ///
    /// Returns `Canceled` or `DeadlineExceeded` instead of the call's own
    /// result when the context finishes first; the call future is dropped.
    pub async fn run<F, T>(&self, fut: F) -> LockstepResult<T>
    where
        F: Future<Output = LockstepResult<T>>,
    {
        self.check()?;

        tokio::select! {
            biased;
            _ = self.canceled() => Err(LockstepError::Canceled),
            _ = self.expired() => Err(LockstepError::DeadlineExceeded),
            result = fut => result,
        }
    }

    async fn canceled(&self) {
        if self.cancels.is_empty() {
            return std::future::pending().await;
        }

        let waits: Vec<BoxFuture<'static, ()>> = self
            .cancels
            .iter()
            .cloned()
            .map(|mut rx| {
                async move {
                    // A dropped handle can never cancel.
                    let closed = rx.wait_for(|canceled| *canceled).await.is_err();
                    if closed {
                        std::future::pending::<()>().await;
                    }
                }
                .boxed()
            })
            .collect();

        select_all(waits).await;
    }

    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
