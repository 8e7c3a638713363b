//! Error sink for failures the protocol recovers from internally.
//!
//! An unlock that fails after a successful write does not fail the write,
//! but someone should hear about it. The sink is that someone.

use std::fmt;
use std::sync::Arc;

use lockstep_core::LockstepError;

use crate::context::Context;

type SinkFn = dyn Fn(&Context, &LockstepError) + Send + Sync;

/// Caller-supplied hook for swallowed errors. Defaults to a `warn!` log.
#[derive(Clone)]
pub struct ErrorSink {
    hook: Arc<SinkFn>,
}

impl ErrorSink {
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&Context, &LockstepError) + Send + Sync + 'static,
    {
        Self {
            hook: Arc::new(hook),
        }
    }

    /// Sink that logs through `tracing`.
    pub fn logging() -> Self {
        Self::new(|_ctx, err| {
            tracing::warn!(error = %err, "lockstep: recovered error");
        })
    }

    pub fn report(&self, ctx: &Context, err: &LockstepError) {
        (self.hook)(ctx, err);
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::logging()
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink").finish_non_exhaustive()
    }
}
