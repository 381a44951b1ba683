//! The handle returned to callers for a passed entry.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::chain;
use crate::chain::SlotChain;
use crate::context::EntryContext;

/// A live entry on a protected resource.
///
/// Holds the pipeline context until [`Entry::exit`] runs the completion
/// phase and returns the context to the pool. `exit` is idempotent, and
/// dropping an un-exited entry exits it, so a handle that goes out of scope
/// on an early return still completes its accounting exactly once.
pub struct Entry {
    ctx: Mutex<Option<Box<EntryContext>>>,
    chain: Arc<SlotChain>,
}

impl Entry {
    pub(crate) fn new(ctx: Box<EntryContext>, chain: Arc<SlotChain>) -> Self {
        Self {
            ctx: Mutex::new(Some(ctx)),
            chain,
        }
    }

    /// Complete the entry: record response time and completion counts, then
    /// release the context. Safe to call more than once.
    pub fn exit(&self) {
        let taken = self
            .ctx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut ctx) = taken {
            self.chain.exit(&mut ctx);
            chain::release_context(ctx);
        }
    }

    /// Record an error against this entry so completion accounting counts
    /// it. A no-op after exit.
    pub fn trace_error(&self, message: impl Into<String>) {
        if let Some(ctx) = self
            .ctx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            ctx.set_error(message.into());
        }
    }

    /// Whether `exit` has already run.
    pub fn is_exited(&self) -> bool {
        self.ctx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// The resource name this entry was opened against, until exit.
    pub fn resource_name(&self) -> Option<String> {
        self.ctx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|ctx| ctx.resource().name().to_string())
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.exit();
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("exited", &self.is_exited())
            .finish()
    }
}
