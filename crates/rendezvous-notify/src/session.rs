use std::sync::{Arc, RwLock};

use rendezvous_core::types::SessionContext;

#[derive(Debug, Default)]
struct SessionState {
    context: Option<SessionContext>,
    epoch: u64,
}

/// Shared view of the current session and its epoch.
///
/// Every change of context (including clearing it) bumps the epoch, so work
/// captured under an older epoch can tell it is stale.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    state: Arc<RwLock<SessionState>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `ctx` and return the new epoch.
    pub fn set(&self, ctx: SessionContext) -> u64 {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.context = Some(ctx);
        state.epoch += 1;
        state.epoch
    }

    /// Drop the context and return the new epoch.
    pub fn clear(&self) -> u64 {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.context = None;
        state.epoch += 1;
        state.epoch
    }

    pub fn current(&self) -> Option<SessionContext> {
        self.read().context.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Context and epoch read under one lock.
    pub fn snapshot(&self) -> (Option<SessionContext>, u64) {
        let state = self.read();
        (state.context.clone(), state.epoch)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }
}
