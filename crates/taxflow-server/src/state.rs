use std::sync::Arc;
use taxflow_core::scheduler::Scheduler;
use taxflow_core::store::StateStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    pub fn store(&self) -> Arc<StateStore> {
        self.scheduler.store().clone()
    }
}
