use std::sync::Arc;

use crate::services::{job_manager::JobManager, storage::MediaStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobManager>,
    pub storage: Arc<dyn MediaStore>,
}

impl AppState {
    pub fn new(jobs: Arc<JobManager>) -> Self {
        Self {
            storage: jobs.store().clone(),
            jobs,
        }
    }
}
