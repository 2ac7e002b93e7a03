//! Shared application state for the HTTP front end.

use std::sync::Arc;

use crate::session::SessionBook;
use crate::supervisor::Supervisor;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub sessions: Arc<SessionBook>,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            sessions: Arc::new(SessionBook::default()),
        }
    }
}
