//! Application state

use std::sync::Arc;

use ledgerlink_reconcile::ReconcileService;

use crate::{auth::AuthStateStore, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub reconcile: Arc<ReconcileService>,
    pub auth_states: Arc<dyn AuthStateStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        reconcile: Arc<ReconcileService>,
        auth_states: Arc<dyn AuthStateStore>,
    ) -> Self {
        Self {
            config,
            reconcile,
            auth_states,
        }
    }
}
