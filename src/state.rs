//! Application state shared across the operational handlers

use axum::extract::FromRef;
use std::sync::Arc;

use crate::indexer::ReconciliationService;
use crate::services::AnalyticsService;
use crate::store::LedgerStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub reconciler: Arc<ReconciliationService>,
    pub analytics: Arc<AnalyticsService>,
}

impl AppState {
    pub fn new(store: Arc<dyn LedgerStore>, reconciler: Arc<ReconciliationService>) -> Self {
        Self {
            analytics: Arc::new(AnalyticsService::new(store.clone())),
            store,
            reconciler,
        }
    }
}

impl FromRef<AppState> for Arc<ReconciliationService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.reconciler.clone()
    }
}

impl FromRef<AppState> for Arc<AnalyticsService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.analytics.clone()
    }
}
