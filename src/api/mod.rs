//! Read-only HTTP surface over the cost and alert stores, plus an on-demand
//! backfill trigger.

pub mod handlers;
pub mod router;

pub use router::{create_router, start_server};

use std::sync::Arc;

use crate::scheduler::Scheduler;
use crate::storage::{AlertStore, CostStore, Stores};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub costs: Arc<dyn CostStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(stores: &Stores, scheduler: Arc<Scheduler>) -> Self {
        Self {
            costs: stores.costs.clone(),
            alerts: stores.alerts.clone(),
            scheduler,
        }
    }
}
