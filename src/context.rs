use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{ChangeFeed, TicketIntake, TicketStore};
use crate::sync::SyncOptions;

#[derive(Clone)]
pub struct AppContext {
    pub config: AppConfig,
    pub store: Arc<dyn TicketStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub intake: Arc<dyn TicketIntake>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn TicketStore>,
        feed: Arc<dyn ChangeFeed>,
        intake: Arc<dyn TicketIntake>,
    ) -> Self {
        Self {
            config,
            store,
            feed,
            intake,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            table: self.config.table.clone(),
            policy: self.config.reconcile_policy,
        }
    }
}
