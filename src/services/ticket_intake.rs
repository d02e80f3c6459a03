use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::ticket::{NewTicket, TicketId};
use crate::error::AppResult;

/// What the classification service reports back after accepting a ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatedTicket {
    pub id: Option<TicketId>,
    pub message: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceHealth {
    pub status: String,
    #[serde(default)]
    pub supabase_connected: bool,
    #[serde(default)]
    pub huggingface_configured: bool,
    #[serde(default)]
    pub huggingface_reachable: Option<bool>,
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[async_trait]
pub trait TicketIntake: Send + Sync {
    async fn create_ticket(&self, draft: &NewTicket) -> AppResult<CreatedTicket>;
    async fn health(&self) -> AppResult<ServiceHealth>;
}
