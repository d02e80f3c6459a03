use async_trait::async_trait;

use crate::domain::ticket::Ticket;
use crate::error::AppResult;

#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Every ticket row, newest first.
    async fn list_tickets(&self) -> AppResult<Vec<Ticket>>;
}
