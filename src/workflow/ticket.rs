use tracing::{debug, info};

use crate::context::AppContext;
use crate::domain::ticket::TicketForm;
use crate::error::AppResult;
use crate::services::CreatedTicket;
use crate::sync::SyncHandle;

/// Submits the form's description for creation.
///
/// Nothing is sent when the description is too short. On success the form is
/// cleared and, when a sync controller is running, the list is reloaded so the
/// new ticket shows up without waiting for the feed. On failure the form keeps
/// its text.
pub async fn submit_ticket(
    ctx: &AppContext,
    form: &mut TicketForm,
    sync: Option<&SyncHandle>,
) -> AppResult<CreatedTicket> {
    let draft = form.draft()?;
    debug!(chars = form.char_count(), "submitting ticket");

    let created = ctx.intake.create_ticket(&draft).await?;
    info!(id = ?created.id, "ticket accepted");
    form.clear();

    if let Some(sync) = sync {
        sync.refetch().await;
    }
    Ok(created)
}
