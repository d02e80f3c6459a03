use std::time::Duration;

use clap::Args;
use tracing::debug;

use crate::context::AppContext;
use crate::domain::collection::TicketCollection;
use crate::domain::ticket::{Ticket, TicketForm, TicketId};
use crate::error::{AppError, AppResult};
use crate::services::CreatedTicket;
use crate::sync::{SyncHandle, SyncState, TicketSync};
use crate::workflow::ticket::submit_ticket;

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Problem description, at least 30 characters.
    pub description: String,
    /// Keep running until the classifier has processed the new ticket.
    #[arg(short, long)]
    pub follow: bool,
    /// Seconds to wait for classification when following.
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,
}

pub async fn list(ctx: &AppContext) -> AppResult<()> {
    let rows = ctx.store.list_tickets().await?;
    let tickets = TicketCollection::from_rows(rows);
    println!("{}", render_tickets(&tickets));
    Ok(())
}

/// Prints the list and reprints it whenever it changes, until Ctrl-C.
pub async fn watch(ctx: &AppContext) -> AppResult<()> {
    ctx.config.require_supabase()?;
    let sync = TicketSync::start(ctx.store.clone(), ctx.feed.clone(), ctx.sync_options()).await;
    let mut updates = sync.observe();
    let mut last_printed = String::new();

    loop {
        let rendered = render_state(&updates.borrow_and_update());
        if rendered != last_printed {
            println!("{rendered}\n");
            last_printed = rendered;
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted");
                break;
            }
        }
    }

    sync.shutdown().await;
    Ok(())
}

pub async fn create(ctx: &AppContext, args: CreateArgs) -> AppResult<()> {
    let mut form = TicketForm::new(args.description);
    if !args.follow {
        let created = submit_reporting(ctx, &mut form, None).await?;
        print_created(&created);
        return Ok(());
    }

    ctx.config.require_supabase()?;
    let sync = TicketSync::start(ctx.store.clone(), ctx.feed.clone(), ctx.sync_options()).await;
    let handle = sync.handle();
    let outcome = match submit_reporting(ctx, &mut form, Some(&handle)).await {
        Ok(created) => {
            print_created(&created);
            match &created.id {
                Some(id) => {
                    let limit = Duration::from_secs(args.timeout);
                    match follow(&handle, id, limit).await {
                        Some(ticket) => println!("{}", render_ticket(&ticket)),
                        None => println!(
                            "Ticket {id} not classified after {}s; check again with `desk list`.",
                            args.timeout
                        ),
                    }
                }
                None => println!("The service did not return a ticket id; nothing to follow."),
            }
            Ok(())
        }
        Err(err) => Err(err),
    };
    sync.shutdown().await;
    outcome
}

pub async fn health(ctx: &AppContext) -> AppResult<()> {
    let health = ctx.intake.health().await?;
    println!("Service: {}", ctx.config.api_url);
    println!("Status: {}", health.status);
    println!("Supabase connected: {}", yes_no(health.supabase_connected));
    println!(
        "Classifier configured: {}",
        yes_no(health.huggingface_configured)
    );
    if let Some(reachable) = health.huggingface_reachable {
        println!("Classifier reachable: {}", yes_no(reachable));
    }

    if health.is_healthy() {
        Ok(())
    } else {
        Err(AppError::Service(format!(
            "classification service reports '{}'",
            health.status
        )))
    }
}

async fn submit_reporting(
    ctx: &AppContext,
    form: &mut TicketForm,
    sync: Option<&SyncHandle>,
) -> AppResult<CreatedTicket> {
    let result = submit_ticket(ctx, form, sync).await;
    match &result {
        Err(AppError::Submission) => {
            eprintln!("Your description was kept:\n{}", form.description);
        }
        Err(AppError::DescriptionTooShort { .. }) if !form.is_ready() => {
            eprintln!(
                "Add at least {} more characters to describe the problem.",
                form.remaining_chars()
            );
        }
        _ => {}
    }
    result
}

async fn follow(handle: &SyncHandle, id: &TicketId, limit: Duration) -> Option<Ticket> {
    let mut updates = handle.observe();
    let processed = async {
        loop {
            if let Some(ticket) = processed_ticket(&updates.borrow_and_update(), id) {
                return Some(ticket);
            }
            if updates.changed().await.is_err() {
                return None;
            }
        }
    };
    tokio::time::timeout(limit, processed).await.ok().flatten()
}

fn processed_ticket(state: &SyncState, id: &TicketId) -> Option<Ticket> {
    state
        .tickets
        .get(id)
        .filter(|ticket| ticket.processed)
        .cloned()
}

fn print_created(created: &CreatedTicket) {
    println!(
        "{}",
        created
            .message
            .as_deref()
            .unwrap_or("Ticket created successfully.")
    );
    if let Some(id) = &created.id {
        println!("Ticket id: {id}");
    }
    if let Some(request_id) = &created.request_id {
        println!("Request id: {request_id}");
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

pub fn render_ticket(ticket: &Ticket) -> String {
    let mut header = format!(
        "{}  {}  {}",
        ticket.created_at.format("%Y-%m-%d %H:%M"),
        ticket.status_label(),
        ticket.id
    );
    if let Some(category) = ticket.category {
        header.push_str(&format!("  [{}]", category.as_str()));
    }
    if let Some(sentiment) = ticket.sentiment {
        header.push_str(&format!("  [{}]", sentiment.as_str()));
    }
    format!("{header}\n    {}", ticket.summary())
}

pub fn render_tickets(tickets: &TicketCollection) -> String {
    if tickets.is_empty() {
        return "No tickets yet.".to_string();
    }
    tickets
        .iter()
        .map(render_ticket)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_state(state: &SyncState) -> String {
    let mut out = String::new();
    if let Some(error) = &state.error {
        out.push_str(&format!("! {error}\n"));
    }
    if state.loading && state.tickets.is_empty() {
        out.push_str("Loading tickets...");
    } else {
        out.push_str(&render_tickets(&state.tickets));
    }
    out
}
