//! Ticket sync controller.
//!
//! Keeps a locally cached, newest-first view of the remote ticket table. The
//! controller performs an initial load, holds one change subscription for its
//! whole lifetime and reconciles every notification into the cached list.
//! Consumers read the latest [`SyncState`] or observe it through a
//! [`watch`] channel.
//!
//! Loads may overlap (a manual refetch racing a feed-triggered reload); each
//! completed load replaces the whole list, so the last completion wins. Once
//! the controller is torn down no completion touches the state again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::change::{ChangeEvent, FeedMessage};
use crate::domain::collection::TicketCollection;
use crate::services::{ChangeFeed, FeedSubscription, TicketStore};

/// How change notifications are folded into the cached list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcilePolicy {
    /// Reload the full list on every notification.
    #[default]
    FullReload,
    /// Patch the list in place from the notification's row.
    Incremental,
}

impl ReconcilePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcilePolicy::FullReload => "full",
            ReconcilePolicy::Incremental => "incremental",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "full" | "full-reload" | "reload" => Some(ReconcilePolicy::FullReload),
            "incremental" | "patch" => Some(ReconcilePolicy::Incremental),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub table: String,
    pub policy: ReconcilePolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            table: "tickets".to_string(),
            policy: ReconcilePolicy::default(),
        }
    }
}

/// A consistent snapshot of the cached tickets.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    /// Replaced, never mutated, so a changed pointer means a changed list.
    pub tickets: Arc<TicketCollection>,
    pub loading: bool,
    pub error: Option<String>,
}

impl SyncState {
    fn initial() -> Self {
        Self {
            tickets: Arc::new(TicketCollection::new()),
            loading: true,
            error: None,
        }
    }
}

struct Shared {
    store: Arc<dyn TicketStore>,
    state: watch::Sender<SyncState>,
    active: AtomicBool,
    in_flight: AtomicUsize,
}

impl Shared {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Runs one full load of the ticket list.
    async fn load(&self) {
        if !self.is_active() {
            return;
        }
        let _in_flight = InFlight::begin(self);
        let result = self.store.list_tickets().await;

        if !self.is_active() {
            debug!("discarding ticket load that finished after teardown");
            return;
        }
        match result {
            Ok(rows) => {
                let tickets = TicketCollection::from_rows(rows);
                debug!(count = tickets.len(), "ticket list refreshed");
                self.state.send_modify(|state| {
                    state.tickets = Arc::new(tickets);
                    state.error = None;
                });
            }
            Err(err) => {
                warn!("ticket load failed: {err}");
                self.state.send_modify(|state| state.error = Some(err.to_string()));
            }
        }
    }

    fn patch(&self, event: ChangeEvent) {
        if !self.is_active() {
            return;
        }
        let kind = event.kind;
        self.state.send_if_modified(|state| {
            let mut next = TicketCollection::clone(&state.tickets);
            match next.apply(event) {
                Ok(true) => {
                    state.tickets = Arc::new(next);
                    true
                }
                Ok(false) => {
                    debug!(?kind, "notification already reflected");
                    false
                }
                Err(err) => {
                    warn!("could not apply notification: {err}");
                    state.error = Some(err.to_string());
                    true
                }
            }
        });
    }

    fn record_error(&self, message: String) {
        if self.is_active() {
            self.state.send_modify(|state| state.error = Some(message));
        }
    }

    /// Like `record_error`, but keeps an error already being shown.
    fn add_error(&self, message: String) {
        if self.is_active() {
            self.state.send_modify(|state| {
                state.error = Some(match state.error.take() {
                    Some(existing) => format!("{existing}; {message}"),
                    None => message,
                });
            });
        }
    }
}

/// Marks a load as in flight; `loading` drops back once no load remains,
/// on every exit path.
struct InFlight<'a> {
    shared: &'a Shared,
}

impl<'a> InFlight<'a> {
    fn begin(shared: &'a Shared) -> Self {
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        shared.state.send_modify(|state| {
            state.loading = true;
            state.error = None;
        });
        Self { shared }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let remaining = self.shared.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        if self.shared.is_active() {
            self.shared
                .state
                .send_if_modified(|state| {
                    let loading = remaining > 0;
                    let changed = state.loading != loading;
                    state.loading = loading;
                    changed
                });
        }
    }
}

/// Cloneable access to a running controller for presentation code.
#[derive(Clone)]
pub struct SyncHandle {
    shared: Arc<Shared>,
}

impl SyncHandle {
    pub fn state(&self) -> SyncState {
        self.shared.state.borrow().clone()
    }

    pub fn observe(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    /// Runs a full reload. A no-op once the controller is gone.
    pub async fn refetch(&self) {
        self.shared.load().await;
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }
}

pub struct TicketSync {
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl TicketSync {
    /// Opens the change subscription and begins the initial load.
    ///
    /// A subscription failure is reported through `error`; the controller
    /// then still serves loads and refetches.
    pub async fn start(
        store: Arc<dyn TicketStore>,
        feed: Arc<dyn ChangeFeed>,
        options: SyncOptions,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::initial());
        let shared = Arc::new(Shared {
            store,
            state,
            active: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
        });

        let (subscription, subscribe_error) = match feed.subscribe(&options.table).await {
            Ok(subscription) => (Some(subscription), None),
            Err(err) => {
                warn!("live ticket updates unavailable: {err}");
                (None, Some(err.to_string()))
            }
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let worker = tokio::spawn(run_worker(
            shared.clone(),
            subscription,
            subscribe_error,
            options.policy,
            shutdown_rx,
        ));
        info!(table = %options.table, policy = options.policy.as_str(), "ticket sync started");

        Self {
            shared,
            shutdown: Some(shutdown),
            worker: Some(worker),
        }
    }

    pub fn state(&self) -> SyncState {
        self.shared.state.borrow().clone()
    }

    pub fn observe(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    pub async fn refetch(&self) {
        self.shared.load().await;
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            shared: self.shared.clone(),
        }
    }

    /// Stops reconciling and releases the subscription before returning.
    pub async fn shutdown(mut self) {
        self.deactivate();
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                warn!("ticket sync worker ended abnormally: {err}");
            }
        }
    }

    fn deactivate(&mut self) {
        self.shared.active.store(false, Ordering::Release);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
            info!("ticket sync stopped");
        }
    }
}

impl Drop for TicketSync {
    fn drop(&mut self) {
        self.deactivate();
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    subscription: Option<FeedSubscription>,
    subscribe_error: Option<String>,
    policy: ReconcilePolicy,
    mut shutdown: oneshot::Receiver<()>,
) {
    let stopped = tokio::select! {
        _ = &mut shutdown => true,
        _ = shared.load() => false,
    };
    if let Some(message) = subscribe_error {
        shared.add_error(message);
    }

    let Some(mut subscription) = subscription else {
        if !stopped {
            let _ = shutdown.await;
        }
        return;
    };

    if !stopped {
        loop {
            let message = tokio::select! {
                _ = &mut shutdown => break,
                message = subscription.next() => message,
            };
            let Some(message) = message else {
                warn!("change feed ended, live updates stopped");
                let _ = (&mut shutdown).await;
                break;
            };
            tokio::select! {
                _ = &mut shutdown => break,
                _ = reconcile(&shared, policy, message, &mut subscription) => {}
            }
        }
    }

    subscription.close().await;
}

async fn reconcile(
    shared: &Shared,
    policy: ReconcilePolicy,
    message: FeedMessage,
    subscription: &mut FeedSubscription,
) {
    match (policy, message) {
        (_, FeedMessage::Fault(reason)) => shared.record_error(reason),
        (ReconcilePolicy::Incremental, FeedMessage::Change(event)) => shared.patch(event),
        (_, FeedMessage::Resubscribed) => {
            info!("change feed resubscribed, reloading tickets");
            coalesce(shared, subscription);
            shared.load().await;
        }
        (ReconcilePolicy::FullReload, FeedMessage::Change(event)) => {
            debug!(kind = ?event.kind, id = ?event.ticket_id(), "ticket changed, reloading");
            coalesce(shared, subscription);
            shared.load().await;
        }
    }
}

/// Drops notifications already queued; the reload about to run covers them.
fn coalesce(shared: &Shared, subscription: &mut FeedSubscription) {
    let mut skipped = 0usize;
    while let Some(message) = subscription.try_next() {
        match message {
            FeedMessage::Fault(reason) => shared.record_error(reason),
            FeedMessage::Change(_) | FeedMessage::Resubscribed => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "coalesced queued notifications into one reload");
    }
}
