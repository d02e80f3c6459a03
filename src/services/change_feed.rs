use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::change::FeedMessage;
use crate::error::AppResult;

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a subscription to row changes on `table`.
    async fn subscribe(&self, table: &str) -> AppResult<FeedSubscription>;
}

/// A live subscription to a change feed.
///
/// The subscription is released exactly once: by [`FeedSubscription::close`]
/// or, failing that, when the value is dropped.
pub struct FeedSubscription {
    events: mpsc::Receiver<FeedMessage>,
    closer: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    /// `closer` is fired on release; `worker`, when given, is awaited by `close`.
    pub fn new(
        events: mpsc::Receiver<FeedMessage>,
        closer: oneshot::Sender<()>,
        worker: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            events,
            closer: Some(closer),
            worker,
        }
    }

    /// Waits for the next message. `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<FeedMessage> {
        self.events.recv().await
    }

    /// Returns a message that is already queued, without waiting.
    pub fn try_next(&mut self) -> Option<FeedMessage> {
        self.events.try_recv().ok()
    }

    pub async fn close(mut self) {
        self.release();
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                debug!("change feed worker ended abnormally: {err}");
            }
        }
    }

    fn release(&mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
