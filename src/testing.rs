//! In-memory stand-ins for the remote services, shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::domain::change::FeedMessage;
use crate::domain::ticket::{NewTicket, Ticket, TicketId, parse_timestamp};
use crate::error::{AppError, AppResult};
use crate::services::{
    ChangeFeed, CreatedTicket, FeedSubscription, ServiceHealth, TicketIntake, TicketStore,
};

pub fn ticket(id: &str, created_at: &str) -> Ticket {
    Ticket {
        id: TicketId::from(id),
        created_at: parse_timestamp(created_at).unwrap(),
        description: format!("Descripción del ticket {id} con detalle suficiente"),
        category: None,
        sentiment: None,
        processed: false,
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

type Listing = AppResult<Vec<Ticket>>;

enum Scripted {
    Ready(Listing),
    Gated(oneshot::Receiver<Listing>),
}

/// Serves scripted listings in call order, then falls back to `rows`.
pub struct MockStore {
    rows: Mutex<Vec<Ticket>>,
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
}

impl MockStore {
    pub fn with_rows(rows: Vec<Ticket>) -> Self {
        Self {
            rows: Mutex::new(rows),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_rows(&self, rows: Vec<Ticket>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn push_error(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Ready(Err(AppError::Load(message.to_string()))));
    }

    /// Queues a listing that stays pending until the returned sender fires.
    pub fn push_gate(&self) -> oneshot::Sender<Listing> {
        let (tx, rx) = oneshot::channel();
        self.script.lock().unwrap().push_back(Scripted::Gated(rx));
        tx
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TicketStore for MockStore {
    async fn list_tickets(&self) -> AppResult<Vec<Ticket>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Ready(result)) => result,
            Some(Scripted::Gated(gate)) => gate
                .await
                .unwrap_or_else(|_| Err(AppError::Load("gate dropped".to_string()))),
            None => Ok(self.rows.lock().unwrap().clone()),
        }
    }
}

/// Hands out subscriptions whose messages are pushed by the test.
pub struct MockFeed {
    sender: Mutex<Option<mpsc::Sender<FeedMessage>>>,
    subscriptions: AtomicUsize,
    closed: Arc<AtomicUsize>,
    fail: bool,
}

impl MockFeed {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            subscriptions: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub async fn send(&self, message: FeedMessage) {
        let sender = self.sender.lock().unwrap().clone();
        sender
            .expect("no open subscription")
            .send(message)
            .await
            .expect("subscription dropped");
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeFeed for MockFeed {
    async fn subscribe(&self, _table: &str) -> AppResult<FeedSubscription> {
        if self.fail {
            return Err(AppError::Feed("realtime unavailable".to_string()));
        }
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        *self.sender.lock().unwrap() = Some(tx);

        let (closer, released) = oneshot::channel::<()>();
        let closed = self.closed.clone();
        let worker = tokio::spawn(async move {
            let _ = released.await;
            closed.fetch_add(1, Ordering::SeqCst);
        });
        Ok(FeedSubscription::new(rx, closer, Some(worker)))
    }
}

/// Records submissions and answers with a fixed outcome.
pub struct MockIntake {
    pub submitted: Mutex<Vec<String>>,
    fail: bool,
}

impl MockIntake {
    pub fn accepting() -> Self {
        Self {
            submitted: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            submitted: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn submissions(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl TicketIntake for MockIntake {
    async fn create_ticket(&self, draft: &NewTicket) -> AppResult<CreatedTicket> {
        self.submitted
            .lock()
            .unwrap()
            .push(draft.description().to_string());
        if self.fail {
            return Err(AppError::Submission);
        }
        Ok(CreatedTicket {
            id: Some(TicketId::from("created")),
            message: Some("Ticket created successfully.".to_string()),
            request_id: None,
        })
    }

    async fn health(&self) -> AppResult<ServiceHealth> {
        Ok(ServiceHealth {
            status: "healthy".to_string(),
            supabase_connected: true,
            huggingface_configured: true,
            huggingface_reachable: Some(true),
        })
    }
}

/// Answers a single HTTP request with `status` and a JSON `body`.
///
/// Returns the base URL and a handle yielding the raw request text.
pub async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let read = stream.read(&mut buf).await.unwrap();
            if read == 0 {
                break;
            }
            request.extend_from_slice(&buf[..read]);
            if request_complete(&request) {
                break;
            }
        }

        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        String::from_utf8_lossy(&request).into_owned()
    });

    (format!("http://{addr}"), handle)
}

fn request_complete(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..header_end]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    request.len() >= header_end + 4 + content_length
}
