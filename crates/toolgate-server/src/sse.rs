use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::response::sse::Event;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tracing::debug;

/// Outbound buffer per SSE client; a client that cannot drain this many
/// events is treated as dead and reaped.
const CLIENT_BUFFER: usize = 64;

/// Session key used for SSE streams opened without a session id.
pub(crate) const ANONYMOUS_SESSION: &str = "anonymous";

struct SseClient {
    id: u64,
    tx: mpsc::Sender<Event>,
    #[allow(dead_code)]
    created_at: Instant,
    last_event_id: u64,
}

/// Fan-out of server-initiated messages to the SSE clients of each session.
///
/// Events are framed `id: <n>` / `data: <json>` with a hub-wide monotonic
/// counter. Delivery preserves enqueue order per client; there is no
/// cross-client ordering.
pub struct SseHub {
    clients: Mutex<HashMap<String, Vec<SseClient>>>,
    next_client_id: AtomicU64,
    next_event_id: AtomicU64,
}

impl SseHub {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(0),
            next_event_id: AtomicU64::new(0),
        }
    }

    /// Register a client under a session key and return its event stream.
    /// The stream starts with a `: connected` comment so the transport
    /// flushes response headers immediately.
    pub fn register(self: &Arc<Self>, session_key: &str) -> ClientStream {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let _ = tx.try_send(Event::default().comment("connected"));

        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.entry(session_key.to_string()).or_default().push(SseClient {
            id,
            tx,
            created_at: Instant::now(),
            last_event_id: 0,
        });
        debug!(session = session_key, client = id, "sse client connected");

        ClientStream {
            inner: ReceiverStream::new(rx),
            hub: self.clone(),
            session_key: session_key.to_string(),
            client_id: id,
        }
    }

    /// Deliver a JSON payload to every client of a session. Clients whose
    /// buffers are full or closed are removed on the spot; the list is
    /// walked in reverse so removals do not shift pending indices. Returns
    /// the number of clients that accepted the event.
    pub fn broadcast(&self, session_key: &str, payload: &Value) -> usize {
        let data = match serde_json::to_string(payload) {
            Ok(s) => s,
            Err(_) => return 0,
        };
        let event_id = self.next_event_id.fetch_add(1, Ordering::SeqCst);

        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = clients.get_mut(session_key) else {
            return 0;
        };

        let mut delivered = 0;
        for i in (0..list.len()).rev() {
            let event = Event::default().id(event_id.to_string()).data(data.clone());
            match list[i].tx.try_send(event) {
                Ok(()) => {
                    list[i].last_event_id = event_id;
                    delivered += 1;
                }
                Err(_) => {
                    let dead = list.remove(i);
                    debug!(session = session_key, client = dead.id, "sse client reaped");
                }
            }
        }
        if list.is_empty() {
            clients.remove(session_key);
        }
        delivered
    }

    /// Drop every client of one session (session end or reap).
    pub fn close_session(&self, session_key: &str) {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_key);
    }

    /// Drop every client. Part of shutdown: in-flight streams would
    /// otherwise prevent the HTTP listener from draining.
    pub fn close_all(&self) {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    fn remove_client(&self, session_key: &str, client_id: u64) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = clients.get_mut(session_key) {
            list.retain(|c| c.id != client_id);
            if list.is_empty() {
                clients.remove(session_key);
            }
        }
    }
}

impl Default for SseHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A client's event stream. Dropping it (peer disconnect or server shutdown)
/// deregisters the client from its session bucket.
pub struct ClientStream {
    inner: ReceiverStream<Event>,
    hub: Arc<SseHub>,
    session_key: String,
    client_id: u64,
}

impl Stream for ClientStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|o| o.map(Ok))
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.hub.remove_client(&self.session_key, self.client_id);
        debug!(
            session = %self.session_key,
            client = self.client_id,
            "sse client disconnected"
        );
    }
}
