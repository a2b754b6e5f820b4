use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::sse::SseHub;

/// Server-to-client requests (`sampling/createMessage` and friends) sent over
/// a session's SSE stream and resolved by JSON-RPC responses POSTed back.
///
/// Each pending request carries its own timeout; `cancel_all` rejects every
/// outstanding resolver at shutdown.
pub struct PendingSamplings {
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value, String>>>>,
    next_id: AtomicI64,
    timeout: Duration,
}

impl PendingSamplings {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            timeout,
        }
    }

    pub async fn request(
        &self,
        hub: &SseHub,
        session_key: &str,
        method: &str,
        params: Value,
    ) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if hub.broadcast(session_key, &msg) == 0 {
            self.take(id);
            anyhow::bail!("no SSE clients connected for session");
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => anyhow::bail!("client rejected request: {message}"),
            Ok(Err(_)) => anyhow::bail!("request cancelled"),
            Err(_) => {
                self.take(id);
                anyhow::bail!("request timed out after {:?}", self.timeout)
            }
        }
    }

    fn take(&self, id: i64) -> Option<oneshot::Sender<Result<Value, String>>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    /// Route a JSON-RPC response from the client to its waiting resolver.
    /// Returns whether anything was waiting on that id.
    pub fn resolve(&self, id: i64, outcome: Result<Value, String>) -> bool {
        match self.take(id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Reject every pending resolver; invoked during shutdown before the SSE
    /// clients are closed.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err("server shutting down".to_string()));
        }
        if count > 0 {
            debug!(count, "cancelled pending sampling requests");
        }
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn resolve_completes_request() {
        let hub = Arc::new(SseHub::new());
        let _stream = hub.register("s1");
        let samplings = Arc::new(PendingSamplings::new(Duration::from_secs(5)));

        let s2 = samplings.clone();
        let hub2 = hub.clone();
        let task = tokio::spawn(async move {
            s2.request(&hub2, "s1", "sampling/createMessage", serde_json::json!({}))
                .await
        });

        // Wait for the request to be registered, then answer it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(samplings.len(), 1);
        assert!(samplings.resolve(1, Ok(serde_json::json!({"text": "hi"}))));

        let result = task.await.expect("join").expect("resolved");
        assert_eq!(result["text"], "hi");
        assert!(samplings.is_empty());
    }

    #[tokio::test]
    async fn request_fails_without_clients() {
        let hub = Arc::new(SseHub::new());
        let samplings = PendingSamplings::new(Duration::from_secs(1));
        let err = samplings
            .request(&hub, "nobody", "sampling/createMessage", serde_json::json!({}))
            .await
            .expect_err("no clients");
        assert!(err.to_string().contains("no SSE clients"));
        assert!(samplings.is_empty());
    }

    #[tokio::test]
    async fn request_times_out() {
        let hub = Arc::new(SseHub::new());
        let _stream = hub.register("s1");
        let samplings = PendingSamplings::new(Duration::from_millis(30));
        let err = samplings
            .request(&hub, "s1", "sampling/createMessage", serde_json::json!({}))
            .await
            .expect_err("timeout");
        assert!(err.to_string().contains("timed out"));
        assert!(samplings.is_empty());
    }

    #[tokio::test]
    async fn cancel_all_rejects_pending() {
        let hub = Arc::new(SseHub::new());
        let _stream = hub.register("s1");
        let samplings = Arc::new(PendingSamplings::new(Duration::from_secs(5)));

        let s2 = samplings.clone();
        let hub2 = hub.clone();
        let task = tokio::spawn(async move {
            s2.request(&hub2, "s1", "sampling/createMessage", serde_json::json!({}))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        samplings.cancel_all();

        let err = task.await.expect("join").expect_err("cancelled");
        assert!(err.to_string().contains("shutting down"));
    }
}
