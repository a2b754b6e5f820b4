use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore as _;
use thiserror::Error;
use tracing::debug;

use toolgate_auth::signing::bytes_to_hex;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: Instant,
    pub last_activity: Instant,
}

#[derive(Debug, Error)]
#[error("Too many active sessions")]
pub struct SessionExhaustion;

/// In-process session store keyed by the `Mcp-Session-Id` header value.
///
/// Sessions are created by `initialize`, touched by every subsequent request,
/// and removed by the periodic reaper once idle past TTL plus a grace period
/// that protects in-flight long requests.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    max_sessions: usize,
    ttl: Duration,
    grace: Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize, ttl: Duration, grace: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            ttl,
            grace,
        }
    }

    fn generate_id() -> String {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes_to_hex(&bytes)
    }

    /// Create a session, reaping expired ones first if at the cap.
    pub fn create(&self) -> Result<String, SessionExhaustion> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions.len() >= self.max_sessions {
            Self::reap_locked(&mut sessions, self.ttl + self.grace);
            if sessions.len() >= self.max_sessions {
                return Err(SessionExhaustion);
            }
        }

        let id = Self::generate_id();
        let now = Instant::now();
        sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                created_at: now,
                last_activity: now,
            },
        );
        debug!(session_id = %id, "session created");
        Ok(id)
    }

    /// Update `last_activity`; returns whether the session exists.
    pub fn touch(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(id) {
            Some(session) => {
                session.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reap_locked(sessions: &mut HashMap<String, Session>, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }

    /// Remove every session idle past TTL + grace, returning the removed ids
    /// so the caller can close their SSE clients.
    pub fn reap_expired(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Self::reap_locked(&mut sessions, self.ttl + self.grace)
    }
}
