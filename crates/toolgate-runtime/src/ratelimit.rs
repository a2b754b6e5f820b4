use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

// Empty windows are swept on every Nth touch so per-IP keying cannot grow
// the map without bound.
const PURGE_EVERY_OPS: u64 = 256;

const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct RateLimiterOptions {
    pub max_requests: usize,
    pub window: Duration,
}

struct LimiterState {
    windows: HashMap<String, VecDeque<Instant>>,
    ops: u64,
}

/// Sliding-window counter per string key.
///
/// A key's window holds only timestamps newer than `now - window`; pruning
/// happens on every touch of that key.
pub struct RateLimiter {
    opts: RateLimiterOptions,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(opts: RateLimiterOptions) -> Self {
        Self {
            opts,
            state: Mutex::new(LimiterState {
                windows: HashMap::new(),
                ops: 0,
            }),
        }
    }

    // `checked_sub` guards against Instant underflow near process start.
    fn horizon(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(self.opts.window)
    }

    fn prune(window: &mut VecDeque<Instant>, horizon: Option<Instant>) {
        let Some(horizon) = horizon else {
            return;
        };
        while window.front().is_some_and(|t| *t < horizon) {
            window.pop_front();
        }
    }

    fn sweep(state: &mut LimiterState, horizon: Option<Instant>) {
        state.ops += 1;
        if state.ops % PURGE_EVERY_OPS == 0 {
            for window in state.windows.values_mut() {
                Self::prune(window, horizon);
            }
            state.windows.retain(|_, w| !w.is_empty());
        }
    }

    /// Record a hit if the key has budget left; returns whether it was
    /// allowed.
    pub fn check_limit(&self, key: &str) -> bool {
        let now = Instant::now();
        let horizon = self.horizon(now);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::sweep(&mut state, horizon);

        let window = state.windows.entry(key.to_string()).or_default();
        Self::prune(window, horizon);
        if window.len() >= self.opts.max_requests {
            return false;
        }
        window.push_back(now);
        true
    }

    pub fn current_count(&self, key: &str) -> usize {
        let horizon = self.horizon(Instant::now());
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.windows.get_mut(key) {
            Some(window) => {
                Self::prune(window, horizon);
                window.len()
            }
            None => 0,
        }
    }

    /// How long until the key's oldest hit ages out of the window.
    pub fn time_until_slot(&self, key: &str) -> Duration {
        let now = Instant::now();
        let horizon = self.horizon(now);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(window) = state.windows.get_mut(key) else {
            return Duration::ZERO;
        };
        Self::prune(window, horizon);
        match window.front() {
            Some(oldest) => (*oldest + self.opts.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Retry `check_limit` with exponential backoff (100 ms doubling, capped
    /// at 1 s) until a slot opens. Waiters are not FIFO; each retries
    /// independently.
    pub async fn wait_for_slot(&self, key: &str) {
        let mut backoff = BACKOFF_START;
        loop {
            if self.check_limit(key) {
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    pub fn clear(&self, key: &str) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .windows
            .remove(key);
    }

    pub fn clear_all(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .windows
            .clear();
    }

    pub fn tracked_keys(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .windows
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: usize, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterOptions {
            max_requests,
            window: Duration::from_millis(window_ms),
        })
    }

    #[tokio::test]
    async fn fourth_request_is_refused_then_window_slides() {
        let rl = limiter(3, 50);
        assert!(rl.check_limit("x"));
        assert!(rl.check_limit("x"));
        assert!(rl.check_limit("x"));
        assert!(!rl.check_limit("x"));
        assert_eq!(rl.current_count("x"), 3);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rl.check_limit("x"));
    }

    #[test]
    fn keys_are_independent() {
        let rl = limiter(1, 60_000);
        assert!(rl.check_limit("a"));
        assert!(!rl.check_limit("a"));
        assert!(rl.check_limit("b"));
    }

    #[test]
    fn time_until_slot_is_zero_with_budget() {
        let rl = limiter(2, 60_000);
        assert_eq!(rl.time_until_slot("x"), Duration::ZERO);
        rl.check_limit("x");
        rl.check_limit("x");
        let wait = rl.time_until_slot("x");
        assert!(wait > Duration::from_secs(59));
        assert!(wait <= Duration::from_secs(60));
    }

    #[test]
    fn clear_resets_a_single_key() {
        let rl = limiter(1, 60_000);
        rl.check_limit("a");
        rl.check_limit("b");
        rl.clear("a");
        assert!(rl.check_limit("a"));
        assert!(!rl.check_limit("b"));
        rl.clear_all();
        assert!(rl.check_limit("b"));
    }

    #[tokio::test]
    async fn wait_for_slot_returns_after_window() {
        let rl = limiter(1, 40);
        assert!(rl.check_limit("x"));
        let start = Instant::now();
        rl.wait_for_slot("x").await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn empty_windows_are_purged() {
        let rl = limiter(4, 1);
        rl.check_limit("stale");
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Touch other keys enough times to trigger a sweep.
        for i in 0..(PURGE_EVERY_OPS + 1) {
            rl.check_limit(&format!("k{}", i % 4));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        for i in 0..(PURGE_EVERY_OPS + 1) {
            rl.check_limit(&format!("k{}", i % 4));
        }
        assert!(rl.tracked_keys() <= 5);
        assert_eq!(rl.current_count("stale"), 0);
    }
}
