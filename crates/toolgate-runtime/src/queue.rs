use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::PipelineError;

/// What happens when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStrategy {
    /// Fail immediately with `CapacityExceeded`; never blocks.
    Reject,
    /// Enqueue a one-shot waker and wait; admitted in FIFO order.
    Queue,
    /// Poll every `sleep_interval` until a slot frees up.
    Sleep,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_concurrent: usize,
    pub strategy: AdmissionStrategy,
    pub sleep_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            strategy: AdmissionStrategy::Queue,
            sleep_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
struct QueueState {
    in_flight: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct Shared {
    opts: QueueOptions,
    state: Mutex<QueueState>,
}

impl Shared {
    fn release(&self) {
        let mut waiter = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.in_flight = st.in_flight.saturating_sub(1);
            st.waiters.pop_front()
        };
        // Signal outside the lock. A waiter whose receiver is gone is skipped
        // in favor of the next one.
        while let Some(tx) = waiter {
            if tx.send(()).is_ok() {
                break;
            }
            waiter = self
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .waiters
                .pop_front();
        }
    }
}

/// Bounded admission of concurrent in-flight work.
///
/// `in_flight` never exceeds `max_concurrent` outside of an in-progress
/// acquire; every successful acquire is paired with exactly one release
/// because the slot is an RAII guard.
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<Shared>,
}

impl RequestQueue {
    pub fn new(opts: QueueOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                opts,
                state: Mutex::new(QueueState {
                    in_flight: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.opts.max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .in_flight
    }

    pub fn queued(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .waiters
            .len()
    }

    pub fn is_at_capacity(&self) -> bool {
        self.in_flight() >= self.shared.opts.max_concurrent
    }

    fn try_acquire(&self) -> Option<SlotGuard> {
        let mut st = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if st.in_flight < self.shared.opts.max_concurrent {
            st.in_flight += 1;
            Some(SlotGuard {
                shared: self.shared.clone(),
            })
        } else {
            None
        }
    }

    /// Wait for (or claim) a slot according to the configured strategy.
    pub async fn acquire(&self) -> Result<SlotGuard, PipelineError> {
        match self.shared.opts.strategy {
            AdmissionStrategy::Reject => self.try_acquire().ok_or(PipelineError::CapacityExceeded {
                limit: self.shared.opts.max_concurrent,
            }),
            AdmissionStrategy::Queue => loop {
                // Capacity is re-checked after every wake: another waiter may
                // have been admitted between the signal and this lock.
                let rx = {
                    let mut st = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
                    if st.in_flight < self.shared.opts.max_concurrent {
                        st.in_flight += 1;
                        return Ok(SlotGuard {
                            shared: self.shared.clone(),
                        });
                    }
                    let (tx, rx) = oneshot::channel();
                    st.waiters.push_back(tx);
                    rx
                };
                let _ = rx.await;
            },
            AdmissionStrategy::Sleep => loop {
                if let Some(guard) = self.try_acquire() {
                    return Ok(guard);
                }
                tokio::time::sleep(self.shared.opts.sleep_interval).await;
            },
        }
    }
}

/// An admitted slot; dropping it releases the slot and wakes at most one
/// queued waiter.
#[derive(Debug)]
pub struct SlotGuard {
    shared: Arc<Shared>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.release();
    }
}
