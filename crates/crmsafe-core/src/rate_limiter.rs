//! Token-bucket admission control for outbound remote calls.
//!
//! Two bounds apply at once: a bucket of `max_tokens` calls that is refilled
//! to full on a fixed interval (no trickle), and at most `max_concurrent`
//! calls in flight. A caller is admitted only when both have room.
//!
//! Callers that cannot be admitted wait in a FIFO queue, one oneshot channel
//! per waiter. `release()` and the refill tick both run the same drain
//! routine, which admits waiters strictly in arrival order. New callers never
//! overtake the queue: they are admitted directly only while it is empty.

use crate::config::RateLimitConfig;
use crate::error::{CrmError, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Granted,
    Destroyed,
}

#[derive(Debug)]
struct LimiterState {
    tokens: u32,
    max_tokens: u32,
    active_requests: u32,
    max_concurrent: u32,
    last_refill: Instant,
    queue: VecDeque<oneshot::Sender<Admission>>,
    destroyed: bool,
}

impl LimiterState {
    fn has_capacity(&self) -> bool {
        self.tokens > 0 && self.active_requests < self.max_concurrent
    }

    fn admit(&mut self) {
        self.tokens -= 1;
        self.active_requests += 1;
    }

    /// Admit queued waiters in order while capacity remains. Returns how many
    /// were admitted.
    fn drain(&mut self) -> usize {
        let mut admitted = 0;
        while self.has_capacity() {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.admit();
            if waiter.send(Admission::Granted).is_err() {
                // The waiter stopped listening before admission.
                self.tokens += 1;
                self.active_requests -= 1;
                continue;
            }
            admitted += 1;
        }
        admitted
    }

    fn refill(&mut self) -> usize {
        self.tokens = self.max_tokens;
        self.last_refill = Instant::now();
        self.drain()
    }
}

fn lock_state(state: &Mutex<LimiterState>) -> MutexGuard<'_, LimiterState> {
    // Every mutation is a handful of integer updates; recover from poisoning.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// LimiterStatus
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStatus {
    pub tokens: u32,
    pub max_tokens: u32,
    pub active_requests: u32,
    pub max_concurrent: u32,
    pub queue_size: usize,
    /// Milliseconds until the next scheduled refill.
    pub next_refill_ms: u64,
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RateLimiter {
    state: Arc<Mutex<LimiterState>>,
    config: RateLimitConfig,
    refill_task: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Build a limiter and start its refill timer.
    ///
    /// Must be called from within a Tokio runtime. The bucket starts full.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let state = Arc::new(Mutex::new(LimiterState {
            tokens: config.max_tokens,
            max_tokens: config.max_tokens,
            active_requests: 0,
            max_concurrent: config.max_concurrent,
            last_refill: Instant::now(),
            queue: VecDeque::new(),
            destroyed: false,
        }));
        let task = spawn_refill(Arc::downgrade(&state), config.refill_interval());
        Ok(Self {
            state,
            config,
            refill_task: Mutex::new(Some(task)),
        })
    }

    /// Wait until one unit of call capacity is available and take it.
    ///
    /// Pair every successful `acquire` with one [`RateLimiter::release`], or
    /// use [`RateLimiter::execute`] which does so on every exit path.
    pub async fn acquire(&self) -> Result<()> {
        let rx = {
            let mut state = lock_state(&self.state);
            if state.destroyed {
                return Err(CrmError::RateLimiterDestroyed);
            }
            if state.queue.is_empty() && state.has_capacity() {
                state.admit();
                tracing::debug!(
                    tokens = state.tokens,
                    active = state.active_requests,
                    "rate limiter admitted"
                );
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            tracing::debug!(queue_size = state.queue.len(), "rate limiter queued caller");
            rx
        };

        let mut waiter = Waiter {
            rx,
            limiter: self,
            finished: false,
        };
        let admission = (&mut waiter.rx).await;
        waiter.finished = true;
        match admission {
            Ok(Admission::Granted) => Ok(()),
            Ok(Admission::Destroyed) | Err(_) => Err(CrmError::RateLimiterDestroyed),
        }
    }

    /// Return one unit of capacity and admit queued callers that now fit.
    pub fn release(&self) {
        let mut state = lock_state(&self.state);
        if state.active_requests == 0 {
            tracing::warn!("rate limiter release without a matching acquire");
            return;
        }
        state.active_requests -= 1;
        let admitted = state.drain();
        if admitted > 0 {
            tracing::debug!(admitted, "rate limiter admitted queued callers on release");
        }
    }

    /// Run `op` under one unit of capacity, releasing it however `op` ends:
    /// success, error, panic, or the returned future being dropped.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<CrmError>,
    {
        self.acquire().await.map_err(E::from)?;
        let _permit = Permit { limiter: self };
        op().await
    }

    pub fn status(&self) -> LimiterStatus {
        let state = lock_state(&self.state);
        let interval = self.config.refill_interval();
        let elapsed = state.last_refill.elapsed();
        LimiterStatus {
            tokens: state.tokens,
            max_tokens: state.max_tokens,
            active_requests: state.active_requests,
            max_concurrent: state.max_concurrent,
            queue_size: state.queue.len(),
            next_refill_ms: interval.saturating_sub(elapsed).as_millis() as u64,
        }
    }

    /// Stop the refill timer and reject every queued caller.
    ///
    /// Subsequent `acquire` calls fail with [`CrmError::RateLimiterDestroyed`].
    pub fn destroy(&self) {
        if let Some(task) = self
            .refill_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        let mut state = lock_state(&self.state);
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        let rejected = state.queue.len();
        for waiter in state.queue.drain(..) {
            let _ = waiter.send(Admission::Destroyed);
        }
        if rejected > 0 {
            tracing::warn!(rejected, "rate limiter destroyed with callers still queued");
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(task) = self
            .refill_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

fn spawn_refill(state: Weak<Mutex<LimiterState>>, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            let mut guard = lock_state(&state);
            let admitted = guard.refill();
            tracing::debug!(
                tokens = guard.tokens,
                admitted,
                queue_size = guard.queue.len(),
                "rate limiter refilled"
            );
        }
    })
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// A queued `acquire`. If the future is dropped after admission was granted
/// but before it was observed, the capacity is returned.
struct Waiter<'a> {
    rx: oneshot::Receiver<Admission>,
    limiter: &'a RateLimiter,
    finished: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.rx.close();
        if let Ok(Admission::Granted) = self.rx.try_recv() {
            self.limiter.release();
        }
    }
}

struct Permit<'a> {
    limiter: &'a RateLimiter,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
