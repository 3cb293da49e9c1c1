//! Shared limiter for remote calls.
//!
//! Every remote call goes through [`RequestGovernor`]. It caps concurrent
//! in-flight calls, admits waiters by [`Priority`], coalesces concurrent
//! calls sharing a key and applies a per-call timeout. It never retries.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use crate::config::GovernorConfig;
use crate::error::RemoteError;

/// Admission tier, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// A just-performed user action
    Interactive,
    /// Outbox drains and delta pulls
    Background,
    /// Speculative prefetch
    Prefetch,
}

impl Priority {
    const fn tier(self) -> usize {
        match self {
            Self::Interactive => 0,
            Self::Background => 1,
            Self::Prefetch => 2,
        }
    }
}

#[derive(Default)]
struct Slots {
    in_flight: usize,
    peak: usize,
    waiters: [VecDeque<oneshot::Sender<GovernorPermit>>; 3],
}

#[derive(Default)]
struct GovernorMetrics {
    admitted: AtomicU64,
    coalesced: AtomicU64,
    timed_out: AtomicU64,
}

struct InFlightCall<T> {
    generation: u64,
    result: watch::Sender<Option<Result<T, RemoteError>>>,
}

type CallMap = HashMap<String, (u64, Arc<dyn Any + Send + Sync>)>;

struct Inner {
    max_concurrent: usize,
    timeout: Duration,
    slots: Mutex<Slots>,
    calls: Mutex<CallMap>,
    next_generation: AtomicU64,
    metrics: GovernorMetrics,
}

impl Inner {
    // Also reached from `Drop`, so poisoning is tolerated instead of surfaced
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn calls(&self) -> MutexGuard<'_, CallMap> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the slot to the highest-priority live waiter, or free it.
    fn release(self: &Arc<Self>) {
        let mut slots = self.slots();
        for queue in &mut slots.waiters {
            while let Some(waiter) = queue.pop_front() {
                let permit = GovernorPermit {
                    inner: Some(Arc::clone(self)),
                };
                match waiter.send(permit) {
                    Ok(()) => return,
                    Err(mut unclaimed) => unclaimed.inner = None,
                }
            }
        }
        slots.in_flight = slots.in_flight.saturating_sub(1);
    }
}

/// Holds one in-flight slot; releasing it wakes the next waiter.
pub struct GovernorPermit {
    inner: Option<Arc<Inner>>,
}

impl Drop for GovernorPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

/// Point-in-time governor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GovernorSnapshot {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub admitted: u64,
    pub coalesced: u64,
    pub timed_out: u64,
}

/// Removes the leader's coalescing entry on every exit path.
struct LeaderGuard<'a> {
    inner: &'a Inner,
    key: &'a str,
    generation: u64,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        let mut calls = self.inner.calls();
        if calls
            .get(self.key)
            .is_some_and(|(generation, _)| *generation == self.generation)
        {
            calls.remove(self.key);
        }
    }
}

enum Role<T> {
    Leader(Arc<InFlightCall<T>>),
    Follower(watch::Receiver<Option<Result<T, RemoteError>>>),
    Solo,
}

#[derive(Clone)]
pub struct RequestGovernor {
    inner: Arc<Inner>,
}

impl RequestGovernor {
    pub fn new(max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrent: max_concurrent.max(1),
                timeout,
                slots: Mutex::new(Slots::default()),
                calls: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                metrics: GovernorMetrics::default(),
            }),
        }
    }

    pub fn from_config(config: &GovernorConfig) -> Self {
        Self::new(config.max_concurrent, config.request_timeout())
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Wait for an in-flight slot.
    ///
    /// Dropping the returned future before it resolves gives up the place in
    /// line without leaking a slot.
    pub async fn acquire(&self, priority: Priority) -> GovernorPermit {
        loop {
            let waiter = {
                let mut slots = self.inner.slots();
                if slots.in_flight < self.inner.max_concurrent {
                    slots.in_flight += 1;
                    slots.peak = slots.peak.max(slots.in_flight);
                    self.inner.metrics.admitted.fetch_add(1, Ordering::Relaxed);
                    return GovernorPermit {
                        inner: Some(Arc::clone(&self.inner)),
                    };
                }
                let (tx, rx) = oneshot::channel();
                slots.waiters[priority.tier()].push_back(tx);
                rx
            };

            if let Ok(permit) = waiter.await {
                self.inner.metrics.admitted.fetch_add(1, Ordering::Relaxed);
                return permit;
            }
        }
    }

    /// Run `op` under a slot and the call timeout, without coalescing.
    pub async fn run<T, F, Fut>(&self, priority: Priority, op: F) -> Result<T, RemoteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let _permit = self.acquire(priority).await;
        if let Ok(result) = tokio::time::timeout(self.inner.timeout, op()).await {
            result
        } else {
            self.inner.metrics.timed_out.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(timeout = ?self.inner.timeout, "Remote call timed out");
            Err(RemoteError::Timeout)
        }
    }

    /// Run `op`, sharing the result with concurrent callers using the same
    /// `key`.
    ///
    /// If the caller running the shared call is cancelled, the others get
    /// [`RemoteError::Abandoned`].
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        priority: Priority,
        op: F,
    ) -> Result<T, RemoteError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        match self.join_or_lead::<T>(key) {
            Role::Follower(mut rx) => {
                self.inner.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key, "Coalesced remote call");
                rx.wait_for(Option::is_some)
                    .await
                    .map_or(Err(RemoteError::Abandoned), |shared| {
                        shared.clone().unwrap_or(Err(RemoteError::Abandoned))
                    })
            }
            Role::Leader(call) => {
                let _guard = LeaderGuard {
                    inner: &self.inner,
                    key,
                    generation: call.generation,
                };
                let result = self.run(priority, op).await;
                call.result.send_replace(Some(result.clone()));
                result
            }
            Role::Solo => self.run(priority, op).await,
        }
    }

    fn join_or_lead<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Role<T> {
        let mut calls = self.inner.calls();
        if let Some((_, existing)) = calls.get(key) {
            return match Arc::clone(existing).downcast::<InFlightCall<T>>() {
                Ok(call) => Role::Follower(call.result.subscribe()),
                // Same key, different result type: nothing to share
                Err(_) => Role::Solo,
            };
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (result, _) = watch::channel(None);
        let call = Arc::new(InFlightCall { generation, result });
        calls.insert(
            key.to_string(),
            (generation, Arc::clone(&call) as Arc<dyn Any + Send + Sync>),
        );
        Role::Leader(call)
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let (in_flight, peak_in_flight) = {
            let slots = self.inner.slots();
            (slots.in_flight, slots.peak)
        };
        GovernorSnapshot {
            in_flight,
            peak_in_flight,
            admitted: self.inner.metrics.admitted.load(Ordering::Relaxed),
            coalesced: self.inner.metrics.coalesced.load(Ordering::Relaxed),
            timed_out: self.inner.metrics.timed_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_ceiling() {
        let governor = RequestGovernor::new(3, Duration::from_secs(5));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let governor = governor.clone();
            let current = current.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                governor
                    .execute(&format!("call-{i}"), Priority::Background, || async {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, RemoteError>(i)
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let snapshot = governor.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.peak_in_flight, 3);
        assert_eq!(snapshot.admitted, 20);
    }

    #[tokio::test]
    async fn interactive_waiters_are_admitted_first() {
        let governor = RequestGovernor::new(1, Duration::from_secs(5));
        let held = governor.acquire(Priority::Background).await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for priority in [Priority::Prefetch, Priority::Background, Priority::Interactive] {
            let governor = governor.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = governor.acquire(priority).await;
                order.lock().unwrap().push(priority);
            }));
            settle().await;
        }

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec![Priority::Interactive, Priority::Background, Priority::Prefetch]
        );
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_slot() {
        let governor = RequestGovernor::new(1, Duration::from_secs(5));
        let held = governor.acquire(Priority::Background).await;

        let waiter = {
            let governor = governor.clone();
            tokio::spawn(async move {
                let _permit = governor.acquire(Priority::Interactive).await;
            })
        };
        settle().await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        assert_eq!(governor.snapshot().in_flight, 0);
        let _again = governor.acquire(Priority::Prefetch).await;
        assert_eq!(governor.snapshot().in_flight, 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_share_one_call() {
        let governor = RequestGovernor::new(4, Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let leader = {
            let governor = governor.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                governor
                    .execute("pull:notes:", Priority::Background, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok::<_, RemoteError>(vec![1, 2, 3])
                    })
                    .await
            })
        };
        settle().await;

        let follower = {
            let governor = governor.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                governor
                    .execute("pull:notes:", Priority::Interactive, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<Vec<i32>, RemoteError>(vec![])
                    })
                    .await
            })
        };
        settle().await;
        release_tx.send(()).unwrap();

        assert_eq!(leader.await.unwrap(), Ok(vec![1, 2, 3]));
        assert_eq!(follower.await.unwrap(), Ok(vec![1, 2, 3]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(governor.snapshot().coalesced, 1);
    }

    #[tokio::test]
    async fn cancelled_leader_abandons_followers() {
        let governor = RequestGovernor::new(4, Duration::from_secs(5));

        let leader = {
            let governor = governor.clone();
            tokio::spawn(async move {
                governor
                    .execute("key", Priority::Background, || {
                        std::future::pending::<Result<u32, RemoteError>>()
                    })
                    .await
            })
        };
        settle().await;

        let follower = {
            let governor = governor.clone();
            tokio::spawn(async move {
                governor
                    .execute("key", Priority::Background, || async { Ok::<u32, _>(7) })
                    .await
            })
        };
        settle().await;

        leader.abort();
        assert_eq!(follower.await.unwrap(), Err(RemoteError::Abandoned));
        assert_eq!(governor.snapshot().in_flight, 0);

        // The key is free again
        let fresh = governor
            .execute("key", Priority::Background, || async { Ok::<u32, _>(9) })
            .await;
        assert_eq!(fresh, Ok(9));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_as_retryable() {
        let governor = RequestGovernor::new(1, Duration::from_millis(100));
        let result = governor
            .run(Priority::Background, || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<u32, RemoteError>(1)
            })
            .await;

        assert_eq!(result, Err(RemoteError::Timeout));
        assert!(RemoteError::Timeout.is_retryable());
        assert_eq!(governor.snapshot().timed_out, 1);
        assert_eq!(governor.snapshot().in_flight, 0);
    }
}
