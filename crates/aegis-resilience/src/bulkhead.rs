//! Bulkhead isolation: bounded concurrency plus an admission queue.
//!
//! Operations beyond `max_concurrent` wait in a queue of at most `max_queue`
//! entries; anything beyond that is rejected immediately. When a running
//! operation finishes, its slot is handed directly to the head of the queue.
//!
//! The state mutex is the single arbiter between a queue timeout and a
//! dequeue: whichever removes the entry from the queue first wins.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ResilienceError, Result};
use crate::events::{EventBus, ResilienceEvent};

/// Priority of a queued operation (higher value = dequeued first in priority mode).
pub type Priority = i32;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bulkhead settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkheadConfig {
    /// Operations allowed to run at once (default: 10).
    pub max_concurrent: usize,
    /// Operations allowed to wait (default: 100).
    pub max_queue: usize,
    /// How long an operation may wait before being rejected (default: 30 seconds).
    pub queue_timeout: Option<Duration>,
    /// Order the queue by descending priority instead of arrival (default: false).
    pub priority_queue: bool,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 100,
            queue_timeout: Some(Duration::from_secs(30)),
            priority_queue: false,
        }
    }
}

/// Point-in-time view of one bulkhead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkheadMetrics {
    pub name: String,
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_queue: usize,
    /// `running / max_concurrent`
    pub utilization: f64,
    pub total_executed: u64,
    pub total_rejected: u64,
    pub total_timeouts: u64,
    pub shut_down: bool,
}

/// A caller waiting for a slot.
struct QueueEntry {
    id: u64,
    priority: Priority,
    enqueued_at: Instant,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct BulkheadState {
    running: usize,
    queue: VecDeque<QueueEntry>,
    next_id: u64,
    shut_down: bool,
    total_executed: u64,
    total_rejected: u64,
    total_timeouts: u64,
}

impl BulkheadState {
    fn position(&self, id: u64) -> Option<usize> {
        self.queue.iter().position(|entry| entry.id == id)
    }
}

/// Concurrency limiter for one named resource.
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    state: Mutex<BulkheadState>,
    events: EventBus,
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A held execution slot; released on drop.
struct Slot<'a> {
    bulkhead: &'a Bulkhead,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let mut state = self.bulkhead.lock();
        state.total_executed += 1;
        self.bulkhead.release_locked(&mut state);
    }
}

/// A queued caller's claim; cleans up the queue if the caller goes away.
struct Ticket<'a> {
    bulkhead: &'a Bulkhead,
    id: u64,
    grant: oneshot::Receiver<()>,
    resolved: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let mut state = self.bulkhead.lock();
        if let Some(position) = state.position(self.id) {
            state.queue.remove(position);
        } else if self.grant.try_recv().is_ok() {
            // A slot was handed over after the caller stopped waiting; pass it on.
            self.bulkhead.release_locked(&mut state);
        }
    }
}

impl Bulkhead {
    /// Creates a bulkhead.
    ///
    /// # Arguments
    /// * `name` - Resource name, used in errors and events
    /// * `config` - Concurrency and queue limits
    /// * `events` - Bus receiving rejection and timeout notifications
    #[must_use]
    pub fn new(name: impl Into<String>, config: BulkheadConfig, events: EventBus) -> Self {
        Self { name: name.into(), config, state: Mutex::new(BulkheadState::default()), events }
    }

    /// Resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bulkhead settings.
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BulkheadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frees one slot and hands free slots to waiting callers in queue order.
    fn release_locked(&self, state: &mut BulkheadState) {
        state.running = state.running.saturating_sub(1);
        while state.running < self.config.max_concurrent {
            let Some(entry) = state.queue.pop_front() else {
                break;
            };
            if entry.grant.send(()).is_ok() {
                state.running += 1;
                debug!(
                    bulkhead = %self.name,
                    priority = entry.priority,
                    waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                    "Dequeued operation"
                );
            }
        }
    }

    /// Runs `operation` once a slot is available.
    ///
    /// # Arguments
    /// * `operation` - Work to run; not invoked if the call is rejected
    /// * `priority` - Queue priority, only used in priority mode
    pub async fn execute<T, F, Fut>(&self, operation: F, priority: Priority) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _slot = self.admit(priority).await?;
        operation().await
    }

    async fn admit(&self, priority: Priority) -> Result<Slot<'_>> {
        let (id, grant) = {
            let mut state = self.lock();
            if state.shut_down {
                return Err(ResilienceError::BulkheadShutdown { name: self.name.clone() });
            }
            if state.running < self.config.max_concurrent {
                state.running += 1;
                return Ok(Slot { bulkhead: self });
            }
            if state.queue.len() >= self.config.max_queue {
                state.total_rejected += 1;
                let (running, queued) = (state.running, state.queue.len());
                drop(state);
                warn!(bulkhead = %self.name, running = running, queued = queued, "Bulkhead rejected operation");
                self.events.publish(ResilienceEvent::BulkheadRejected {
                    bulkhead: self.name.clone(),
                    running,
                    queued,
                });
                return Err(ResilienceError::ResourceExhausted { name: self.name.clone(), running, queued });
            }

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            let entry = QueueEntry { id, priority, enqueued_at: Instant::now(), grant: tx };
            if self.config.priority_queue {
                let position =
                    state.queue.iter().position(|queued| queued.priority < priority).unwrap_or(state.queue.len());
                state.queue.insert(position, entry);
            } else {
                state.queue.push_back(entry);
            }
            debug!(bulkhead = %self.name, priority = priority, queued = state.queue.len(), "Queued operation");
            (id, rx)
        };

        let enqueued_at = Instant::now();
        let mut ticket = Ticket { bulkhead: self, id, grant, resolved: false };
        let outcome = match self.config.queue_timeout {
            Some(limit) => tokio::time::timeout(limit, &mut ticket.grant).await.ok(),
            None => Some((&mut ticket.grant).await),
        };
        ticket.resolved = true;

        match outcome {
            Some(Ok(())) => Ok(Slot { bulkhead: self }),
            Some(Err(_)) => Err(ResilienceError::BulkheadShutdown { name: self.name.clone() }),
            None => {
                let timed_out = {
                    let mut state = self.lock();
                    match state.position(id) {
                        Some(position) => {
                            state.queue.remove(position);
                            state.total_timeouts += 1;
                            true
                        }
                        None => false,
                    }
                };
                if timed_out {
                    let waited = enqueued_at.elapsed();
                    warn!(bulkhead = %self.name, waited_ms = waited.as_millis() as u64, "Queued operation timed out");
                    self.events.publish(ResilienceEvent::BulkheadTimedOut {
                        bulkhead: self.name.clone(),
                        waited_ms: waited.as_millis() as u64,
                    });
                    return Err(ResilienceError::BulkheadTimeout { name: self.name.clone(), waited });
                }
                // Dequeued before the timeout was processed: the slot is ours.
                match ticket.grant.try_recv() {
                    Ok(()) => Ok(Slot { bulkhead: self }),
                    Err(_) => Err(ResilienceError::BulkheadShutdown { name: self.name.clone() }),
                }
            }
        }
    }

    /// Operations currently running.
    pub fn running(&self) -> usize {
        self.lock().running
    }

    /// Operations currently queued.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns a metrics snapshot.
    pub fn metrics(&self) -> BulkheadMetrics {
        let state = self.lock();
        let utilization = if self.config.max_concurrent == 0 {
            1.0
        } else {
            state.running as f64 / self.config.max_concurrent as f64
        };
        BulkheadMetrics {
            name: self.name.clone(),
            running: state.running,
            queued: state.queue.len(),
            max_concurrent: self.config.max_concurrent,
            max_queue: self.config.max_queue,
            utilization,
            total_executed: state.total_executed,
            total_rejected: state.total_rejected,
            total_timeouts: state.total_timeouts,
            shut_down: state.shut_down,
        }
    }

    /// Rejects every queued operation, then waits up to `deadline` for running ones.
    ///
    /// Returns `true` if all running operations finished in time.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        let rejected: Vec<QueueEntry> = {
            let mut state = self.lock();
            state.shut_down = true;
            state.queue.drain(..).collect()
        };
        let rejected_count = rejected.len();
        // Dropping the grant senders wakes every waiter with a shutdown error.
        drop(rejected);
        info!(bulkhead = %self.name, rejected = rejected_count, "Bulkhead shutting down");

        let started = Instant::now();
        loop {
            let running = self.running();
            if running == 0 {
                return true;
            }
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                warn!(bulkhead = %self.name, running = running, "Bulkhead shutdown deadline elapsed");
                return false;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL.min(deadline - elapsed)).await;
        }
    }
}

/// Registry of named bulkheads sharing one event bus.
pub struct BulkheadRegistry {
    default_config: BulkheadConfig,
    bulkheads: RwLock<HashMap<String, Arc<Bulkhead>>>,
    events: EventBus,
}

impl fmt::Debug for BulkheadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadRegistry")
            .field("default_config", &self.default_config)
            .field("bulkhead_count", &self.all().len())
            .finish_non_exhaustive()
    }
}

impl BulkheadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(default_config: BulkheadConfig, events: EventBus) -> Self {
        Self { default_config, bulkheads: RwLock::new(HashMap::new()), events }
    }

    /// Registers a bulkhead. An existing bulkhead with the same name is kept and returned.
    pub fn register(&self, name: &str, config: BulkheadConfig) -> Arc<Bulkhead> {
        let mut bulkheads = self.bulkheads.write().unwrap_or_else(PoisonError::into_inner);
        let bulkhead = bulkheads.entry(name.to_string()).or_insert_with(|| {
            debug!(bulkhead = %name, "Registering bulkhead");
            Arc::new(Bulkhead::new(name, config, self.events.clone()))
        });
        Arc::clone(bulkhead)
    }

    /// Looks up a bulkhead by name.
    pub fn get(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Looks up a bulkhead, creating it with the default settings if needed.
    pub fn get_or_create(&self, name: &str) -> Arc<Bulkhead> {
        if let Some(bulkhead) = self.get(name) {
            return bulkhead;
        }
        self.register(name, self.default_config.clone())
    }

    /// All registered bulkheads, sorted by name.
    pub fn all(&self) -> Vec<Arc<Bulkhead>> {
        let mut bulkheads: Vec<_> =
            self.bulkheads.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        bulkheads.sort_by(|a, b| a.name().cmp(b.name()));
        bulkheads
    }

    /// Metrics for every bulkhead, sorted by name.
    pub fn metrics(&self) -> Vec<BulkheadMetrics> {
        self.all().iter().map(|bulkhead| bulkhead.metrics()).collect()
    }

    /// Shuts every bulkhead down concurrently. Returns `true` if all drained in time.
    pub async fn shutdown_all(&self, deadline: Duration) -> bool {
        let bulkheads = self.all();
        let results = futures::future::join_all(bulkheads.iter().map(|b| b.shutdown(deadline))).await;
        results.into_iter().all(|drained| drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    fn bulkhead(max_concurrent: usize, max_queue: usize, priority_queue: bool) -> Arc<Bulkhead> {
        Arc::new(Bulkhead::new(
            "test-resource",
            BulkheadConfig { max_concurrent, max_queue, queue_timeout: Some(Duration::from_secs(5)), priority_queue },
            EventBus::new(),
        ))
    }

    /// Spawns an operation that holds its slot until `gate` is notified.
    fn spawn_blocked(
        bulkhead: &Arc<Bulkhead>,
        gate: &Arc<Notify>,
        priority: Priority,
    ) -> tokio::task::JoinHandle<Result<Priority>> {
        let bulkhead = Arc::clone(bulkhead);
        let gate = Arc::clone(gate);
        tokio::spawn(async move {
            bulkhead
                .execute(
                    || async move {
                        gate.notified().await;
                        Ok(priority)
                    },
                    priority,
                )
                .await
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn spawn_gated(bulkhead: &Arc<Bulkhead>, gate: oneshot::Receiver<()>) -> tokio::task::JoinHandle<Result<()>> {
        let bulkhead = Arc::clone(bulkhead);
        tokio::spawn(async move {
            bulkhead
                .execute(
                    || async move {
                        let _ = gate.await;
                        Ok(())
                    },
                    0,
                )
                .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_call_rejected_third_queued() {
        let bulkhead = bulkhead(2, 1, false);
        let (release_first, first_gate) = oneshot::channel();
        let (release_second, second_gate) = oneshot::channel();
        let (release_third, third_gate) = oneshot::channel();

        let first = spawn_gated(&bulkhead, first_gate);
        let second = spawn_gated(&bulkhead, second_gate);
        settle().await;
        let third = spawn_gated(&bulkhead, third_gate);
        settle().await;

        assert_eq!(bulkhead.running(), 2);
        assert_eq!(bulkhead.queued(), 1);

        let fourth = bulkhead.execute(|| async { Ok(()) }, 0).await;
        assert!(matches!(fourth, Err(ResilienceError::ResourceExhausted { running: 2, queued: 1, .. })));

        // Freeing one slot lets the queued call start.
        release_first.send(()).unwrap();
        first.await.unwrap().unwrap();
        settle().await;
        assert_eq!(bulkhead.queued(), 0);
        assert_eq!(bulkhead.running(), 2);

        release_second.send(()).unwrap();
        release_third.send(()).unwrap();
        second.await.unwrap().unwrap();
        third.await.unwrap().unwrap();

        let metrics = bulkhead.metrics();
        assert_eq!(metrics.running, 0);
        assert_eq!(metrics.total_executed, 3);
        assert_eq!(metrics.total_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_queue_ordering() {
        let bulkhead = bulkhead(1, 10, true);
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let holder = spawn_blocked(&bulkhead, &gate, 0);
        settle().await;

        let mut waiters = Vec::new();
        for (label, priority) in [("low", 1), ("high-a", 5), ("high-b", 5), ("mid", 3)] {
            let bulkhead = Arc::clone(&bulkhead);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                bulkhead
                    .execute(
                        || async move {
                            order.lock().unwrap().push(label);
                            Ok(())
                        },
                        priority,
                    )
                    .await
            }));
            settle().await;
        }

        gate.notify_one();
        assert!(holder.await.unwrap().is_ok());
        for waiter in waiters {
            assert!(waiter.await.unwrap().is_ok());
        }
        assert_eq!(*order.lock().unwrap(), vec!["high-a", "high-b", "mid", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_ordering_ignores_priority() {
        let bulkhead = bulkhead(1, 10, false);
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let holder = spawn_blocked(&bulkhead, &gate, 0);
        settle().await;

        let mut waiters = Vec::new();
        for priority in [1, 9, 5] {
            let bulkhead = Arc::clone(&bulkhead);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                bulkhead
                    .execute(
                        || async move {
                            order.lock().unwrap().push(priority);
                            Ok(())
                        },
                        priority,
                    )
                    .await
            }));
            settle().await;
        }

        gate.notify_one();
        holder.await.unwrap().unwrap();
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 9, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_rejects_and_removes_entry() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let bulkhead = Arc::new(Bulkhead::new(
            "slow",
            BulkheadConfig {
                max_concurrent: 1,
                max_queue: 5,
                queue_timeout: Some(Duration::from_secs(2)),
                priority_queue: false,
            },
            events,
        ));
        let gate = Arc::new(Notify::new());
        let _holder = spawn_blocked(&bulkhead, &gate, 0);
        settle().await;

        let result = bulkhead.execute(|| async { Ok(()) }, 0).await;
        assert!(matches!(result, Err(ResilienceError::BulkheadTimeout { .. })));
        assert_eq!(bulkhead.queued(), 0);
        assert_eq!(bulkhead.metrics().total_timeouts, 1);
        assert!(matches!(rx.recv().await.unwrap(), ResilienceEvent::BulkheadTimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_leaves_queue() {
        let bulkhead = bulkhead(1, 5, false);
        let gate = Arc::new(Notify::new());
        let _holder = spawn_blocked(&bulkhead, &gate, 0);
        settle().await;

        let waiter = spawn_blocked(&bulkhead, &gate, 0);
        settle().await;
        assert_eq!(bulkhead.queued(), 1);

        waiter.abort();
        settle().await;
        assert_eq!(bulkhead.queued(), 0);
        assert_eq!(bulkhead.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_queue_and_waits_for_running() {
        let bulkhead = bulkhead(1, 5, false);
        let gate = Arc::new(Notify::new());
        let holder = spawn_blocked(&bulkhead, &gate, 0);
        settle().await;
        let queued = spawn_blocked(&bulkhead, &gate, 0);
        settle().await;

        let drainer = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.shutdown(Duration::from_secs(10)).await })
        };
        settle().await;

        assert!(matches!(queued.await.unwrap(), Err(ResilienceError::BulkheadShutdown { .. })));
        assert!(matches!(
            bulkhead.execute(|| async { Ok(()) }, 0).await,
            Err(ResilienceError::BulkheadShutdown { .. })
        ));

        gate.notify_one();
        assert!(holder.await.unwrap().is_ok());
        assert!(drainer.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deadline_elapses() {
        let bulkhead = bulkhead(1, 5, false);
        let gate = Arc::new(Notify::new());
        let _holder = spawn_blocked(&bulkhead, &gate, 0);
        settle().await;

        assert!(!bulkhead.shutdown(Duration::from_millis(100)).await);
        assert_eq!(bulkhead.running(), 1);
    }
}
