//! Delayed redelivery of actions that asked to be retried
//!
//! Jobs wait in a min-heap keyed by due time. Attempt `n` is due
//! `base_delay * 2^(n - 1)` after it was scheduled; past `max_attempts` a job
//! is dropped with a warning. The queue holds at most `capacity` jobs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::Action;
use crate::config::RetrySettings;
use crate::error::{Error, Result};
use crate::Engine;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::LockPoisoned { what: "retry queue" }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryJob {
    pub action: Action,
    /// 1 for the first retry
    pub attempt: u32,
    pub due: Instant,
}

/// Heap entry; earliest due first, then insertion order
#[derive(Debug)]
struct Scheduled {
    seq: u64,
    job: RetryJob,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap
        other
            .job
            .due
            .cmp(&self.job.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct RetryQueue {
    base_delay: Duration,
    max_attempts: u32,
    capacity: usize,
    state: Mutex<QueueState>,
}

impl RetryQueue {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            base_delay: settings.base_delay(),
            max_attempts: settings.max_attempts,
            capacity: settings.capacity,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Wait before attempt `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Queue `action` for attempt `attempt`, counted from `now`.
    ///
    /// Returns `false` when the attempt cap is exceeded and the action is
    /// dropped; fails with [`Error::RetryQueueFull`] when at capacity.
    pub fn schedule(&self, action: Action, attempt: u32, now: Instant) -> Result<bool> {
        if attempt > self.max_attempts {
            tracing::warn!(
                "Dropping {} after {} attempts",
                action.event_id,
                attempt.saturating_sub(1)
            );
            return Ok(false);
        }

        let mut state = self.state.lock().map_err(poison_err)?;
        if state.heap.len() >= self.capacity {
            return Err(Error::RetryQueueFull {
                capacity: self.capacity,
            });
        }

        let due = now + self.delay_for(attempt);
        tracing::debug!("{} retry {} due in {:?}", action.event_id, attempt, due - now);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Scheduled {
            seq,
            job: RetryJob { action, attempt, due },
        });
        Ok(true)
    }

    /// Remove and return every job due at `now`, earliest first
    pub fn take_due(&self, now: Instant) -> Result<Vec<RetryJob>> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut due = Vec::new();
        while state.heap.peek().is_some_and(|s| s.job.due <= now) {
            if let Some(scheduled) = state.heap.pop() {
                due.push(scheduled.job);
            }
        }
        Ok(due)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.state.lock().map_err(poison_err)?.heap.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn next_due(&self) -> Result<Option<Instant>> {
        Ok(self.state.lock().map_err(poison_err)?.heap.peek().map(|s| s.job.due))
    }
}

impl Engine {
    /// Re-dispatch every retry due at `now`. Jobs that ask for another retry
    /// are rescheduled from `now` with the next attempt number.
    ///
    /// Returns the number of jobs dispatched. Every taken job is dispatched
    /// even when rescheduling an earlier one fails; the first such failure is
    /// returned afterwards.
    pub async fn drain_retries(&self, now: Instant) -> Result<usize> {
        let jobs = self.retries.take_due(now)?;
        let count = jobs.len();
        let mut failed = None;

        for job in jobs {
            match self.dispatch_business_logic(&job.action).await {
                Ok(results) => {
                    tracing::info!(
                        "Retry {} of {} succeeded with {} results",
                        job.attempt,
                        job.action.event_id,
                        results.len()
                    );
                }
                Err(Error::RetryRequested { logic }) => {
                    tracing::info!("{} asked to retry {} again", logic, job.action.event_id);
                    let event_id = job.action.event_id.clone();
                    if let Err(e) = self.retries.schedule(job.action, job.attempt + 1, now) {
                        tracing::error!("Could not reschedule {}: {}", event_id, e);
                        if failed.is_none() {
                            failed = Some(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Retry {} of {} failed: {}", job.attempt, job.action.event_id, e);
                }
            }
        }

        match failed {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Drain the retry queue on the configured polling interval until the
    /// returned handle is aborted
    pub fn spawn_retry_worker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.config.retry.poll_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = self.drain_retries(Instant::now()).await {
                    tracing::error!("Retry worker: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{engine, SHOP};
    use super::super::{logic_fn, ActionType, LogicConfig};
    use super::*;
    use crate::config::EngineConfig;
    use crate::intent::{LogicResult, WriteIntent};
    use crate::schema::SchemaRegistry;
    use crate::storage::document::Fields;
    use crate::storage::memory::MemoryStore;
    use crate::storage::DocumentStore;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn action(id: &str) -> Action {
        Action::new(id, ActionType::Create, "audit", format!("audits/{}", id))
    }

    fn settings(capacity: usize) -> RetrySettings {
        RetrySettings {
            base_delay_ms: 1000,
            max_attempts: 3,
            capacity,
            poll_interval_ms: 10,
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let queue = RetryQueue::new(&settings(10));
        assert_eq!(queue.delay_for(1), Duration::from_secs(1));
        assert_eq!(queue.delay_for(2), Duration::from_secs(2));
        assert_eq!(queue.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_due_order_cap_and_capacity() {
        let queue = RetryQueue::new(&settings(2));
        let now = Instant::now();

        assert!(queue.schedule(action("late"), 2, now).unwrap());
        assert!(queue.schedule(action("early"), 1, now).unwrap());
        assert!(matches!(
            queue.schedule(action("over"), 1, now),
            Err(Error::RetryQueueFull { capacity: 2 })
        ));
        assert!(!queue.schedule(action("spent"), 4, now).unwrap());

        assert!(queue.take_due(now).unwrap().is_empty());
        assert_eq!(queue.next_due().unwrap(), Some(now + Duration::from_secs(1)));

        let due: Vec<String> = queue
            .take_due(now + Duration::from_secs(5))
            .unwrap()
            .into_iter()
            .map(|j| j.action.event_id)
            .collect();
        assert_eq!(due, vec!["early", "late"]);
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_full_queue_does_not_lose_later_jobs() {
        let store = MemoryStore::new();
        let flaky = LogicConfig::new("flaky", logic_fn(|_, _, _| Ok(LogicResult::cancel_then_retry("flaky"))))
            .entities(["audit"]);
        let fanout = LogicConfig::new(
            "fanout",
            logic_fn(|_, _, _| {
                let forms = ["audits/x1", "audits/x2", "audits/x3"]
                    .into_iter()
                    .map(|path| WriteIntent::simulate_submit_form(path, Fields::new()))
                    .collect();
                Ok(LogicResult::finished("fanout", forms))
            }),
        )
        .entities(["order"]);
        let record = LogicConfig::new(
            "record",
            logic_fn(|action, _, _| {
                let write = WriteIntent::create(action.path.clone(), Fields::new()).field("seen", true);
                Ok(LogicResult::finished("record", vec![write]))
            }),
        )
        .entities(["user"]);

        let config = EngineConfig {
            retry: settings(3),
            ..EngineConfig::default()
        };
        let schema = SchemaRegistry::from_yaml_str(SHOP).unwrap();
        let engine = Engine::builder(schema, Arc::new(store.clone()))
            .config(config)
            .logic(flaky)
            .logic(fanout)
            .logic(record)
            .build()
            .unwrap();

        let now = Instant::now();
        let order = Action::new("o", ActionType::Create, "order", "users/u1/orders/o1");
        let audit = Action::new("a", ActionType::Create, "audit", "audits/a1");
        let user = Action::new("u", ActionType::Create, "user", "users/u1");
        for job in [order, audit, user] {
            assert!(engine.retries.schedule(job, 1, now).unwrap());
        }

        // The fanout refills the queue before the audit job asks to go again
        let result = engine.drain_retries(now + Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::RetryQueueFull { capacity: 3 })));
        assert!(store.exists("users/u1").await.unwrap());
        assert_eq!(engine.retries.len().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_simulated_form_retried_until_it_succeeds() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let flaky = LogicConfig::new(
            "flaky",
            logic_fn(move |action, _, _| {
                if counter.fetch_add(1, AtomicOrdering::SeqCst) < 2 {
                    return Ok(LogicResult::cancel_then_retry("flaky"));
                }
                let write = WriteIntent::create(action.path.clone(), Fields::new()).field("done", true);
                Ok(LogicResult::finished("flaky", vec![write]))
            }),
        )
        .entities(["audit"]);
        let trigger = LogicConfig::new(
            "trigger",
            logic_fn(|_, _, _| {
                let form = WriteIntent::simulate_submit_form("audits/a1", Fields::new());
                Ok(LogicResult::finished("trigger", vec![form]))
            }),
        )
        .entities(["order"]);
        let engine = engine(&store, vec![flaky, trigger]);

        let order = Action::new("evt", ActionType::Create, "order", "users/u1/orders/o1");
        engine.dispatch_business_logic(&order).await.unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(engine.retries.len().unwrap(), 1);

        let start = Instant::now();
        assert_eq!(engine.drain_retries(start).await.unwrap(), 0);

        // Attempt 1 fails again and is pushed back by two seconds
        let first = start + Duration::from_secs(2);
        assert_eq!(engine.drain_retries(first).await.unwrap(), 1);
        assert_eq!(engine.retries.len().unwrap(), 1);
        assert!(!store.exists("audits/a1").await.unwrap());

        assert_eq!(engine.drain_retries(first + Duration::from_secs(1)).await.unwrap(), 0);
        assert_eq!(engine.drain_retries(first + Duration::from_secs(3)).await.unwrap(), 1);
        assert!(engine.retries.is_empty().unwrap());
        assert!(store.exists("audits/a1").await.unwrap());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
    }
}
