//! Task scheduling.
//!
//! The [`Orchestrator`] owns every configured [`Task`]. At start-up it
//! initializes them one after another, waiting a fixed stagger between
//! starts, and hands each task to its own scheduling loop:
//!
//! - **Periodic** (`period` set): run a cycle immediately, then once per
//!   period for as long as the process lives. Ticks that fall due while a
//!   cycle is still running are skipped.
//! - **Retry until success** (no `period`): run a cycle; on a fault, wait
//!   according to the [`RetryPolicy`] and try again. The first successful
//!   cycle ends the loop.
//!
//! The [`TaskRegistry`] maps correlation ids to tasks so that the receiver
//! can route push notifications.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::task::Task;

/// When to retry a task that has no period after a faulted cycle.
///
/// The delay before attempt `n + 1` is `interval * backoff^(n - 1)`, capped
/// at `max_interval`. `backoff = 1.0` gives a fixed interval.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub backoff: f64,
    pub max_interval: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            backoff: 1.0,
            max_interval: Duration::from_secs(600),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.backoff.max(1.0).powi(exponent);
        let secs = self.interval.as_secs_f64() * factor;
        let capped = secs.min(self.max_interval.as_secs_f64().max(self.interval.as_secs_f64()));
        Duration::from_secs_f64(capped)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// How a retry-until-success loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded { attempts: u32 },
    GaveUp { attempts: u32 },
}

/// Tasks by correlation id.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Vec<Arc<Task>>,
    by_cid: HashMap<String, Arc<Task>>,
}

impl TaskRegistry {
    pub fn new(tasks: Vec<Arc<Task>>) -> Self {
        let by_cid = tasks
            .iter()
            .map(|t| (t.cid().to_string(), t.clone()))
            .collect();
        Self { tasks, by_cid }
    }

    pub fn get(&self, cid: &str) -> Option<Arc<Task>> {
        self.by_cid.get(cid).cloned()
    }

    /// Tasks in configuration order.
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    stagger: Duration,
    retry: RetryPolicy,
    handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(tasks: Vec<Arc<Task>>, stagger: Duration, retry: RetryPolicy) -> Self {
        Self {
            registry: Arc::new(TaskRegistry::new(tasks)),
            stagger,
            retry,
            handles: Vec::new(),
        }
    }

    /// One task per `[[tasks]]` entry, talking HTTP to its broker and store.
    pub fn from_config(config: &Config) -> Result<Self> {
        let tasks = config
            .task_configs()
            .into_iter()
            .map(|tc| {
                Task::connect(tc, &config.endpoint, config.schedule.connect_retry()).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            tasks,
            config.schedule.start_stagger(),
            config.schedule.retry_policy(),
        ))
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.registry.clone()
    }

    /// Launch every task in order, one stagger apart. Each task initializes
    /// and runs its schedule on its own, so an unreachable endpoint only
    /// holds up the task that uses it.
    pub async fn start(&mut self) {
        for (position, task) in self.registry.tasks().iter().enumerate() {
            if position > 0 {
                tokio::time::sleep(self.stagger).await;
            }

            let task = task.clone();
            let retry = self.retry.clone();
            self.handles.push(tokio::spawn(async move {
                task.init().await;
                match task.period() {
                    Some(period) => run_periodic(task, period).await,
                    None => {
                        run_until_success(&task, &retry).await;
                    }
                }
            }));
        }
        info!(tasks = self.registry.len(), "all tasks launched");
    }

    /// Stop scheduling and shut every task down.
    pub async fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        for task in self.registry.tasks() {
            task.shutdown().await;
        }
    }
}

/// Run `task` now and then once per `period`, forever.
pub async fn run_periodic(task: Arc<Task>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match task.do_period().await {
            Ok(report) => info!(
                task = %task.name(),
                fetched = report.entities_fetched,
                documents = report.documents_written,
                skipped = report.attributes_skipped,
                failed = report.failed_items,
                "cycle completed"
            ),
            Err(fault) => warn!(
                task = %task.name(),
                error = %fault,
                "cycle failed, next attempt in {:?}",
                period
            ),
        }
    }
}

/// Run `task` until one cycle completes without a fault.
pub async fn run_until_success(task: &Task, retry: &RetryPolicy) -> RetryOutcome {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match task.do_period().await {
            Ok(report) => {
                info!(
                    task = %task.name(),
                    attempts,
                    fetched = report.entities_fetched,
                    documents = report.documents_written,
                    "cycle completed, no further runs scheduled"
                );
                return RetryOutcome::Succeeded { attempts };
            }
            Err(fault) => {
                if retry.exhausted(attempts) {
                    error!(task = %task.name(), attempts, error = %fault, "giving up on task");
                    return RetryOutcome::GaveUp { attempts };
                }
                let delay = retry.delay(attempts);
                warn!(
                    task = %task.name(),
                    attempts,
                    error = %fault,
                    "cycle failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::{endpoint, sensor, task_config};
    use crate::task::TaskState;
    use context_feeder_core::broker::memory::InMemoryBroker;
    use context_feeder_core::models::Trigger;
    use context_feeder_core::store::memory::InMemoryStore;
    use tokio::time::Instant;

    fn make_task(
        period: Option<Duration>,
        broker: &Arc<InMemoryBroker>,
        store: &Arc<InMemoryStore>,
    ) -> Arc<Task> {
        Arc::new(Task::new(
            task_config(Trigger::Time, period),
            &endpoint(),
            Duration::from_secs(15),
            broker.clone(),
            store.clone(),
        ))
    }

    #[test]
    fn test_default_policy_is_fixed_and_unbounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(30));
        assert_eq!(policy.delay(50), Duration::from_secs(30));
        assert!(!policy.exhausted(u32::MAX));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            interval: Duration::from_secs(10),
            backoff: 2.0,
            max_interval: Duration::from_secs(60),
            max_attempts: Some(4),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(2), Duration::from_secs(20));
        assert_eq!(policy.delay(3), Duration::from_secs(40));
        assert_eq!(policy.delay(4), Duration::from_secs(60));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_first_success_then_stops() {
        let broker = Arc::new(InMemoryBroker::new().fail_fetches(2).with_entities(vec![sensor()]));
        let store = Arc::new(InMemoryStore::new());
        let task = make_task(None, &broker, &store);

        let started = Instant::now();
        let outcome = run_until_success(&task, &RetryPolicy::default()).await;

        assert_eq!(outcome, RetryOutcome::Succeeded { attempts: 3 });
        assert_eq!(broker.fetch_calls(), 3);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(90));
        assert_eq!(store.documents_in("acmefarm1").len(), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(broker.fetch_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let broker = Arc::new(InMemoryBroker::new().fail_fetches(100));
        let store = Arc::new(InMemoryStore::new());
        let task = make_task(None, &broker, &store);
        let policy = RetryPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };

        assert_eq!(
            run_until_success(&task, &policy).await,
            RetryOutcome::GaveUp { attempts: 3 }
        );
        assert_eq!(broker.fetch_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_runs_immediately_then_every_period() {
        let broker = Arc::new(InMemoryBroker::new().with_entities(vec![sensor()]));
        let store = Arc::new(InMemoryStore::new());
        let task = make_task(Some(Duration::from_secs(60)), &broker, &store);

        let handle = tokio::spawn(run_periodic(task, Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broker.fetch_calls(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(broker.fetch_calls(), 3);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_keeps_going_after_faults() {
        let broker = Arc::new(InMemoryBroker::new().fail_fetches(2));
        let store = Arc::new(InMemoryStore::new());
        let task = make_task(Some(Duration::from_secs(10)), &broker, &store);

        let handle = tokio::spawn(run_periodic(task, Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(broker.fetch_calls(), 4);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_staggers_and_registers_tasks() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InMemoryStore::new());
        let a = make_task(None, &broker, &store);
        let b = make_task(None, &broker, &store);
        let c = make_task(None, &broker, &store);
        let mut orchestrator = Orchestrator::new(
            vec![a.clone(), b.clone(), c.clone()],
            Duration::from_millis(500),
            RetryPolicy::default(),
        );

        let registry = orchestrator.registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.get(b.cid()).is_some());
        assert!(registry.get("unknown").is_none());

        let started = Instant::now();
        orchestrator.start().await;
        assert!(started.elapsed() >= Duration::from_millis(1000));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(a.state() != TaskState::Idle);
        assert!(c.state() != TaskState::Idle);
        assert_eq!(broker.fetch_calls(), 3);

        orchestrator.shutdown().await;
        assert!(registry.tasks().iter().all(|t| t.state() == TaskState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_store_does_not_hold_up_other_tasks() {
        let dead_broker = Arc::new(InMemoryBroker::new().with_entities(vec![sensor()]));
        let dead_store = Arc::new(InMemoryStore::new().fail_pings(usize::MAX));
        let stuck = make_task(Some(Duration::from_secs(60)), &dead_broker, &dead_store);

        let broker = Arc::new(InMemoryBroker::new().with_entities(vec![sensor()]));
        let store = Arc::new(InMemoryStore::new());
        let healthy = make_task(Some(Duration::from_secs(60)), &broker, &store);

        let mut orchestrator = Orchestrator::new(
            vec![stuck.clone(), healthy.clone()],
            Duration::from_millis(500),
            RetryPolicy::default(),
        );
        orchestrator.start().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(stuck.state(), TaskState::Initializing);
        assert_eq!(dead_broker.fetch_calls(), 0);
        assert_eq!(healthy.state(), TaskState::Polling);
        assert_eq!(broker.fetch_calls(), 1);
        assert_eq!(store.documents_in("acmefarm1").len(), 1);

        orchestrator.shutdown().await;
    }
}
