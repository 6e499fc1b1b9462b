//! Named priority queues.
//!
//! Priority runs 1..9 with 1 highest; within a priority, FIFO. Each
//! queue has a `max_concurrent` lease count and a bounded waiting list;
//! overflow is rejected with `QUEUE_FULL` so triggers can surface it.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

use crate::config::{OrchestratorConfig, QueueSettings};
use crate::dsl::schema::Plan;
use crate::error::{CoreError, CoreResult};

/// What a worker should do with a claimed item.
#[derive(Debug, Clone)]
pub enum WorkPayload {
    Start {
        plan: Plan,
        variables: HashMap<String, Value>,
        /// Skip the approval gate (CLI `--auto-approve`).
        auto_approve: bool,
        dry_run: bool,
    },
    /// Continue a suspended run from its checkpoint.
    Resume { plan: Plan },
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub run_id: u64,
    pub queue: String,
    pub priority: u8,
    seq: u64,
    pub payload: WorkPayload,
}

struct QueueState {
    settings: QueueSettings,
    waiting: Vec<WorkItem>,
    running: usize,
}

impl QueueState {
    fn position_for(&self, priority: u8, seq: u64) -> usize {
        self.waiting
            .partition_point(|item| (item.priority, item.seq) <= (priority, seq))
    }
}

pub struct QueueManager {
    queues: Mutex<BTreeMap<String, QueueState>>,
    seq: AtomicU64,
    notify: Notify,
}

impl QueueManager {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let queues = config
            .queues
            .iter()
            .map(|(name, settings)| {
                (
                    name.clone(),
                    QueueState {
                        settings: settings.clone(),
                        waiting: Vec::new(),
                        running: 0,
                    },
                )
            })
            .collect();
        QueueManager {
            queues: Mutex::new(queues),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueue one item. Unknown queues are created with defaults; a
    /// saturated waiting list rejects with `QUEUE_FULL`.
    pub fn enqueue(
        &self,
        run_id: u64,
        queue: &str,
        priority: u8,
        payload: WorkPayload,
    ) -> CoreResult<()> {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_insert_with(|| QueueState {
            settings: QueueSettings::default(),
            waiting: Vec::new(),
            running: 0,
        });
        if state.waiting.len() >= state.settings.max_queued {
            return Err(CoreError::QueueFull {
                queue: queue.to_string(),
            });
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let item = WorkItem {
            run_id,
            queue: queue.to_string(),
            priority: priority.clamp(1, 9),
            seq,
            payload,
        };
        let at = state.position_for(item.priority, item.seq);
        state.waiting.insert(at, item);
        drop(queues);
        self.notify.notify_waiters();
        self.notify.notify_one();
        Ok(())
    }

    /// Claim the next ready item: for each queue with a free lease, the
    /// highest-priority (then oldest) waiting item.
    pub fn take_next(&self) -> Option<WorkItem> {
        let mut queues = self.queues.lock();
        let mut best: Option<(&String, u8, u64)> = None;
        for (name, state) in queues.iter() {
            if state.running >= state.settings.max_concurrent {
                continue;
            }
            if let Some(item) = state.waiting.first() {
                let candidate = (name, item.priority, item.seq);
                let better = match best {
                    None => true,
                    Some((_, priority, seq)) => (item.priority, item.seq) < (priority, seq),
                };
                if better {
                    best = Some(candidate);
                }
            }
        }
        let name = best.map(|(name, _, _)| name.clone())?;
        let state = queues.get_mut(&name).expect("queue exists");
        state.running += 1;
        Some(state.waiting.remove(0))
    }

    /// Release a lease after a run finishes or suspends.
    pub fn complete(&self, queue: &str) {
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(queue) {
            state.running = state.running.saturating_sub(1);
        }
        drop(queues);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Total items waiting across all queues.
    pub fn depth(&self) -> usize {
        self.queues.lock().values().map(|s| s.waiting.len()).sum()
    }

    pub fn running(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map(|s| s.running).unwrap_or(0)
    }

    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parse_plan;

    fn plan() -> Plan {
        parse_plan("dsl_version: \"1.1\"\nname: t\nsteps:\n  - log: {message: hi}\n").unwrap()
    }

    fn start_payload() -> WorkPayload {
        WorkPayload::Start {
            plan: plan(),
            variables: HashMap::new(),
            auto_approve: false,
            dry_run: false,
        }
    }

    fn manager() -> QueueManager {
        QueueManager::new(&OrchestratorConfig::default())
    }

    #[test]
    fn test_priority_order_then_fifo() {
        let m = manager();
        m.enqueue(1, "default", 5, start_payload()).unwrap();
        m.enqueue(2, "default", 1, start_payload()).unwrap();
        m.enqueue(3, "default", 5, start_payload()).unwrap();
        m.enqueue(4, "default", 9, start_payload()).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| {
            let item = m.take_next();
            if let Some(item) = &item {
                m.complete(&item.queue);
            }
            item.map(|i| i.run_id)
        })
        .collect();
        assert_eq!(order, vec![2, 1, 3, 4]);
    }

    #[test]
    fn test_max_concurrent_enforced() {
        let m = manager(); // default max_concurrent = 2
        for run_id in 1..=4 {
            m.enqueue(run_id, "default", 5, start_payload()).unwrap();
        }
        assert!(m.take_next().is_some());
        assert!(m.take_next().is_some());
        // Two leases taken, third claim must wait.
        assert!(m.take_next().is_none());
        assert_eq!(m.running("default"), 2);

        m.complete("default");
        assert!(m.take_next().is_some());
    }

    #[test]
    fn test_queue_full_overflow() {
        let mut config = OrchestratorConfig::default();
        config.queues.get_mut("default").unwrap().max_queued = 2;
        let m = QueueManager::new(&config);

        m.enqueue(1, "default", 5, start_payload()).unwrap();
        m.enqueue(2, "default", 5, start_payload()).unwrap();
        let err = m.enqueue(3, "default", 5, start_payload()).unwrap_err();
        assert!(matches!(err, CoreError::QueueFull { .. }));
    }

    #[test]
    fn test_unknown_queue_created_with_defaults() {
        let m = manager();
        m.enqueue(1, "reports", 2, start_payload()).unwrap();
        assert!(m.queue_names().contains(&"reports".to_string()));
        assert_eq!(m.take_next().unwrap().queue, "reports");
    }

    #[test]
    fn test_priority_clamped_to_range() {
        let m = manager();
        m.enqueue(1, "default", 0, start_payload()).unwrap();
        m.enqueue(2, "default", 200, start_payload()).unwrap();
        let first = m.take_next().unwrap();
        assert_eq!(first.priority, 1);
        m.complete("default");
        let second = m.take_next().unwrap();
        assert_eq!(second.priority, 9);
    }

    #[test]
    fn test_fairness_across_queues() {
        let mut config = OrchestratorConfig::default();
        config.queues.insert("b".into(), QueueSettings::default());
        let m = QueueManager::new(&config);

        m.enqueue(1, "default", 5, start_payload()).unwrap();
        m.enqueue(2, "b", 1, start_payload()).unwrap();
        // The cross-queue claim prefers the higher-priority item.
        assert_eq!(m.take_next().unwrap().run_id, 2);
    }
}
