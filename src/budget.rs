// TICKGOV BUDGET SCHEDULER
// PRIORITY QUEUE OF DEFERRABLE TASKS, DRAINED ONCE PER TICK UNTIL THE TICK
// BUDGET OR A CATEGORY SUB-BUDGET RUNS OUT. COST CONTROL IS BY ADMISSION ONLY:
// A TASK THAT STARTS ALWAYS RUNS TO COMPLETION.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use crossbeam::channel::{self, Receiver, Sender};
use log::{error, info, warn};

use crate::config::BudgetConfig;
use crate::tuning::{self, DEFAULT_TASK_ESTIMATE_MS, GENERAL_CATEGORY};

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Priority {
    Critical = 0,    // ALWAYS ADMITTED
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    pub fn label(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Normal => "NORMAL",
            Self::Low => "LOW",
            Self::Background => "BACKGROUND",
        }
    }
}

pub type Action = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

pub struct ScheduledTask {
    pub id: String,
    pub priority: Priority,
    pub category: String,
    pub enqueue_time: Instant,
    pub estimated_cost_ms: f64,
    seq: u64,
    action: Action,
}

// BinaryHeap IS A MAX-HEAP: "GREATER" MEANS "DEQUEUED FIRST".
// LOWER PRIORITY VALUE FIRST, THEN EARLIER ENQUEUE (SEQ) FIRST.
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other.priority.cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskCategory {
    pub name: String,
    pub budget_limit_ms: f64,
    pub budget_used_ms: f64,
    pub executed_count: u32,
    pub queued_count: u32,
}

impl TaskCategory {
    fn new(name: &str, budget_limit_ms: f64) -> Self {
        Self {
            name: name.to_string(),
            budget_limit_ms,
            budget_used_ms: 0.0,
            executed_count: 0,
            queued_count: 0,
        }
    }

    pub fn has_budget_remaining(&self) -> bool {
        self.budget_used_ms < self.budget_limit_ms
    }

    fn reset(&mut self) {
        self.budget_used_ms = 0.0;
        self.executed_count = 0;
    }
}

// SUBMISSION FROM ANOTHER THREAD (WORKER POOL COMPLETIONS)
struct Submission {
    id: String,
    action: Action,
    priority: Priority,
    category: String,
    estimated_cost_ms: f64,
}

// CLONEABLE CROSS-THREAD ENTRY POINT. SUBMISSIONS LAND IN AN INBOX THAT IS
// DRAINED AT THE START OF EVERY TICK CYCLE. IF THE SCHEDULER IS STOPPED OR
// GONE THE ACTION RUNS INLINE ON THE CALLER: WORK IS NEVER DROPPED.
#[derive(Clone)]
pub struct ScheduleHandle {
    tx: Sender<Submission>,
    active: Arc<AtomicBool>,
}

impl ScheduleHandle {
    pub fn schedule(
        &self,
        id: impl Into<String>,
        action: impl FnOnce() -> Result<()> + Send + 'static,
        priority: Priority,
        category: &str,
        estimated_cost_ms: f64,
    ) {
        let sub = Submission {
            id: id.into(),
            action: Box::new(action),
            priority,
            category: category.to_string(),
            estimated_cost_ms,
        };
        if !self.active.load(AtomicOrdering::Acquire) {
            run_action(&sub.id, sub.action);
            return;
        }
        if let Err(channel::SendError(sub)) = self.tx.send(sub) {
            run_action(&sub.id, sub.action);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TickReport {
    pub budget_ms: f64,
    pub used_ms: f64,
    pub executed: u32,
    pub failed: u32,
    pub set_aside: u32,
    pub queue_depth: usize,
    pub overrun: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerStats {
    pub active: bool,
    pub queue_depth: usize,
    pub current_budget_ms: f64,
    pub max_budget_ms: f64,
    pub executed_total: u64,
    pub failed_total: u64,
    pub overruns: u64,
    pub categories: Vec<TaskCategory>,
}

pub struct BudgetScheduler {
    queue: BinaryHeap<ScheduledTask>,
    categories: BTreeMap<String, TaskCategory>,
    active: bool,
    // MIRRORS `active` FOR HANDLES ON OTHER THREADS
    accepting: Arc<AtomicBool>,
    max_budget_ms: f64,
    current_budget_ms: f64,
    next_seq: u64,
    inbox_tx: Sender<Submission>,
    inbox_rx: Receiver<Submission>,
    executed_total: u64,
    failed_total: u64,
    overruns: u64,
}

impl BudgetScheduler {
    pub fn new(config: &BudgetConfig) -> Self {
        let (inbox_tx, inbox_rx) = channel::unbounded();
        let mut sched = Self {
            queue: BinaryHeap::new(),
            categories: BTreeMap::new(),
            active: false,
            accepting: Arc::new(AtomicBool::new(false)),
            max_budget_ms: config.max_budget_ms,
            current_budget_ms: config.max_budget_ms,
            next_seq: 0,
            inbox_tx,
            inbox_rx,
            executed_total: 0,
            failed_total: 0,
            overruns: 0,
        };
        for (name, limit) in &config.categories {
            sched.register_category(name, *limit);
        }
        // UNKNOWN CATEGORIES FALL BACK HERE, SO IT MUST ALWAYS EXIST
        if !sched.categories.contains_key(GENERAL_CATEGORY) {
            let limit = tuning::DEFAULT_CATEGORIES
                .iter()
                .find(|(n, _)| *n == GENERAL_CATEGORY)
                .map(|(_, l)| *l)
                .unwrap_or(config.max_budget_ms);
            sched.register_category(GENERAL_CATEGORY, limit);
        }
        sched
    }

    // UPSERT. A SECOND REGISTRATION REPLACES THE LIMIT AND KEEPS THE COUNTERS.
    pub fn register_category(&mut self, name: &str, budget_limit_ms: f64) {
        self.categories
            .entry(name.to_string())
            .and_modify(|c| c.budget_limit_ms = budget_limit_ms)
            .or_insert_with(|| TaskCategory::new(name, budget_limit_ms));
    }

    pub fn start(&mut self) {
        self.active = true;
        self.accepting.store(true, AtomicOrdering::Release);
        info!("TICK BUDGET SCHEDULER STARTED ({:.1}ms MAX)", self.max_budget_ms);
    }

    // CLEARS THE QUEUE. SUBMISSIONS ALREADY IN THE INBOX RUN INLINE; LATER
    // HANDLE SUBMISSIONS RUN ON THEIR CALLER.
    pub fn stop(&mut self) {
        self.active = false;
        self.accepting.store(false, AtomicOrdering::Release);
        self.clear_queue();
        self.drain_inbox();
        self.categories.values_mut().for_each(TaskCategory::reset);
        info!("TICK BUDGET SCHEDULER STOPPED");
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn handle(&self) -> ScheduleHandle {
        ScheduleHandle {
            tx: self.inbox_tx.clone(),
            active: self.accepting.clone(),
        }
    }

    // ENQUEUE. WHILE INACTIVE THE ACTION RUNS SYNCHRONOUSLY (FAIL-OPEN).
    pub fn schedule(
        &mut self,
        id: impl Into<String>,
        action: impl FnOnce() -> Result<()> + Send + 'static,
        priority: Priority,
        category: &str,
        estimated_cost_ms: f64,
    ) {
        self.enqueue(Submission {
            id: id.into(),
            action: Box::new(action),
            priority,
            category: category.to_string(),
            estimated_cost_ms,
        });
    }

    pub fn schedule_default(
        &mut self,
        id: impl Into<String>,
        action: impl FnOnce() -> Result<()> + Send + 'static,
        priority: Priority,
    ) {
        self.schedule(id, action, priority, GENERAL_CATEGORY, DEFAULT_TASK_ESTIMATE_MS);
    }

    fn enqueue(&mut self, sub: Submission) {
        if !self.active {
            if !run_action(&sub.id, sub.action) {
                self.failed_total += 1;
            }
            self.executed_total += 1;
            return;
        }

        let category = if self.categories.contains_key(&sub.category) {
            sub.category
        } else {
            GENERAL_CATEGORY.to_string()
        };
        if let Some(cat) = self.categories.get_mut(&category) {
            cat.queued_count += 1;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(ScheduledTask {
            id: sub.id,
            priority: sub.priority,
            category,
            enqueue_time: Instant::now(),
            estimated_cost_ms: sub.estimated_cost_ms.max(0.0),
            seq,
            action: sub.action,
        });
    }

    fn drain_inbox(&mut self) {
        while let Ok(sub) = self.inbox_rx.try_recv() {
            self.enqueue(sub);
        }
    }

    // ONE TICK BOUNDARY: ADAPT THE BUDGET, RESET CATEGORIES, DRAIN THE QUEUE.
    pub fn run_tick_cycle(&mut self, throughput: f64) -> TickReport {
        self.drain_inbox();
        if !self.active {
            return TickReport {
                budget_ms: self.current_budget_ms,
                queue_depth: self.queue.len(),
                ..TickReport::default()
            };
        }

        let tick_start = Instant::now();
        self.current_budget_ms =
            tuning::adjust_tick_budget(self.current_budget_ms, self.max_budget_ms, throughput);
        self.categories.values_mut().for_each(TaskCategory::reset);

        let mut report = TickReport {
            budget_ms: self.current_budget_ms,
            ..TickReport::default()
        };
        // TASKS WHOSE CATEGORY RAN DRY THIS TICK. THEY KEEP THEIR SEQ AND GO
        // BACK IN AFTER THE DRAIN, SO NEXT TICK SEES THE SAME ORDER.
        let mut set_aside: Vec<ScheduledTask> = Vec::new();

        while let Some(head) = self.queue.peek() {
            let critical = head.priority == Priority::Critical;
            if !critical {
                let exhausted = self.categories
                    .get(&head.category)
                    .map_or(false, |c| !c.has_budget_remaining());
                if exhausted {
                    if let Some(task) = self.queue.pop() {
                        set_aside.push(task);
                    }
                    continue;
                }
                if report.used_ms + head.estimated_cost_ms > self.current_budget_ms {
                    break;
                }
            }

            let task = match self.queue.pop() {
                Some(t) => t,
                None => break,
            };
            let category = task.category.clone();
            let started = Instant::now();
            let ok = run_action(&task.id, task.action);
            let cost_ms = started.elapsed().as_secs_f64() * 1000.0;

            report.used_ms += cost_ms;
            report.executed += 1;
            self.executed_total += 1;
            if !ok {
                report.failed += 1;
                self.failed_total += 1;
            }
            if let Some(cat) = self.categories.get_mut(&category) {
                cat.budget_used_ms += cost_ms;
                cat.executed_count += 1;
                cat.queued_count = cat.queued_count.saturating_sub(1);
            }
        }

        report.set_aside = set_aside.len() as u32;
        self.queue.extend(set_aside);
        report.queue_depth = self.queue.len();

        let tick_ms = tick_start.elapsed().as_secs_f64() * 1000.0;
        if tick_ms > self.current_budget_ms {
            report.overrun = true;
            self.overruns += 1;
            warn!(
                "TICK BUDGET EXCEEDED: {:.2}ms USED / {:.2}ms BUDGET | QUEUE: {} TASKS",
                tick_ms, self.current_budget_ms, report.queue_depth
            );
        }

        report
    }

    pub fn clear_queue(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.categories.values_mut().for_each(|c| c.queued_count = 0);
        if dropped > 0 {
            info!("CLEARED TICK BUDGET QUEUE ({} TASKS)", dropped);
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn current_budget_ms(&self) -> f64 {
        self.current_budget_ms
    }

    pub fn max_budget_ms(&self) -> f64 {
        self.max_budget_ms
    }

    pub fn category(&self, name: &str) -> Option<&TaskCategory> {
        self.categories.get(name)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            active: self.active,
            queue_depth: self.queue.len(),
            current_budget_ms: self.current_budget_ms,
            max_budget_ms: self.max_budget_ms,
            executed_total: self.executed_total,
            failed_total: self.failed_total,
            overruns: self.overruns,
            categories: self.categories.values().cloned().collect(),
        }
    }
}

impl Drop for BudgetScheduler {
    fn drop(&mut self) {
        self.active = false;
        self.accepting.store(false, AtomicOrdering::Release);
        self.drain_inbox();
    }
}

// RUN ONE ACTION. ERRORS AND PANICS ARE LOGGED AND SWALLOWED; NO RETRY.
fn run_action(id: &str, action: Action) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("ERROR EXECUTING BUDGETED TASK {}: {:#}", id, e);
            false
        }
        Err(_) => {
            error!("BUDGETED TASK {} PANICKED", id);
            false
        }
    }
}
