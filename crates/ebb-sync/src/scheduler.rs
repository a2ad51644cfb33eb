use std::time::{Duration, Instant};

use tracing::warn;

use ebb_core::Result;

// ---------------------------------------------------------------------------
// TaskScheduler
// ---------------------------------------------------------------------------

type TaskFn = Box<dyn FnMut() -> Result<()> + Send>;

struct ScheduledTask {
    name: String,
    /// Higher runs first when several tasks are due at the same tick.
    priority: i32,
    interval: Duration,
    next_run: Instant,
    callback: TaskFn,
}

/// Cooperative, single-threaded periodic task registry.
///
/// The host drives it: call [`TaskScheduler::run_due`] from the app's tick
/// (or sleep until [`TaskScheduler::next_deadline`]). Tasks are identified
/// by name — registering an existing name replaces the task, and
/// cancellation is by name. A failing task is logged and stays scheduled.
#[derive(Default)]
pub struct TaskScheduler {
    tasks: Vec<ScheduledTask>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a periodic task. The first run is due
    /// immediately.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        interval: Duration,
        callback: impl FnMut() -> Result<()> + Send + 'static,
    ) {
        let name = name.into();
        self.tasks.retain(|t| t.name != name);
        self.tasks.push(ScheduledTask {
            name,
            priority,
            interval,
            next_run: Instant::now(),
            callback: Box::new(callback),
        });
    }

    /// Remove the named task; pending runs are dropped with it.
    pub fn cancel(&mut self, name: &str) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.name != name);
        self.tasks.len() != before
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Earliest `next_run` across all tasks.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.iter().map(|t| t.next_run).min()
    }

    /// Run every task whose deadline has passed, highest priority first.
    /// Returns the number of tasks run.
    pub fn run_due(&mut self, now: Instant) -> usize {
        let mut due: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.next_run <= now)
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|i| std::cmp::Reverse(self.tasks[*i].priority));

        let mut ran = 0;
        for index in due {
            let task = &mut self.tasks[index];
            task.next_run = now + task.interval;
            if let Err(err) = (task.callback)() {
                warn!(task = %task.name, error = %err, "scheduled task failed");
            }
            ran += 1;
        }
        ran
    }
}
