//! Periodic task execution.
//!
//! Every engine component does its work in a tick: a [`PeriodicTask`] that
//! drains pending upstream changes, updates the component's index and tells
//! the scheduler how long to wait before the next tick. The scheduler is
//! injected so tests can drive ticks by hand with [`ManualTaskScheduler`].

use crate::listeners::lock;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};
use uuid::Uuid;

/// granularity at which a sleeping worker checks for cancellation
const SLEEP_SLICE: Duration = Duration::from_millis(10);

pub type TaskId = Uuid;

/// Cooperative stop signal handed to each tick.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One unit of recurring work.
pub trait PeriodicTask: Send + Sync {
    /// Run a single tick and return the delay before the next one.
    ///
    /// A zero delay means more work is immediately available.
    fn run_once(&self, token: &CancellationToken) -> Duration;

    fn name(&self) -> &str {
        "task"
    }
}

pub trait TaskScheduler: Send + Sync {
    fn start_periodic(&self, task: Arc<dyn PeriodicTask>) -> TaskId;

    /// stop a task, the task is not run again once this returns
    fn stop_periodic(&self, id: TaskId);
}

struct Worker {
    token: CancellationToken,
    handle: thread::JoinHandle<()>,
}

/// Runs each periodic task on its own background thread.
#[derive(Default)]
pub struct ThreadTaskScheduler {
    workers: Mutex<HashMap<TaskId, Worker>>,
}

impl ThreadTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskScheduler for ThreadTaskScheduler {
    fn start_periodic(&self, task: Arc<dyn PeriodicTask>) -> TaskId {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let worker_token = token.clone();

        let handle = thread::spawn(move || {
            log::debug!("Task {} ({}) started", id, task.name());

            while !worker_token.is_cancelled() {
                let delay = task.run_once(&worker_token);

                let deadline = Instant::now() + delay;
                while !worker_token.is_cancelled() {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    thread::sleep((deadline - now).min(SLEEP_SLICE));
                }
            }

            log::debug!("Task {} ({}) stopped", id, task.name());
        });

        lock(&self.workers).insert(id, Worker { token, handle });
        id
    }

    fn stop_periodic(&self, id: TaskId) {
        let Some(worker) = lock(&self.workers).remove(&id) else {
            return;
        };

        worker.token.cancel();
        // a task may drop its own owner from inside a tick
        if worker.handle.thread().id() == thread::current().id() {
            return;
        }
        if worker.handle.join().is_err() {
            log::error!("Task {} panicked", id);
        }
    }
}

impl Drop for ThreadTaskScheduler {
    fn drop(&mut self) {
        let workers: Vec<_> = lock(&self.workers).drain().collect();
        for (_, worker) in &workers {
            worker.token.cancel();
        }
        for (id, worker) in workers {
            if worker.handle.join().is_err() {
                log::error!("Task {} panicked", id);
            }
        }
    }
}

/// Scheduler that only runs tasks when told to.
#[derive(Default)]
pub struct ManualTaskScheduler {
    tasks: Mutex<Vec<(TaskId, Arc<dyn PeriodicTask>)>>,
    token: CancellationToken,
}

impl ManualTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// run every registered task exactly once, in registration order
    pub fn run_once(&self) {
        let tasks: Vec<_> = lock(&self.tasks)
            .iter()
            .map(|(_, task)| task.clone())
            .collect();
        for task in tasks {
            task.run_once(&self.token);
        }
    }

    pub fn run(&self, times: usize) {
        for _ in 0..times {
            self.run_once();
        }
    }

    pub fn periodic_task_count(&self) -> usize {
        lock(&self.tasks).len()
    }
}

impl TaskScheduler for ManualTaskScheduler {
    fn start_periodic(&self, task: Arc<dyn PeriodicTask>) -> TaskId {
        let id = Uuid::new_v4();
        lock(&self.tasks).push((id, task));
        id
    }

    fn stop_periodic(&self, id: TaskId) {
        lock(&self.tasks).retain(|(task_id, _)| *task_id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        runs: AtomicUsize,
        delay: Duration,
    }

    impl PeriodicTask for Counter {
        fn run_once(&self, _token: &CancellationToken) -> Duration {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.delay
        }
    }

    fn counter(delay: Duration) -> Arc<Counter> {
        Arc::new(Counter {
            runs: AtomicUsize::new(0),
            delay,
        })
    }

    #[test]
    fn test_manual_scheduler_runs_on_demand() {
        let scheduler = ManualTaskScheduler::new();
        let task = counter(Duration::from_secs(60));
        let id = scheduler.start_periodic(task.clone());
        assert_eq!(scheduler.periodic_task_count(), 1);
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);

        scheduler.run(3);
        assert_eq!(task.runs.load(Ordering::SeqCst), 3);

        scheduler.stop_periodic(id);
        scheduler.run_once();
        assert_eq!(task.runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.periodic_task_count(), 0);
    }

    #[test]
    fn test_thread_scheduler_runs_until_stopped() {
        let scheduler = ThreadTaskScheduler::new();
        let task = counter(Duration::from_millis(1));
        let id = scheduler.start_periodic(task.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        while task.runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        scheduler.stop_periodic(id);

        let runs = task.runs.load(Ordering::SeqCst);
        assert!(runs >= 3);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(task.runs.load(Ordering::SeqCst), runs);
    }

    #[test]
    fn test_stop_does_not_wait_for_long_delay() {
        let scheduler = ThreadTaskScheduler::new();
        let task = counter(Duration::from_secs(3600));
        let id = scheduler.start_periodic(task.clone());

        let started = Instant::now();
        while task.runs.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        scheduler.stop_periodic(id);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
