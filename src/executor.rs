use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam_channel::RecvTimeoutError;
use rand::Rng;
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A one-shot unit of work, typically the delivery of a single message to a
/// single replica.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A repeating unit of work. Invoked once per cadence interval for as long
/// as it keeps returning true.
pub type PeriodicTask = Box<dyn FnMut() -> bool + Send + 'static>;

/// How often a periodic task fires.
#[derive(Clone, Copy, Debug)]
pub enum Cadence {
    Fixed(Duration),
    /// A fresh uniformly random delay from the inclusive range before every
    /// invocation, so competing candidates fall out of lockstep.
    Jittered(Duration, Duration),
}

impl Cadence {
    fn next_delay(&self) -> Duration {
        match *self {
            Cadence::Fixed(interval) => interval,
            Cadence::Jittered(lo, hi) => rand::thread_rng().gen_range(lo..=hi),
        }
    }
}

/// The scheduling seam between replicas and whatever runs them. Replicas
/// submit ticks, campaign rounds, and message deliveries through this trait
/// and never touch threads themselves, which is what lets the tests swap in
/// a deterministic implementation.
pub trait Executor: Send + Sync {
    /// Runs the task on some worker, at most once.
    fn submit(&self, task: Task);

    /// Installs a repeating task. Firings are separated by the cadence
    /// delay; the task is dropped once it returns false.
    fn spawn_periodic(&self, cadence: Cadence, task: PeriodicTask);
}

const IDLE_POLL: Duration = Duration::from_millis(20);

/// A bounded pool of worker threads draining a shared task queue.
///
/// Periodic tasks pin a worker for their whole lifetime, so the pool must be
/// sized for the number of long-lived timers plus the desired delivery
/// parallelism. Dropping the pool lets tasks already executing finish and
/// discards everything still queued.
pub struct ThreadPool {
    handle: Arc<PoolHandle>,
    workers: Vec<JoinHandle<()>>,
}

/// Submission handle to a [`ThreadPool`]. This is the piece replicas hold;
/// the pool itself stays with whoever owns the lifecycle. Handles that
/// outlive the pool turn submissions into no-ops.
pub struct PoolHandle {
    tx: Sender<Task>,
    shutdown: Arc<AtomicBool>,
}

impl ThreadPool {
    pub fn new(workers: usize) -> ThreadPool {
        let (tx, rx) = unbounded::<Task>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = Arc::new(PoolHandle { tx, shutdown });
        let workers = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                let shutdown = handle.shutdown.clone();
                thread::spawn(move || worker_loop(rx, shutdown))
            })
            .collect();
        ThreadPool { handle, workers }
    }

    pub fn handle(&self) -> Arc<PoolHandle> {
        self.handle.clone()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.handle.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(rx: Receiver<Task>, shutdown: Arc<AtomicBool>) {
    loop {
        match rx.recv_timeout(IDLE_POLL) {
            Ok(task) => {
                if !shutdown.load(Ordering::SeqCst) {
                    task();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

impl Executor for PoolHandle {
    fn submit(&self, task: Task) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(task);
    }

    fn spawn_periodic(&self, cadence: Cadence, mut task: PeriodicTask) {
        let shutdown = self.shutdown.clone();
        self.submit(Box::new(move || loop {
            thread::sleep(cadence.next_delay());
            if shutdown.load(Ordering::SeqCst) || !task() {
                break;
            }
        }));
    }
}

/// A deterministic executor: nothing runs until the test asks for it.
/// Submitted tasks queue in FIFO order and run when [`run_until_idle`]
/// drains the queue; periodic tasks fire exactly once per [`fire_timers`]
/// call, with no clocks involved.
///
/// [`run_until_idle`]: DeferredExecutor::run_until_idle
/// [`fire_timers`]: DeferredExecutor::fire_timers
#[derive(Default)]
pub struct DeferredExecutor {
    tasks: Mutex<VecDeque<Task>>,
    timers: Mutex<Vec<PeriodicTask>>,
}

impl DeferredExecutor {
    pub fn new() -> DeferredExecutor {
        DeferredExecutor::default()
    }

    /// Runs queued tasks, including any enqueued while draining, until the
    /// queue is empty.
    pub fn run_until_idle(&self) {
        loop {
            let task = self.tasks.lock().unwrap().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Number of tasks waiting in the queue.
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Fires every installed periodic task once and discards the ones that
    /// report completion. Timers installed during the pass fire from the
    /// next call onward.
    pub fn fire_timers(&self) {
        let mut current = mem::take(&mut *self.timers.lock().unwrap());
        current.retain_mut(|task| task());
        let mut timers = self.timers.lock().unwrap();
        let added = mem::take(&mut *timers);
        *timers = current;
        timers.extend(added);
    }
}

impl Executor for DeferredExecutor {
    fn submit(&self, task: Task) {
        self.tasks.lock().unwrap().push_back(task);
    }

    fn spawn_periodic(&self, _cadence: Cadence, task: PeriodicTask) {
        self.timers.lock().unwrap().push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn pool_runs_submitted_tasks() {
        let pool = ThreadPool::new(2);
        let (tx, rx) = bounded(1);
        pool.handle().submit(Box::new(move || tx.send(7).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 7);
    }

    #[test]
    fn periodic_task_stops_after_reporting_done() {
        let pool = ThreadPool::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        pool.handle().spawn_periodic(
            Cadence::Fixed(Duration::from_millis(5)),
            Box::new(move || seen.fetch_add(1, Ordering::SeqCst) + 1 < 3),
        );
        thread::sleep(Duration::from_millis(250));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn deferred_runs_tasks_in_submission_order() {
        let exec = DeferredExecutor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            exec.submit(Box::new(move || seen.lock().unwrap().push(i)));
        }
        exec.run_until_idle();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn deferred_task_may_enqueue_more_work() {
        let exec = Arc::new(DeferredExecutor::new());
        let count = Arc::new(AtomicUsize::new(0));
        let (chained, tally) = (exec.clone(), count.clone());
        exec.submit(Box::new(move || {
            tally.fetch_add(1, Ordering::SeqCst);
            let tally = tally.clone();
            chained.submit(Box::new(move || {
                tally.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        exec.run_until_idle();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn deferred_timers_fire_once_per_round() {
        let exec = DeferredExecutor::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        exec.spawn_periodic(
            Cadence::Fixed(Duration::from_millis(1)),
            Box::new(move || seen.fetch_add(1, Ordering::SeqCst) + 1 < 2),
        );
        exec.fire_timers();
        exec.fire_timers();
        // The timer reported completion on the second round and is gone.
        exec.fire_timers();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
