// Single-worker task queue: the one ordering domain for cluster state.
//
// Every mutation of presence state runs as a task on this queue, whichever
// thread produced it (link reader, host event thread, reconnect timer). Tasks
// run one at a time, in submission order, on one dedicated worker thread, so
// two mutations are never interleaved and a reader never sees half of a task.
//
// Producers never block beyond the queue mutex. The worker blocks on a
// condition variable only while the queue is empty and the executor is
// running.
//
// Shutdown is cooperative: the task currently running finishes, queued tasks
// that have not started are dropped without running, and `schedule` turns
// into a silent no-op so teardown races are harmless.
//
// A panic inside a task is caught at this boundary and logged; the worker
// moves on to the next task.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error};

/// A unit of work for the executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    running: bool,
}

struct Inner {
    queue: Mutex<Queue>,
    wake: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        // Tasks never run while the queue lock is held, so a poisoned lock
        // still guards a consistent queue.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO task executor backed by one worker thread.
pub struct TaskExecutor {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl TaskExecutor {
    /// Spawn the worker thread.
    pub fn start(name: &str) -> io::Result<Self> {
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                running: true,
            }),
            wake: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_worker(&worker_inner))?;
        let worker_id = handle.thread().id();
        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    /// Append a task. Never blocks on running tasks; does nothing once
    /// `shutdown` has been called.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.inner.lock();
        if !queue.running {
            return;
        }
        let was_empty = queue.tasks.is_empty();
        queue.tasks.push_back(Box::new(task));
        if was_empty {
            self.inner.wake.notify_one();
        }
    }

    /// Stop accepting tasks and let the worker exit after the task it is
    /// currently running, if any. Queued tasks are dropped unrun.
    pub fn shutdown(&self) {
        let dropped = {
            let mut queue = self.inner.lock();
            if !queue.running {
                return;
            }
            queue.running = false;
            self.inner.wake.notify_all();
            std::mem::take(&mut queue.tasks)
        };
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "executor stopped with tasks still queued");
        }
        // Dropped outside the lock: a task's captured state may schedule
        // from its destructor.
        drop(dropped);
    }

    /// Wait for the worker thread to exit. Returns immediately when called
    /// from the worker itself or when already joined.
    pub fn join(&self) {
        if self.is_worker_thread() {
            return;
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Tasks queued but not started.
    pub fn pending(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// True when called from inside a task.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(inner: &Inner) {
    loop {
        let task = {
            let mut queue = inner.lock();
            loop {
                if !queue.running {
                    return;
                }
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                queue = inner
                    .wake
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(panic = %panic_message(payload.as_ref()), "task failed on the client thread");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    /// Block until every task scheduled so far has run.
    fn drain(executor: &TaskExecutor) {
        let (tx, rx) = mpsc::channel();
        executor.schedule(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(WAIT).expect("executor did not drain");
    }

    #[test]
    fn tasks_run_in_submission_order() {
        let executor = TaskExecutor::start("test-order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            executor.schedule(move || seen.lock().unwrap().push(i));
        }
        drain(&executor);
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn tasks_run_on_the_worker_thread() {
        let executor = Arc::new(TaskExecutor::start("test-thread").unwrap());
        assert!(!executor.is_worker_thread());
        let (tx, rx) = mpsc::channel();
        let inside = Arc::clone(&executor);
        executor.schedule(move || {
            let _ = tx.send(inside.is_worker_thread());
        });
        assert!(rx.recv_timeout(WAIT).unwrap());
    }

    #[test]
    fn panicking_task_does_not_stop_the_worker() {
        let executor = TaskExecutor::start("test-panic").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let before = Arc::clone(&ran);
        executor.schedule(move || {
            before.fetch_add(1, Ordering::SeqCst);
        });
        executor.schedule(|| panic!("boom"));
        let after = Arc::clone(&ran);
        executor.schedule(move || {
            after.fetch_add(1, Ordering::SeqCst);
        });
        drain(&executor);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(executor.is_running());
    }

    #[test]
    fn schedule_after_shutdown_is_a_silent_no_op() {
        let executor = TaskExecutor::start("test-stopped").unwrap();
        executor.shutdown();
        executor.join();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        executor.schedule(move || flag.store(true, Ordering::SeqCst));
        assert_eq!(executor.pending(), 0);
        assert!(!ran.load(Ordering::SeqCst));
        // A second shutdown is harmless too.
        executor.shutdown();
    }

    #[test]
    fn shutdown_finishes_current_task_and_drops_the_rest() {
        let executor = TaskExecutor::start("test-shutdown").unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let finished = Arc::new(AtomicBool::new(false));
        let queued_ran = Arc::new(AtomicBool::new(false));

        let finished_flag = Arc::clone(&finished);
        executor.schedule(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(WAIT);
            finished_flag.store(true, Ordering::SeqCst);
        });
        let queued_flag = Arc::clone(&queued_ran);
        executor.schedule(move || queued_flag.store(true, Ordering::SeqCst));

        started_rx.recv_timeout(WAIT).unwrap();
        executor.shutdown();
        release_tx.send(()).unwrap();
        executor.join();

        assert!(finished.load(Ordering::SeqCst));
        assert!(!queued_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_producers_lose_nothing_and_keep_their_own_order() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 500;

        let executor = Arc::new(TaskExecutor::start("test-producers").unwrap());
        let applied = Arc::new(Mutex::new(Vec::new()));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let executor = Arc::clone(&executor);
                let applied = Arc::clone(&applied);
                thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        let applied = Arc::clone(&applied);
                        executor.schedule(move || applied.lock().unwrap().push((producer, seq)));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        drain(&executor);

        let applied = applied.lock().unwrap();
        assert_eq!(applied.len(), PRODUCERS * PER_PRODUCER);
        let mut next = [0usize; PRODUCERS];
        for &(producer, seq) in applied.iter() {
            assert_eq!(seq, next[producer], "producer {producer} out of order");
            next[producer] += 1;
        }
        assert!(next.iter().all(|&n| n == PER_PRODUCER));
    }
}
