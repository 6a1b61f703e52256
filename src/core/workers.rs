//! Execution contexts: a work-stealing thread pool and an inline executor.
//!
//! Hardware ingestion callbacks, fusion jobs and observer deliveries are all
//! dispatched through the `Executor` trait so each can run on its own context.
//!
//! `Workers` uses work-stealing deques:
//! - External jobs land in a global injector
//! - Idle workers drain their own deque, then the injector, then steal from peers
//!
//! Epoch-based cancellation (`Executor::execute_with_epoch`) makes jobs that
//! were scheduled for a replaced bundle cycle a no-op at run time.

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use log::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::entities::{Executor, Job};

/// Thread pool with work-stealing for background jobs.
///
/// # Example
/// ```ignore
/// let workers = Arc::new(Workers::new(4));
/// workers.execute(Box::new(move || aggregator.on_frame_available()));
/// ```
pub struct Workers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers")
            .field("threads", &self.handles.len())
            .field("queued", &self.injector.len())
            .finish()
    }
}

impl Workers {
    /// Create worker pool with `num_threads` threads (at least one).
    ///
    /// Recommended: `num_cpus::get() * 3 / 4` (see `PipelineConfig::worker_threads`).
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let locals: Vec<Worker<Job>> = (0..num_threads).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Job>> = locals.iter().map(Worker::stealer).collect();

        let mut handles = Vec::with_capacity(num_threads);
        for (worker_id, local) in locals.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let stealers = stealers.clone();

            let handle = thread::Builder::new()
                .name(format!("capture-worker-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);
                    loop {
                        if let Some(job) = find_job(&local, &injector, &stealers) {
                            job();
                            continue;
                        }
                        // Pending jobs are drained before honouring shutdown
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        thread::sleep(Duration::from_millis(1));
                    }
                    trace!("Worker {} stopped", worker_id);
                })
                .expect("Failed to spawn worker thread");

            handles.push(handle);
        }

        trace!("Workers initialized: {} threads (work-stealing)", num_threads);

        Self {
            injector,
            handles,
            shutdown,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }
}

fn find_job(local: &Worker<Job>, injector: &Injector<Job>, stealers: &[Stealer<Job>]) -> Option<Job> {
    local.pop().or_else(|| {
        std::iter::repeat_with(|| {
            injector
                .steal_batch_and_pop(local)
                .or_else(|| stealers.iter().map(Stealer::steal).collect::<Steal<Job>>())
        })
        .find(|s| !s.is_retry())
        .and_then(Steal::success)
    })
}

impl Executor for Workers {
    fn execute(&self, job: Job) {
        self.injector.push(job);
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);
        self.shutdown.store(true, Ordering::Release);

        // Bounded wait: a job blocked on external hardware must not hang shutdown
        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, detaching remaining workers");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        trace!("All {} workers stopped gracefully", num_threads);
    }
}

/// Runs every job inline on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}
