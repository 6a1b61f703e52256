//! Test helpers shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::entities::{Executor, Job};

/// Executor that queues jobs until the test runs them explicitly.
#[derive(Default)]
pub struct ManualExecutor {
    queue: Mutex<VecDeque<Job>>,
}

impl ManualExecutor {
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Run the oldest queued job. Returns false if the queue was empty.
    pub fn run_one(&self) -> bool {
        let job = self.queue.lock().unwrap().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs until the queue is empty, including jobs queued meanwhile.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl Executor for ManualExecutor {
    fn execute(&self, job: Job) {
        self.queue.lock().unwrap().push_back(job);
    }
}
