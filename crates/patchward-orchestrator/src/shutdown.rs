use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use tracing::{debug, error};

type ShutdownTask = Box<dyn FnOnce() + Send + 'static>;

/// Compensating tasks deferred to the end of the process.
///
/// Each registered task runs exactly once: either through [`run_all`] once
/// the response has gone out, or when the registry is dropped (early return
/// or unwinding).
///
/// [`run_all`]: ShutdownHooks::run_all
#[derive(Default)]
pub struct ShutdownHooks {
    tasks: Mutex<Vec<(String, ShutdownTask)>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, label: impl Into<String>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let label = label.into();
        debug!(task = %label, "shutdown task registered");
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.push((label, Box::new(task)));
    }

    pub fn pending_labels(&self) -> Vec<String> {
        match self.tasks.lock() {
            Ok(tasks) => tasks.iter().map(|(label, _)| label.clone()).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(label, _)| label.clone())
                .collect(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending_labels().len()
    }

    /// Runs every pending task in registration order and returns how many ran.
    /// A panicking task is logged and does not stop the rest.
    pub fn run_all(&self) -> usize {
        let drained = {
            let mut tasks = match self.tasks.lock() {
                Ok(tasks) => tasks,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *tasks)
        };

        let count = drained.len();
        for (label, task) in drained {
            debug!(task = %label, "running shutdown task");
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!(task = %label, "shutdown task panicked");
            }
        }
        count
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        self.run_all();
    }
}
