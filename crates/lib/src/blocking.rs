//! Dedicated-thread execution for the object-repo port (§5).
//!
//! libostree keeps per-thread state; every sequence of repo operations that
//! belongs to one logical unit of work (an install, an update, a prune) must
//! run on the same OS thread from first checkout to last release. This
//! module is the "explicit run blocking on a dedicated worker" called for by
//! the redesign note in §9, replacing the original's
//! `runtime.LockOSThread()`/`UnlockOSThread()` pair.

use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single pinned OS thread that repo work is dispatched onto.
pub struct RepoWorker {
    tx: mpsc::Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RepoWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoWorker").finish_non_exhaustive()
    }
}

impl RepoWorker {
    /// Spawn the dedicated thread. It parks waiting for jobs until dropped.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("sysc-repo-worker".to_string())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("spawning repo worker thread");
        Self { tx, handle: Some(handle) }
    }

    /// Run `f` on the pinned thread and block the caller until it completes.
    /// `f`'s result is sent back through a one-shot channel.
    pub fn run<T, Func>(&self, f: Func) -> Result<T>
    where
        T: Send + 'static,
        Func: FnOnce() -> Result<T> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let result = f();
            // The worker thread outlives this send only if the caller is
            // still waiting; a disconnected receiver is fine to ignore.
            let _ = result_tx.send(result);
        });
        self.tx.send(job).map_err(|_| anyhow::anyhow!("repo worker thread has shut down"))?;
        result_rx.recv().map_err(|_| anyhow::anyhow!("repo worker thread panicked"))?
    }
}

impl Drop for RepoWorker {
    fn drop(&mut self) {
        // Dropping `tx` closes the channel, ending the worker's for-loop.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_on_one_thread_in_order() {
        let worker = RepoWorker::spawn();
        let seen = Arc::new(AtomicU64::new(0));
        for i in 1..=5u64 {
            let seen = seen.clone();
            let result = worker.run(move || {
                let prev = seen.fetch_add(i, Ordering::SeqCst);
                Ok(prev + i)
            });
            assert!(result.is_ok());
        }
        assert_eq!(seen.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn error_from_job_propagates_to_caller() {
        let worker = RepoWorker::spawn();
        let result: Result<()> = worker.run(|| anyhow::bail!("boom"));
        assert!(result.is_err());
    }
}
