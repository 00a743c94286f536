//! Bounded parallel execution of chains.
//!
//! [`WorkerPool`] owns no threads between runs. Each [`WorkerPool::run`] starts
//! exactly `workers` scoped threads that pull job indices from a shared
//! [`TaskQueue`] until it is empty, and returns only after every thread has
//! finished. Results land in one set-once slot per job, so no lock is held
//! around a job's result.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::{ChainError, Result};
use crate::invocation::{ChainSpec, Invocation};
use crate::outcome::{ChainOutcome, ChainStatus};

pub const ERROR_MARKER: &str = "ERROR";

/// Hands out job indices in ascending order, each exactly once.
#[derive(Debug)]
pub struct TaskQueue {
    next: AtomicUsize,
    len: usize,
}

impl TaskQueue {
    pub fn new(len: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            len,
        }
    }

    pub fn take(&self) -> Option<usize> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        (index < self.len).then_some(index)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `task(index)` for every index in `0..jobs` and returns the results
    /// in index order. A panicking task is re-raised here once every worker
    /// has stopped.
    pub fn run<T, F>(&self, jobs: usize, task: F) -> Vec<T>
    where
        T: Send + Sync,
        F: Fn(usize) -> T + Sync,
    {
        let queue = TaskQueue::new(jobs);
        let slots: Vec<OnceLock<T>> = (0..jobs).map(|_| OnceLock::new()).collect();
        thread::scope(|scope| {
            for worker in 0..self.workers {
                let queue = &queue;
                let slots = &slots;
                let task = &task;
                scope.spawn(move || {
                    while let Some(index) = queue.take() {
                        debug!(worker, index, "worker took job");
                        let value = task(index);
                        // Each index is handed out once, so the slot is empty.
                        let _ = slots[index].set(value);
                    }
                });
            }
        });
        // Every index was taken and no worker panicked, so every slot is set.
        let results: Vec<T> = slots.into_iter().filter_map(OnceLock::into_inner).collect();
        debug_assert_eq!(results.len(), jobs);
        results
    }
}

/// Runs every chain to completion with at most `cores` processes at a time.
pub fn run_chains_in_pool(chains: &[(ChainSpec, Invocation)], cores: usize) -> Vec<ChainOutcome> {
    let pool = WorkerPool::new(cores);
    info!(chains = chains.len(), workers = pool.workers(), "dispatching chains");
    pool.run(chains.len(), |index| {
        let (spec, invocation) = &chains[index];
        run_chain(spec, invocation)
    })
}

pub fn run_chain(spec: &ChainSpec, invocation: &Invocation) -> ChainOutcome {
    info!(chain_id = spec.chain_id, "start chain");
    debug!(chain_id = spec.chain_id, command = %invocation.command_line());
    let started = Instant::now();
    let status = match execute(spec, invocation) {
        Ok(status) => status,
        Err(err) => {
            warn!(chain_id = spec.chain_id, error = %err, "chain did not run");
            let reason = match &err {
                ChainError::SpawnFailure { source, .. } => source.to_string(),
                other => other.to_string(),
            };
            if let Err(write_err) =
                write_transcript(&spec.transcript_file, b"", err.to_string().as_bytes())
            {
                warn!(
                    chain_id = spec.chain_id,
                    path = %spec.transcript_file.display(),
                    error = %write_err,
                    "could not write transcript"
                );
            }
            ChainStatus::SpawnFailed(reason)
        }
    };
    let elapsed = started.elapsed();
    match &status {
        ChainStatus::Exited(0) => info!(
            chain_id = spec.chain_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "finish chain"
        ),
        other => warn!(chain_id = spec.chain_id, "chain {}", other),
    }
    ChainOutcome {
        index: spec.index,
        chain_id: spec.chain_id,
        invocation: invocation.clone(),
        status,
        transcript_file: spec.transcript_file.clone(),
        output_file: spec.output_file.clone(),
        elapsed,
    }
}

fn execute(spec: &ChainSpec, invocation: &Invocation) -> Result<ChainStatus> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args);
    cmd.current_dir(&invocation.working_dir);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let child = cmd.spawn().map_err(|source| ChainError::SpawnFailure {
        chain_id: spec.chain_id,
        source,
    })?;
    // Drains both pipes while waiting, so a chatty child cannot block on a full pipe.
    let output = child.wait_with_output()?;
    if let Err(err) = write_transcript(&spec.transcript_file, &output.stdout, &output.stderr) {
        warn!(
            chain_id = spec.chain_id,
            path = %spec.transcript_file.display(),
            error = %err,
            "could not write transcript"
        );
    }
    Ok(match output.status.code() {
        Some(code) => ChainStatus::Exited(code),
        None => ChainStatus::Signaled,
    })
}

fn write_transcript(path: &Path, stdout: &[u8], stderr: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(stdout)?;
    if !stderr.is_empty() {
        if !stdout.is_empty() && !stdout.ends_with(b"\n") {
            file.write_all(b"\n")?;
        }
        writeln!(file, "{}", ERROR_MARKER)?;
        file.write_all(stderr)?;
    }
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn queue_hands_out_each_index_once() {
        let queue = TaskQueue::new(3);
        assert_eq!(queue.take(), Some(0));
        assert_eq!(queue.take(), Some(1));
        assert_eq!(queue.take(), Some(2));
        assert_eq!(queue.take(), None);
        assert_eq!(queue.take(), None);
    }

    #[test]
    fn results_come_back_in_index_order() {
        let pool = WorkerPool::new(3);
        let results = pool
            .run(10, |i| {
                thread::sleep(Duration::from_millis(((10 - i) * 2) as u64));
                i * i
            });
        assert_eq!(results, (0..10).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn never_runs_more_than_pool_size_at_once() {
        for (jobs, workers) in [(8, 1), (8, 3), (5, 5), (3, 8)] {
            let running = AtomicUsize::new(0);
            let peak = AtomicUsize::new(0);
            let pool = WorkerPool::new(workers);
            let results = pool
                .run(jobs, |i| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    i
                });
            assert_eq!(results.len(), jobs);
            let peak = peak.load(Ordering::SeqCst);
            assert!(peak <= workers.min(jobs), "peak {} > {}", peak, workers);
            assert!(peak >= 1);
        }
    }

    #[test]
    fn single_worker_dispatches_in_ascending_order() {
        let seen = Mutex::new(Vec::new());
        WorkerPool::new(1)
            .run(6, |i| {
                if let Ok(mut seen) = seen.lock() {
                    seen.push(i);
                }
            });
        assert_eq!(seen.into_inner().expect("lock"), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn concurrent_takers_claim_indices_in_ascending_order() {
        let queue = TaskQueue::new(9);
        let claimed = Mutex::new(Vec::new());
        thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| loop {
                    let Ok(mut claimed) = claimed.lock() else {
                        return;
                    };
                    match queue.take() {
                        Some(index) => claimed.push(index),
                        None => return,
                    }
                });
            }
        });
        assert_eq!(claimed.into_inner().expect("lock"), (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn multi_worker_pool_starts_lowest_indices_first() {
        let started = Mutex::new(Vec::new());
        let results = WorkerPool::new(3).run(9, |i| {
            if let Ok(mut started) = started.lock() {
                started.push(i);
            }
            thread::sleep(Duration::from_millis(30));
            i
        });
        assert_eq!(results, (0..9).collect::<Vec<_>>());
        let mut started = started.into_inner().expect("lock");
        let mut first: Vec<usize> = started[..3].to_vec();
        first.sort_unstable();
        assert_eq!(first, vec![0, 1, 2]);
        started.sort_unstable();
        assert_eq!(started, (0..9).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic]
    fn panicking_job_is_raised_to_the_caller() {
        WorkerPool::new(2).run(4, |i| {
            if i == 2 {
                panic!("job 2 failed");
            }
            i
        });
    }

    #[test]
    fn spawn_failure_without_transcript_dir_still_records_outcome() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("missing");
        let spec = ChainSpec {
            index: 0,
            chain_id: 1,
            seed: 7,
            data_file: None,
            init: None,
            metric_file: None,
            step_size: None,
            output_file: missing.join("out-1.csv"),
            transcript_file: missing.join("out-1.txt"),
        };
        let invocation = Invocation {
            program: missing.join("no-such-program"),
            args: Vec::new(),
            working_dir: dir.path().to_path_buf(),
        };
        let outcome = run_chain(&spec, &invocation);
        assert!(matches!(outcome.status, ChainStatus::SpawnFailed(_)));
        assert!(!outcome.transcript_file.exists());
    }

    #[test]
    fn zero_workers_still_make_progress() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.workers(), 1);
        assert_eq!(pool.run(2, |i| i + 1), vec![1, 2]);
    }

    #[test]
    fn transcript_marks_error_output() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.txt");
        write_transcript(&path, b"hello", b"oops\n").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "hello\nERROR\noops\n");

        write_transcript(&path, b"quiet\n", b"").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "quiet\n");
    }
}
