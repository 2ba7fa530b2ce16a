//! Concurrency utilities for tslab: the writer semaphore and the decode worker pool.

use crossbeam_channel::{Sender, bounded, unbounded};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::{Result, TslabError};

/// A counting semaphore bounding concurrent writers.
pub struct Semaphore {
    permits: Mutex<usize>,
    capacity: usize,
    available: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with `permits` permits (at least one).
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            permits: Mutex::new(permits),
            capacity: permits,
            available: Condvar::new(),
        }
    }

    /// Takes a permit if one is free.
    pub fn try_acquire(&self) -> Option<SemaphoreGuard<'_>> {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return None;
        }
        *permits -= 1;
        Some(SemaphoreGuard { semaphore: self })
    }

    /// Waits up to `timeout` for a permit.
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<SemaphoreGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.available.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                return Err(TslabError::WriteTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                    workers: self.capacity,
                });
            }
        }
        *permits -= 1;
        debug!("Acquired semaphore permit, {} remaining", *permits);
        Ok(SemaphoreGuard { semaphore: self })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        *self.permits.lock()
    }

    fn release(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }
}

/// Returns its permit to the semaphore when dropped.
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Task(Job),
    Shutdown,
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

/// A fixed set of threads fed through a bounded queue. Submitting blocks while the queue is
/// full.
pub struct WorkerPool {
    workers: Mutex<Vec<Worker>>,
    sender: Sender<Message>,
    shutdown: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    inline: bool,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Self {
        let num_workers = if num_workers == 0 {
            warn!("WorkerPool::new called with 0 workers; defaulting to 1");
            1
        } else {
            num_workers
        };

        let (sender, receiver) = bounded::<Message>(num_workers.saturating_mul(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let receiver = receiver.clone();
            let in_flight = Arc::clone(&in_flight);

            let spawned = thread::Builder::new()
                .name(format!("tslab-worker-{}", id))
                .spawn(move || {
                    debug!("Worker {} started", id);
                    while let Ok(message) = receiver.recv() {
                        match message {
                            Message::Task(job) => {
                                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                                    error!("Worker {} task panicked", id);
                                }
                                in_flight.fetch_sub(1, Ordering::AcqRel);
                            }
                            Message::Shutdown => break,
                        }
                    }
                    debug!("Worker {} stopped", id);
                });

            match spawned {
                Ok(thread) => workers.push(Worker {
                    id,
                    thread: Some(thread),
                }),
                Err(e) => {
                    error!("Failed to spawn worker thread {}: {}", id, e);
                    break;
                }
            }
        }

        let inline = workers.is_empty();
        if inline {
            warn!("WorkerPool failed to spawn workers; tasks will run on the caller thread");
        } else {
            info!("Started {} workers", workers.len());
        }

        Self {
            workers: Mutex::new(workers),
            sender,
            shutdown: AtomicBool::new(false),
            in_flight,
            inline,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Queues a job.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(TslabError::StorageClosed);
        }
        if self.inline {
            job();
            return Ok(());
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send(Message::Task(Box::new(job)))
            .map_err(|_| TslabError::ChannelSend {
                channel: "worker_pool".to_string(),
            })
            .inspect_err(|_| {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            })
    }

    /// Runs every task on the pool and returns their results in submission order. The first
    /// failure (an error or a panic) is returned as soon as it arrives; tasks still queued
    /// run to completion and their results are discarded.
    pub fn run_all<T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let count = tasks.len();
        let (results_tx, results_rx) = unbounded::<(usize, Result<T>)>();

        for (index, task) in tasks.into_iter().enumerate() {
            let results_tx = results_tx.clone();
            self.submit(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(task))
                    .unwrap_or_else(|payload| Err(TslabError::TaskPanicked(panic_message(&*payload))));
                // The receiver is gone when another task already failed.
                let _ = results_tx.send((index, result));
            })?;
        }
        drop(results_tx);

        let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
        for _ in 0..count {
            let (index, result) = results_rx.recv()?;
            slots[index] = Some(result?);
        }
        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| TslabError::ChannelReceive {
                    channel: "worker_pool results".to_string(),
                })
            })
            .collect()
    }

    /// Jobs queued or running.
    pub fn active_tasks(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stops accepting jobs, lets queued jobs finish and joins every worker.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.sender.send(Message::Shutdown);
        }
        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take()
                && thread.join().is_err()
            {
                error!("Worker {} panicked during shutdown", worker.id);
            }
        }
        info!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore() {
        let sem = Semaphore::new(2);

        let guard1 = sem.try_acquire().unwrap();
        assert_eq!(sem.available_permits(), 1);

        let _guard2 = sem.try_acquire_for(Duration::from_millis(10)).unwrap();
        assert_eq!(sem.available_permits(), 0);
        assert!(sem.try_acquire().is_none());

        drop(guard1);
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn test_semaphore_timeout() {
        let sem = Semaphore::new(1);
        let _held = sem.try_acquire().unwrap();
        let started = Instant::now();
        assert!(matches!(
            sem.try_acquire_for(Duration::from_millis(30)),
            Err(TslabError::WriteTimeout { workers: 1, .. })
        ));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_semaphore_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(1));
        let held = sem.try_acquire().unwrap();

        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.try_acquire_for(Duration::from_secs(5)).is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_run_all_preserves_order() {
        let pool = WorkerPool::new(4);
        let tasks: Vec<_> = (0..50u64)
            .map(|i| {
                move || {
                    thread::sleep(Duration::from_micros((50 - i) * 10));
                    Ok(i * i)
                }
            })
            .collect();

        let results = pool.run_all(tasks).unwrap();
        assert_eq!(results, (0..50u64).map(|i| i * i).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_run_all_fails_fast() {
        let pool = WorkerPool::new(2);
        let tasks: Vec<Box<dyn FnOnce() -> Result<u32> + Send>> = vec![
            Box::new(|| Ok(1)),
            Box::new(|| Err(TslabError::InvalidConfiguration("boom".to_string()))),
            Box::new(|| Ok(3)),
        ];
        assert!(matches!(
            pool.run_all(tasks),
            Err(TslabError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_run_all_reports_panics() {
        let pool = WorkerPool::new(1);
        let tasks = vec![|| -> Result<()> { panic!("decode exploded") }];
        match pool.run_all(tasks) {
            Err(TslabError::TaskPanicked(message)) => assert!(message.contains("decode exploded")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        // The worker survives the panic.
        assert_eq!(pool.run_all(vec![|| Ok(7)]).unwrap(), vec![7]);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::Acquire), 4);
        assert!(matches!(pool.submit(|| {}), Err(TslabError::StorageClosed)));
    }
}
