//! Fixed-size worker pool with fail-fast dispatch.
//!
//! Each worker runs at most one task at a time. The task body runs on the
//! blocking thread pool; a supervising `tokio` task forwards its progress
//! and owns the abort handle, so timeouts and cancellation resolve the
//! caller even while the body is still computing.
//!
//! The busy/idle table is only ever written by pool code: on dispatch,
//! when a terminal message is received, when a task's deadline passes,
//! when a task finishes on its own, and on [`WorkerPool::cancel_all`].

use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use occurrence_map_decimation::decimate;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::WorkerError;
use crate::parser::{parse_records_blocking, worker_chunk_size};
use crate::protocol::{TaskId, WorkerPayload, WorkerResult, WorkerTask};

/// Fewest workers a pool will own.
pub const MIN_POOL_SIZE: usize = 2;

/// Most workers a pool will own.
pub const MAX_POOL_SIZE: usize = 6;

/// Deadline applied when the caller does not supply one.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

enum WorkerState {
    Idle,
    Busy { task_id: TaskId, handle: AbortHandle },
}

struct WorkerSlot {
    state: WorkerState,
    /// Timed-out tasks still running on this worker. Only reclaimed by
    /// `cancel_all` or by finishing on their own.
    orphans: Vec<(TaskId, AbortHandle)>,
}

struct PoolState {
    slots: Mutex<Vec<WorkerSlot>>,
}

impl PoolState {
    fn lock(&self) -> MutexGuard<'_, Vec<WorkerSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `worker_id` idle if it is still running `task_id`, and forgets
    /// any orphan with that id.
    fn release(&self, worker_id: usize, task_id: TaskId) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(worker_id) else {
            return;
        };
        if matches!(slot.state, WorkerState::Busy { task_id: busy, .. } if busy == task_id) {
            slot.state = WorkerState::Idle;
        }
        slot.orphans.retain(|(id, _)| *id != task_id);
    }

    /// Marks `worker_id` idle after a timeout, keeping the still-running
    /// task around so `cancel_all` can terminate it.
    fn orphan(&self, worker_id: usize, task_id: TaskId) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(worker_id) else {
            return;
        };
        if let WorkerState::Busy {
            task_id: busy,
            handle,
        } = &slot.state
            && *busy == task_id
        {
            let handle = handle.clone();
            slot.orphans.push((task_id, handle));
            slot.state = WorkerState::Idle;
        }
    }
}

/// A fixed set of background workers.
///
/// Cheap to share behind an [`Arc`]; all methods take `&self`.
pub struct WorkerPool {
    state: Arc<PoolState>,
    size: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    /// Creates a pool sized to the machine's available parallelism,
    /// clamped to [`MIN_POOL_SIZE`]..=[`MAX_POOL_SIZE`].
    #[must_use]
    pub fn new() -> Self {
        let parallelism =
            std::thread::available_parallelism().map_or(MIN_POOL_SIZE, NonZeroUsize::get);
        Self::with_size(parallelism)
    }

    /// Creates a pool with `size` workers, clamped to
    /// [`MIN_POOL_SIZE`]..=[`MAX_POOL_SIZE`].
    #[must_use]
    pub fn with_size(size: usize) -> Self {
        let size = size.clamp(MIN_POOL_SIZE, MAX_POOL_SIZE);
        let slots = (0..size)
            .map(|_| WorkerSlot {
                state: WorkerState::Idle,
                orphans: Vec::new(),
            })
            .collect();

        log::debug!("worker pool started with {size} workers");

        Self {
            state: Arc::new(PoolState {
                slots: Mutex::new(slots),
            }),
            size,
        }
    }

    /// Number of workers.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Number of workers not currently running a task.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.state
            .lock()
            .iter()
            .filter(|slot| matches!(slot.state, WorkerState::Idle))
            .count()
    }

    /// Hands `task` to the first idle worker.
    ///
    /// Returns immediately; await [`DispatchedTask::wait`] for the result.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NoAvailableWorker`] when every worker is busy.
    ///
    /// # Panics
    ///
    /// Panics if called outside a `tokio` runtime.
    pub fn dispatch(
        &self,
        task: WorkerTask,
        timeout: Duration,
    ) -> Result<DispatchedTask, WorkerError> {
        let task_id = task.task_id();
        let kind = task.kind();

        let mut slots = self.state.lock();
        let Some(worker_id) = slots
            .iter()
            .position(|slot| matches!(slot.state, WorkerState::Idle))
        else {
            log::debug!("no idle worker for {kind} task {task_id}");
            return Err(WorkerError::NoAvailableWorker);
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let work = tokio::spawn(execute(task, tx.clone()));
        slots[worker_id].state = WorkerState::Busy {
            task_id,
            handle: work.abort_handle(),
        };
        drop(slots);

        log::debug!("dispatched {kind} task {task_id} to worker {worker_id}");

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            match work.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    log::error!("worker {worker_id} panicked running task {task_id}");
                    tx.send(WorkerResult::Error {
                        task_id,
                        message: format!("worker {worker_id} panicked"),
                    })
                    .ok();
                }
                // Terminated by `cancel_all`, which already reset the slot.
                Err(_) => return,
            }
            state.release(worker_id, task_id);
        });

        Ok(DispatchedTask {
            task_id,
            worker_id,
            timeout,
            deadline: Instant::now() + timeout,
            rx,
            pool: Arc::clone(&self.state),
        })
    }

    /// Terminates every running task, including timed-out ones, and marks
    /// all workers idle. In-flight results are discarded.
    pub fn cancel_all(&self) {
        let mut slots = self.state.lock();
        let mut terminated = 0usize;

        for slot in slots.iter_mut() {
            if let WorkerState::Busy { handle, .. } = &slot.state {
                handle.abort();
                terminated += 1;
            }
            for (_, handle) in slot.orphans.drain(..) {
                handle.abort();
                terminated += 1;
            }
            slot.state = WorkerState::Idle;
        }

        if terminated > 0 {
            log::info!("terminated {terminated} worker tasks");
        }
    }
}

/// Handle to a task running on a pool worker.
pub struct DispatchedTask {
    task_id: TaskId,
    worker_id: usize,
    timeout: Duration,
    deadline: Instant,
    rx: mpsc::UnboundedReceiver<WorkerResult>,
    pool: Arc<PoolState>,
}

impl DispatchedTask {
    /// The dispatched task's id.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Index of the worker running the task.
    #[must_use]
    pub const fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Marks the worker idle, leaving the task running as an orphan.
    fn timed_out(&self) -> WorkerError {
        log::warn!(
            "task {} on worker {} timed out after {:?}",
            self.task_id,
            self.worker_id,
            self.timeout
        );
        self.pool.orphan(self.worker_id, self.task_id);
        WorkerError::Timeout {
            task_id: self.task_id,
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Waits for the task's terminal message, forwarding progress
    /// percentages to `on_progress`.
    ///
    /// # Errors
    ///
    /// * [`WorkerError::Timeout`] once the deadline has passed, even if a
    ///   result is already waiting; the worker is marked idle but the task
    ///   keeps running until `cancel_all`.
    /// * [`WorkerError::Task`] if the worker reported an error.
    /// * [`WorkerError::Cancelled`] if the worker was terminated.
    pub async fn wait<F>(mut self, mut on_progress: F) -> Result<WorkerPayload, WorkerError>
    where
        F: FnMut(f64) + Send,
    {
        loop {
            if Instant::now() >= self.deadline {
                return Err(self.timed_out());
            }

            let message = tokio::select! {
                biased;
                () = tokio::time::sleep_until(self.deadline) => return Err(self.timed_out()),
                message = self.rx.recv() => message,
            };

            let Some(message) = message else {
                return Err(WorkerError::Cancelled {
                    task_id: self.task_id,
                });
            };

            if message.is_terminal() {
                self.pool.release(self.worker_id, self.task_id);
            }

            match message {
                WorkerResult::Progress { percentage, .. } => on_progress(percentage),
                WorkerResult::Complete { payload, .. } => return Ok(payload),
                WorkerResult::Error { message, .. } => {
                    return Err(WorkerError::Task {
                        task_id: self.task_id,
                        message,
                    });
                }
            }
        }
    }
}

/// Supervises one task: runs its body on the blocking pool and relays
/// progress and the terminal message through `tx`.
///
/// Aborting this future drops the progress receiver, which makes the
/// blocking body stop at its next progress report.
async fn execute(task: WorkerTask, tx: mpsc::UnboundedSender<WorkerResult>) {
    let task_id = task.task_id();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let body = tokio::task::spawn_blocking(move || run_task(task, &progress_tx));

    while let Some(percentage) = progress_rx.recv().await {
        tx.send(WorkerResult::Progress {
            task_id,
            percentage,
        })
        .ok();
    }

    match body.await {
        Ok(Some(payload)) => {
            tx.send(WorkerResult::Complete { task_id, payload }).ok();
        }
        Ok(None) => {}
        // Re-raised so the monitor reports it like any other worker panic.
        Err(e) => {
            if let Ok(panic) = e.try_into_panic() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

/// Task body. Returns `None` if the supervisor went away mid-task.
fn run_task(task: WorkerTask, progress: &mpsc::UnboundedSender<f64>) -> Option<WorkerPayload> {
    let report = |percentage: f64| {
        if progress.send(percentage).is_ok() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    };

    match task {
        WorkerTask::Parse { raw_records, .. } => {
            let chunk_size = worker_chunk_size(raw_records.len());
            parse_records_blocking(&raw_records, chunk_size, Utc::now(), report)
                .map(WorkerPayload::Parsed)
        }
        WorkerTask::Decimate {
            points,
            target_count,
            algorithm,
            ..
        } => {
            let points = decimate(points, target_count, algorithm);
            report(100.0)
                .is_continue()
                .then_some(WorkerPayload::Decimated { points })
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;
    use occurrence_map_occurrence_models::{
        DataPoint, DecimationAlgorithm, PointMetadata, RawRecord,
    };

    use super::*;

    fn records(n: u64) -> Vec<RawRecord> {
        (0..n)
            .map(|i| RawRecord {
                id: i,
                scientific_name: "Ursus arctos".to_string(),
                latitude: Some(45.0),
                longitude: Some(-110.0),
                event_date: Some("2019-08-01".to_string()),
                country_code: Some("US".to_string()),
                locality: None,
                coordinate_uncertainty_in_meters: None,
                issues: vec![],
            })
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn points(n: u64) -> Vec<DataPoint> {
        let date = Utc.with_ymd_and_hms(2019, 8, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| DataPoint {
                id: i,
                latitude: ((i * 37) % 1_000) as f64 * 0.1 - 50.0,
                longitude: ((i * 53) % 3_000) as f64 * 0.1 - 150.0,
                date,
                accuracy: (i % 97) as f64,
                metadata: PointMetadata {
                    scientific_name: "Ursus arctos".to_string(),
                    country_code: None,
                    locality: None,
                    issues: vec![],
                },
            })
            .collect()
    }

    #[test]
    fn size_is_clamped() {
        assert_eq!(WorkerPool::with_size(0).size(), MIN_POOL_SIZE);
        assert_eq!(WorkerPool::with_size(64).size(), MAX_POOL_SIZE);
        assert_eq!(WorkerPool::with_size(4).size(), 4);
        let default = WorkerPool::new().size();
        assert!((MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&default));
    }

    #[tokio::test]
    async fn parse_task_completes_with_progress() {
        let pool = WorkerPool::with_size(2);
        let task = pool
            .dispatch(WorkerTask::parse(records(200)), DEFAULT_TASK_TIMEOUT)
            .unwrap();
        assert_eq!(pool.idle_count(), 1);

        let mut reports = Vec::new();
        let payload = task.wait(|pct| reports.push(pct)).await.unwrap();

        let WorkerPayload::Parsed(summary) = payload else {
            panic!("expected parsed payload");
        };
        assert_eq!(summary.valid_count, 200);
        assert_eq!(reports.len(), 20);
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_pool_fails_synchronously() {
        let pool = WorkerPool::with_size(2);
        let first = pool
            .dispatch(WorkerTask::parse(records(10)), DEFAULT_TASK_TIMEOUT)
            .unwrap();
        let second = pool
            .dispatch(WorkerTask::parse(records(10)), DEFAULT_TASK_TIMEOUT)
            .unwrap();
        assert_ne!(first.worker_id(), second.worker_id());
        assert_eq!(pool.idle_count(), 0);

        let third = pool.dispatch(WorkerTask::parse(records(10)), DEFAULT_TASK_TIMEOUT);
        assert!(matches!(third, Err(WorkerError::NoAvailableWorker)));

        first.wait(|_| {}).await.unwrap();
        second.wait(|_| {}).await.unwrap();
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn decimate_task_returns_points() {
        let pool = WorkerPool::with_size(2);
        let parsed = pool
            .dispatch(WorkerTask::parse(records(50)), DEFAULT_TASK_TIMEOUT)
            .unwrap()
            .wait(|_| {})
            .await
            .unwrap();
        let WorkerPayload::Parsed(summary) = parsed else {
            panic!("expected parsed payload");
        };

        let payload = pool
            .dispatch(
                WorkerTask::decimate(summary.points, 5, DecimationAlgorithm::Random),
                DEFAULT_TASK_TIMEOUT,
            )
            .unwrap()
            .wait(|_| {})
            .await
            .unwrap();
        let WorkerPayload::Decimated { points } = payload else {
            panic!("expected decimated payload");
        };
        assert_eq!(points.len(), 5);
    }

    #[tokio::test]
    async fn cancel_all_terminates_busy_workers() {
        let pool = WorkerPool::with_size(2);
        let first = pool
            .dispatch(WorkerTask::parse(records(500)), DEFAULT_TASK_TIMEOUT)
            .unwrap();
        let second = pool
            .dispatch(WorkerTask::parse(records(500)), DEFAULT_TASK_TIMEOUT)
            .unwrap();
        assert_eq!(pool.idle_count(), 0);

        pool.cancel_all();
        assert_eq!(pool.idle_count(), 2);

        assert!(matches!(
            first.wait(|_| {}).await,
            Err(WorkerError::Cancelled { .. })
        ));
        assert!(matches!(
            second.wait(|_| {}).await,
            Err(WorkerError::Cancelled { .. })
        ));

        // Idempotent.
        pool.cancel_all();
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn timeout_frees_worker_and_keeps_task_for_cancel() {
        let pool = WorkerPool::with_size(2);
        let task = pool
            .dispatch(WorkerTask::parse(records(50_000)), Duration::ZERO)
            .unwrap();
        let task_id = task.task_id();

        let result = task.wait(|_| {}).await;
        assert!(matches!(
            result,
            Err(WorkerError::Timeout { task_id: id, timeout_ms: 0 }) if id == task_id
        ));
        assert_eq!(pool.idle_count(), 2);

        pool.cancel_all();
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn overdue_result_is_reported_as_timeout() {
        let pool = WorkerPool::with_size(2);
        let task = pool
            .dispatch(
                WorkerTask::decimate(points(100), 10, DecimationAlgorithm::Spatial),
                Duration::from_millis(20),
            )
            .unwrap();

        // Let the worker finish and queue its result before anyone waits.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let result = task.wait(|_| {}).await;
        assert!(matches!(
            result,
            Err(WorkerError::Timeout {
                timeout_ms: 20,
                ..
            })
        ));
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn slow_decimation_times_out_without_stalling_the_runtime() {
        let pool = WorkerPool::with_size(2);
        let task = pool
            .dispatch(
                WorkerTask::decimate(points(300_000), 1_000, DecimationAlgorithm::Spatial),
                Duration::from_millis(20),
            )
            .unwrap();

        let heartbeat = tokio::spawn(async {
            let started = Instant::now();
            tokio::time::sleep(Duration::from_millis(5)).await;
            started.elapsed()
        });

        let started = Instant::now();
        let result = task.wait(|_| {}).await;

        assert!(matches!(result, Err(WorkerError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(heartbeat.await.unwrap() < Duration::from_millis(250));
        assert_eq!(pool.idle_count(), 2);

        pool.cancel_all();
    }
}
