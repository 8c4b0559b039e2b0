//! Periodic flush of every worker's window into storage.
//!
//! Each tick swaps all windows, turns the drained records into write
//! requests, submits them as one batch and releases the buffers. Failures
//! are logged and counted; the tick's data is not retried.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;
use crate::storage::{BatchSink, StorageBackend};
use crate::worker::Worker;

/// Timer state machine: `Idle -> Running -> Idle` once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Running,
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Workers whose window was swapped.
    pub swapped: usize,
    /// Workers skipped because their previous buffer was still held.
    pub skipped: usize,
    /// Workers whose collection aborted on a storage read error.
    pub aborted: usize,
    pub inserts: usize,
    pub updates: usize,
    /// Records lost to merge or request-building errors.
    pub dropped: usize,
    /// Requests handed to the batch sink.
    pub submitted: usize,
    /// Whether the batch sink reported an error.
    pub failed: bool,
}

pub struct PersistenceTimer<B: StorageBackend> {
    backend: Arc<B>,
    workers: Vec<Arc<Worker<B::Dao>>>,
    initial_delay: Duration,
    period: Duration,
    state: AtomicU8,
    health: Option<Arc<HealthMetrics>>,
}

impl<B: StorageBackend> PersistenceTimer<B> {
    pub fn new(
        backend: Arc<B>,
        workers: Vec<Arc<Worker<B::Dao>>>,
        initial_delay: Duration,
        period: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            backend,
            workers,
            initial_delay,
            period,
            state: AtomicU8::new(TimerState::Idle as u8),
            health,
        }
    }

    pub fn state(&self) -> TimerState {
        if self.state.load(Ordering::Acquire) == TimerState::Running as u8 {
            TimerState::Running
        } else {
            TimerState::Idle
        }
    }

    /// Spawns the timer task. On cancellation it runs one last tick so
    /// buffered aggregates reach storage.
    pub fn spawn(self: &Arc<Self>, ctx: CancellationToken) -> JoinHandle<()> {
        let timer = Arc::clone(self);
        tokio::spawn(async move { timer.run(ctx).await })
    }

    async fn run(&self, ctx: CancellationToken) {
        let start = tokio::time::Instant::now() + self.initial_delay;
        let mut interval = tokio::time::interval_at(start, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            initial_delay = ?self.initial_delay,
            period = ?self.period,
            workers = self.workers.len(),
            backend = self.backend.name(),
            "persistence timer started",
        );

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,

                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        // Final flush.
        let report = self.tick().await;
        tracing::info!(
            submitted = report.submitted,
            skipped = report.skipped,
            "persistence timer stopped",
        );
    }

    /// Runs one flush-merge-persist cycle.
    pub async fn tick(&self) -> TickReport {
        self.state
            .store(TimerState::Running as u8, Ordering::Release);
        let started = Instant::now();
        let mut report = TickReport::default();

        // 1. Swap every window, skipping workers still holding a buffer.
        let mut held = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            match worker.flush_and_switch() {
                Ok(buffer) => held.push((worker, buffer)),
                Err(e) => {
                    tracing::warn!(
                        role = %worker.role().name,
                        worker = worker.index(),
                        error = %e,
                        "skipping flush",
                    );
                    if let Some(health) = &self.health {
                        health
                            .flush_skipped
                            .with_label_values(&[&worker.role().name])
                            .inc();
                    }
                    report.skipped += 1;
                }
            }
        }
        report.swapped = held.len();

        // 2. Build one global batch.
        let mut batch = Vec::new();
        for (worker, buffer) in &held {
            match worker.build_batch_collection(buffer).await {
                Ok(collection) => {
                    report.inserts += collection.inserts;
                    report.updates += collection.updates;
                    report.dropped += collection.dropped;
                    batch.extend(collection.requests);
                }
                Err(e) => {
                    tracing::error!(
                        role = %worker.role().name,
                        worker = worker.index(),
                        records = buffer.len(),
                        error = format!("{e:#}"),
                        "aborting worker collection",
                    );
                    self.count_error("get");
                    report.aborted += 1;
                }
            }
        }

        let prepare_elapsed = started.elapsed();
        self.record_prepare(prepare_elapsed, &report);

        // 3. Submit.
        report.submitted = batch.len();
        if !batch.is_empty() {
            let execute_started = Instant::now();
            let result = self.backend.batch_persistence(batch).await;
            let execute_elapsed = execute_started.elapsed();

            if let Some(health) = &self.health {
                health
                    .persistence_execute_duration
                    .observe(execute_elapsed.as_secs_f64());
                health
                    .persistence_batch_size
                    .observe(report.submitted as f64);
            }

            match result {
                Ok(()) => {
                    tracing::debug!(
                        requests = report.submitted,
                        inserts = report.inserts,
                        updates = report.updates,
                        elapsed = ?execute_elapsed,
                        "persisted batch",
                    );
                }
                Err(e) => {
                    tracing::error!(
                        backend = self.backend.name(),
                        requests = report.submitted,
                        error = format!("{e:#}"),
                        "batch persistence failed, dropping tick data",
                    );
                    self.count_error("submit");
                    report.failed = true;
                }
            }
        }

        // 4. Always release.
        for (worker, buffer) in held {
            worker.release(buffer);
        }

        if let Some(health) = &self.health {
            health
                .persistence_tick_duration
                .observe(started.elapsed().as_secs_f64());
            health.persistence_ticks.inc();
        }

        self.state.store(TimerState::Idle as u8, Ordering::Release);
        report
    }

    fn record_prepare(&self, elapsed: Duration, report: &TickReport) {
        if let Some(health) = &self.health {
            health
                .persistence_prepare_duration
                .observe(elapsed.as_secs_f64());
            health
                .persistence_requests
                .with_label_values(&["insert"])
                .inc_by(report.inserts as f64);
            health
                .persistence_requests
                .with_label_values(&["update"])
                .inc_by(report.updates as f64);
        }
    }

    fn count_error(&self, stage: &str) {
        if let Some(health) = &self.health {
            health
                .persistence_errors
                .with_label_values(&[stage])
                .inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attribute, AttributeSchema, AttributeType, MergeOperation, Record, Value};
    use crate::storage::memory::MemoryBackend;
    use crate::worker::{InboundQueue, OverflowPolicy, PersistenceStrategy, Role, SelectorKind};

    fn role(name: &str, persistence: PersistenceStrategy) -> Arc<Role> {
        let schema = AttributeSchema::new(
            name,
            1,
            vec![
                Attribute::new("entity", AttributeType::String, MergeOperation::Non),
                Attribute::new("calls", AttributeType::Int64, MergeOperation::Sum),
            ],
        )
        .expect("schema");
        Arc::new(Role::new(
            name,
            schema,
            persistence,
            SelectorKind::HashCode,
            1,
        ))
    }

    fn worker(
        backend: &MemoryBackend,
        role: Arc<Role>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Arc<Worker<<MemoryBackend as StorageBackend>::Dao>> {
        let dao = backend.dao(Arc::clone(&role.schema)).expect("dao");
        let queue = Arc::new(InboundQueue::new(
            16,
            OverflowPolicy::DropNewest,
            Duration::ZERO,
        ));
        Arc::new(Worker::new(role, 0, queue, dao, health))
    }

    fn calls(id: &str, n: i64) -> Record {
        Record::new(id, vec![Value::from(id), Value::Int64(n)])
    }

    fn timer(
        backend: &MemoryBackend,
        workers: Vec<Arc<Worker<<MemoryBackend as StorageBackend>::Dao>>>,
        health: Option<Arc<HealthMetrics>>,
    ) -> PersistenceTimer<MemoryBackend> {
        PersistenceTimer::new(
            Arc::new(backend.clone()),
            workers,
            Duration::from_secs(1),
            Duration::from_secs(3),
            health,
        )
    }

    #[tokio::test]
    async fn test_tick_merges_across_ticks() {
        let backend = MemoryBackend::new();
        let w = worker(&backend, role("metric", PersistenceStrategy::MergeOnWrite), None);
        let timer = timer(&backend, vec![Arc::clone(&w)], None);

        w.absorb(calls("A", 2));
        let first = timer.tick().await;
        assert_eq!((first.inserts, first.updates), (1, 0));

        w.absorb(calls("A", 3));
        let second = timer.tick().await;
        assert_eq!((second.inserts, second.updates), (0, 1));

        assert_eq!(backend.record("metric", "A"), Some(calls("A", 5)));
        assert_eq!(timer.state(), TimerState::Idle);
    }

    #[tokio::test]
    async fn test_empty_tick_submits_nothing() {
        let backend = MemoryBackend::new();
        let w = worker(&backend, role("metric", PersistenceStrategy::MergeOnWrite), None);
        let timer = timer(&backend, vec![w], None);

        let report = timer.tick().await;
        assert_eq!(report.submitted, 0);
        assert_eq!(backend.batches(), 0);
    }

    #[tokio::test]
    async fn test_held_worker_is_skipped_and_others_flush() {
        let backend = MemoryBackend::new();
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let stuck = worker(&backend, role("stuck", PersistenceStrategy::InsertOnly), None);
        let free = worker(&backend, role("free", PersistenceStrategy::InsertOnly), None);
        let timer = timer(
            &backend,
            vec![Arc::clone(&stuck), Arc::clone(&free)],
            Some(Arc::clone(&health)),
        );

        // Simulate a previous flush that never released.
        stuck.absorb(calls("S", 1));
        let leaked = stuck.flush_and_switch().expect("swap");
        stuck.absorb(calls("S2", 1));
        free.absorb(calls("F", 1));

        let report = timer.tick().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.swapped, 1);
        assert_eq!(backend.len("free"), 1);
        assert_eq!(backend.len("stuck"), 0);
        assert_eq!(
            health.flush_skipped.with_label_values(&["stuck"]).get(),
            1.0
        );

        // Data buffered while skipped is flushed once the buffer is back.
        stuck.release(leaked);
        timer.tick().await;
        assert_eq!(backend.record("stuck", "S2"), Some(calls("S2", 1)));
    }

    #[tokio::test]
    async fn test_submit_failure_still_releases() {
        let backend = MemoryBackend::new();
        let w = worker(&backend, role("metric", PersistenceStrategy::InsertOnly), None);
        let timer = timer(&backend, vec![Arc::clone(&w)], None);

        backend.fail_writes(true);
        w.absorb(calls("A", 1));
        let report = timer.tick().await;
        assert!(report.failed);
        assert!(!w.window().is_holding());

        // Lost data is not retried on the next tick.
        backend.fail_writes(false);
        let report = timer.tick().await;
        assert_eq!(report.submitted, 0);
        assert_eq!(backend.len("metric"), 0);
    }

    #[tokio::test]
    async fn test_get_failure_aborts_only_that_worker() {
        let backend = MemoryBackend::new();
        let merging = worker(&backend, role("merging", PersistenceStrategy::MergeOnWrite), None);
        let appending = worker(&backend, role("appending", PersistenceStrategy::InsertOnly), None);
        let timer = timer(
            &backend,
            vec![Arc::clone(&merging), Arc::clone(&appending)],
            None,
        );

        backend.fail_reads(true);
        merging.absorb(calls("M", 1));
        appending.absorb(calls("A", 1));

        let report = timer.tick().await;
        assert_eq!(report.aborted, 1);
        assert_eq!(report.submitted, 1);
        assert_eq!(backend.len("appending"), 1);
        assert!(!merging.window().is_holding());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_runs_final_tick_on_cancel() {
        let backend = MemoryBackend::new();
        let w = worker(&backend, role("metric", PersistenceStrategy::InsertOnly), None);
        let timer = Arc::new(timer(&backend, vec![Arc::clone(&w)], None));

        let ctx = CancellationToken::new();
        let task = timer.spawn(ctx.clone());

        w.absorb(calls("A", 1));
        ctx.cancel();
        task.await.expect("join");

        assert_eq!(backend.len("metric"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_periodically() {
        let backend = MemoryBackend::new();
        let w = worker(&backend, role("metric", PersistenceStrategy::InsertOnly), None);
        let timer = Arc::new(timer(&backend, vec![Arc::clone(&w)], None));

        let ctx = CancellationToken::new();
        let task = timer.spawn(ctx.clone());

        w.absorb(calls("A", 1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(backend.len("metric"), 1);

        w.absorb(calls("B", 1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(backend.len("metric"), 2);

        ctx.cancel();
        task.await.expect("join");
    }
}
