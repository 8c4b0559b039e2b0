use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::InboundQueue;
use super::window::{HeldBuffer, Window, WindowError};
use super::{PersistenceStrategy, Role};
use crate::export::health::HealthMetrics;
use crate::model::{merge_into, Record};
use crate::storage::StorageDao;

/// Maximum number of queued records merged per consumer wake-up.
const BATCH_SIZE: usize = 256;

/// Write requests built from one drained buffer.
#[derive(Debug)]
pub struct BatchCollection<R> {
    pub requests: Vec<R>,
    pub inserts: usize,
    pub updates: usize,
    /// Records dropped because merging with the stored value or building
    /// their request failed.
    pub dropped: usize,
}

impl<R> BatchCollection<R> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            requests: Vec::with_capacity(capacity),
            inserts: 0,
            updates: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// One aggregation actor: a queue, a consumer task and a window.
pub struct Worker<D: StorageDao> {
    role: Arc<Role>,
    index: usize,
    window: Window,
    queue: Arc<InboundQueue>,
    dao: D,
    health: Option<Arc<HealthMetrics>>,
}

impl<D: StorageDao> Worker<D> {
    pub fn new(
        role: Arc<Role>,
        index: usize,
        queue: Arc<InboundQueue>,
        dao: D,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let window = Window::with_capacity(Arc::clone(&role.schema), queue.capacity().min(4096));
        Self {
            role,
            index,
            window,
            queue,
            dao,
            health,
        }
    }

    pub fn role(&self) -> &Arc<Role> {
        &self.role
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn queue(&self) -> &Arc<InboundQueue> {
        &self.queue
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn dao(&self) -> &D {
        &self.dao
    }

    /// Spawns the consumer task.
    ///
    /// The task merges queued records into the active buffer until `ctx`
    /// is cancelled, then closes the queue and merges what is left.
    pub fn spawn(self: &Arc<Self>, ctx: CancellationToken) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run(ctx).await })
    }

    async fn run(&self, ctx: CancellationToken) {
        tracing::debug!(
            role = %self.role.name,
            worker = self.index,
            "worker consumer started",
        );

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,

                next = self.queue.pop() => {
                    let Some(record) = next else {
                        break;
                    };
                    self.absorb(record);

                    // Drain up to BATCH_SIZE queued records per wakeup.
                    for _ in 1..BATCH_SIZE {
                        match self.queue.try_pop() {
                            Some(record) => self.absorb(record),
                            None => break,
                        }
                    }

                    self.observe_queue();
                }
            }
        }

        self.queue.close();
        let mut remaining = 0usize;
        while let Some(record) = self.queue.try_pop() {
            self.absorb(record);
            remaining += 1;
        }
        self.observe_queue();

        tracing::debug!(
            role = %self.role.name,
            worker = self.index,
            remaining,
            "worker consumer stopped",
        );
    }

    /// Merges one record into the active buffer.
    pub fn absorb(&self, record: Record) {
        let id = record.id().to_string();
        if let Err(e) = self.window.put(record) {
            tracing::warn!(
                role = %self.role.name,
                schema = self.role.schema.name(),
                id = %id,
                error = %e,
                "dropping record that does not merge with buffered state",
            );
            self.count_merge_error("buffer");
        }
    }

    /// Swaps the window and hands the previously active buffer to the
    /// caller. Only the persistence timer calls this.
    pub fn flush_and_switch(&self) -> Result<HeldBuffer, WindowError> {
        self.window.swap_and_hold()
    }

    /// Releases a buffer obtained from [`Worker::flush_and_switch`].
    pub fn release(&self, held: HeldBuffer) {
        self.window.release(held);
    }

    /// Drains `held` and turns every record into a storage request.
    ///
    /// Merge-on-write roles read the stored record first: absent ids
    /// become inserts, present ids are merged and become updates. A read
    /// failure aborts the whole collection; a failed merge drops only
    /// that record.
    pub async fn build_batch_collection(
        &self,
        held: &HeldBuffer,
    ) -> Result<BatchCollection<D::Request>> {
        let records = self.window.drain(held);
        let mut collection = BatchCollection::with_capacity(records.len());

        match self.role.persistence {
            PersistenceStrategy::InsertOnly => {
                for record in records {
                    self.push_insert(&mut collection, &record);
                }
            }
            PersistenceStrategy::MergeOnWrite => {
                for record in records {
                    let stored = self.dao.get(record.id()).await.with_context(|| {
                        format!(
                            "reading stored {} record {}",
                            self.role.schema.name(),
                            record.id()
                        )
                    })?;

                    match stored {
                        None => self.push_insert(&mut collection, &record),
                        Some(mut existing) => {
                            match merge_into(&self.role.schema, &mut existing, &record) {
                                Ok(()) => self.push_update(&mut collection, &existing),
                                Err(e) => {
                                    tracing::warn!(
                                        role = %self.role.name,
                                        schema = self.role.schema.name(),
                                        id = record.id(),
                                        error = %e,
                                        "dropping record that does not merge with stored state",
                                    );
                                    self.count_merge_error("persist");
                                    collection.dropped += 1;
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(collection)
    }

    fn push_insert(&self, collection: &mut BatchCollection<D::Request>, record: &Record) {
        match self.dao.prepare_batch_insert(record) {
            Ok(request) => {
                collection.requests.push(request);
                collection.inserts += 1;
            }
            Err(e) => self.prepare_failed(collection, record, &e),
        }
    }

    fn push_update(&self, collection: &mut BatchCollection<D::Request>, record: &Record) {
        match self.dao.prepare_batch_update(record) {
            Ok(request) => {
                collection.requests.push(request);
                collection.updates += 1;
            }
            Err(e) => self.prepare_failed(collection, record, &e),
        }
    }

    fn prepare_failed(
        &self,
        collection: &mut BatchCollection<D::Request>,
        record: &Record,
        err: &anyhow::Error,
    ) {
        tracing::error!(
            role = %self.role.name,
            id = record.id(),
            error = format!("{err:#}"),
            "preparing storage request",
        );
        if let Some(health) = &self.health {
            health
                .persistence_errors
                .with_label_values(&["prepare"])
                .inc();
        }
        collection.dropped += 1;
    }

    fn count_merge_error(&self, stage: &str) {
        if let Some(health) = &self.health {
            health
                .merge_errors
                .with_label_values(&[&self.role.name, stage])
                .inc();
        }
    }

    fn observe_queue(&self) {
        if let Some(health) = &self.health {
            health
                .worker_queue_length
                .with_label_values(&[&self.role.name, &self.index.to_string()])
                .set(self.queue.len() as f64);
        }
    }
}
