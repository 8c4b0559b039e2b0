//! Explicit wiring of one engine instance.
//!
//! Everything the engine needs (backend, registry, workers, timer,
//! remote receiver) is built here from configuration and owned by an
//! [`EngineContext`]. Nothing is global, so tests can run several engines
//! side by side.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::persistence::PersistenceTimer;
use crate::remote::RemoteServer;
use crate::storage::StorageBackend;
use crate::worker::{InboundQueue, Owner, Role, Worker, WorkerRegistry};

pub struct EngineContext<B: StorageBackend> {
    backend: Arc<B>,
    roles: Vec<Arc<Role>>,
    registry: Arc<WorkerRegistry>,
    workers: Vec<Arc<Worker<B::Dao>>>,
    timer: Arc<PersistenceTimer<B>>,
    remote: Option<RemoteServer>,
    create_schema: bool,
    worker_cancel: CancellationToken,
    timer_cancel: CancellationToken,
    worker_tasks: Vec<JoinHandle<()>>,
    timer_task: Option<JoinHandle<()>>,
}

impl<B: StorageBackend> EngineContext<B> {
    /// Builds workers, routes and the timer for every configured role.
    /// Nothing runs until [`EngineContext::start`].
    pub fn build(cfg: &Config, backend: B, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let backend = Arc::new(backend);
        let registry = Arc::new(WorkerRegistry::new(
            cfg.cluster.connect_timeout,
            health.clone(),
        ));

        let roles: Vec<Arc<Role>> = cfg
            .resolve_roles()
            .context("resolving roles")?
            .into_iter()
            .map(Arc::new)
            .collect();

        let mut workers = Vec::new();
        for role in &roles {
            let mut queues = Vec::with_capacity(role.pool_size);
            for index in 0..role.pool_size {
                let queue = Arc::new(InboundQueue::new(
                    cfg.workers.queue_size,
                    cfg.workers.overflow,
                    cfg.workers.block_timeout,
                ));
                let dao = backend
                    .dao(Arc::clone(&role.schema))
                    .with_context(|| format!("creating DAO for role {}", role.name))?;

                workers.push(Arc::new(Worker::new(
                    Arc::clone(role),
                    index,
                    Arc::clone(&queue),
                    dao,
                    health.clone(),
                )));
                queues.push(queue);
            }
            registry.register(Arc::clone(role), queues);
        }

        for (role, addr) in &cfg.cluster.remote_roles {
            registry
                .reassign(role, Owner::Remote(addr.clone()))
                .with_context(|| format!("assigning role {role} to {addr}"))?;
        }

        let timer = Arc::new(PersistenceTimer::new(
            Arc::clone(&backend),
            workers.clone(),
            cfg.timer.initial_delay,
            cfg.timer.period,
            health.clone(),
        ));

        let remote = (!cfg.cluster.listen.is_empty()).then(|| {
            RemoteServer::new(cfg.cluster.listen.clone(), Arc::clone(&registry), health)
        });

        Ok(Self {
            backend,
            roles,
            registry,
            workers,
            timer,
            remote,
            create_schema: cfg.storage.create_schema,
            worker_cancel: CancellationToken::new(),
            timer_cancel: CancellationToken::new(),
            worker_tasks: Vec::new(),
            timer_task: None,
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn workers(&self) -> &[Arc<Worker<B::Dao>>] {
        &self.workers
    }

    pub fn timer(&self) -> &Arc<PersistenceTimer<B>> {
        &self.timer
    }

    /// Connects storage, creates schemas when enabled, and spawns the
    /// worker consumers, the timer and the remote receiver.
    ///
    /// Returns the remote receiver's bound address when one is configured.
    pub async fn start(&mut self) -> Result<Option<SocketAddr>> {
        self.backend
            .start()
            .await
            .with_context(|| format!("starting {} backend", self.backend.name()))?;

        if self.create_schema {
            for role in &self.roles {
                self.backend
                    .ensure_schema(&role.schema)
                    .await
                    .with_context(|| format!("creating schema for role {}", role.name))?;
            }
        }

        for worker in &self.workers {
            self.worker_tasks
                .push(worker.spawn(self.worker_cancel.child_token()));
        }
        self.timer_task = Some(self.timer.spawn(self.timer_cancel.clone()));

        let remote_addr = match &self.remote {
            Some(server) => Some(server.start().await.context("starting remote receiver")?),
            None => None,
        };

        tracing::info!(
            backend = self.backend.name(),
            roles = self.roles.len(),
            workers = self.workers.len(),
            "aggregation engine started",
        );

        Ok(remote_addr)
    }

    /// Stops intake, lets every worker merge its remaining queue, then
    /// runs the timer's final flush.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(server) = &self.remote {
            server.stop().await?;
        }

        self.worker_cancel.cancel();
        for task in self.worker_tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }

        self.timer_cancel.cancel();
        if let Some(task) = self.timer_task.take() {
            task.await.context("joining persistence timer")?;
        }

        tracing::info!("aggregation engine stopped");
        Ok(())
    }
}
