//! Role routing: role name to local worker pool or owning peer node.
//!
//! The route table is read on every `tell` and replaced wholesale on the
//! rare ownership change, so it lives behind an [`ArcSwap`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use thiserror::Error;

use super::queue::{InboundQueue, Pushed, QueueError};
use super::selector::Selector;
use super::Role;
use crate::export::health::HealthMetrics;
use crate::model::{Record, SchemaError};
use crate::remote::{RemoteClient, RemoteMessage, WireError};

/// Outcome of a successful [`WorkerRegistry::tell`].
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on a local worker.
    Enqueued,
    /// Queued after evicting the oldest queued record, which was lost.
    Displaced,
    /// Not queued because of backpressure.
    Dropped(QueueError),
    /// Sent to the node that owns the role.
    Forwarded,
}

#[derive(Error, Debug)]
pub enum TellError {
    #[error("no route registered for role {role}")]
    UnknownRole { role: String },

    #[error("record {id} rejected by role {role}")]
    Schema {
        role: String,
        id: String,
        #[source]
        source: SchemaError,
    },

    #[error("encoding {role} record for forwarding")]
    Encode {
        role: String,
        #[source]
        source: WireError,
    },

    #[error("forwarding {role} record to {addr}")]
    Forward {
        role: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Who processes a role's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Local,
    /// Peer node listening at `host:port`.
    Remote(String),
}

struct LocalPool {
    queues: Vec<Arc<InboundQueue>>,
    selector: Selector,
}

struct RoleEntry {
    role: Arc<Role>,
    pool: Arc<LocalPool>,
    remote: Option<Arc<RemoteClient>>,
}

pub struct WorkerRegistry {
    routes: ArcSwap<HashMap<String, Arc<RoleEntry>>>,
    clients: Mutex<HashMap<String, Arc<RemoteClient>>>,
    connect_timeout: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl WorkerRegistry {
    pub fn new(connect_timeout: Duration, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            routes: ArcSwap::from_pointee(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            connect_timeout,
            health,
        }
    }

    /// Registers the local worker queues of `role`. The role starts out
    /// locally owned.
    pub fn register(&self, role: Arc<Role>, queues: Vec<Arc<InboundQueue>>) {
        let entry = Arc::new(RoleEntry {
            pool: Arc::new(LocalPool {
                queues,
                selector: Selector::new(role.selector),
            }),
            role,
            remote: None,
        });

        self.routes.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(entry.role.name.clone(), Arc::clone(&entry));
            next
        });
    }

    /// Moves ownership of `role` to this node or to a peer.
    pub fn reassign(&self, role: &str, owner: Owner) -> Result<(), TellError> {
        let remote = match &owner {
            Owner::Local => None,
            Owner::Remote(addr) => Some(self.client(addr)),
        };

        let mut found = false;
        self.routes.rcu(|current| {
            let mut next = HashMap::clone(current);
            found = false;
            if let Some(entry) = current.get(role) {
                found = true;
                next.insert(
                    role.to_string(),
                    Arc::new(RoleEntry {
                        role: Arc::clone(&entry.role),
                        pool: Arc::clone(&entry.pool),
                        remote: remote.clone(),
                    }),
                );
            }
            next
        });

        if !found {
            return Err(TellError::UnknownRole {
                role: role.to_string(),
            });
        }

        tracing::info!(role, owner = ?owner, "role ownership changed");
        Ok(())
    }

    pub fn owner(&self, role: &str) -> Option<Owner> {
        self.routes.load().get(role).map(|entry| match &entry.remote {
            Some(client) => Owner::Remote(client.addr().to_string()),
            None => Owner::Local,
        })
    }

    pub fn role(&self, name: &str) -> Option<Arc<Role>> {
        self.routes
            .load()
            .get(name)
            .map(|entry| Arc::clone(&entry.role))
    }

    /// Registered roles sorted by name.
    pub fn roles(&self) -> Vec<Arc<Role>> {
        let mut roles: Vec<_> = self
            .routes
            .load()
            .values()
            .map(|entry| Arc::clone(&entry.role))
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        roles
    }

    /// Routes `record` to the worker that owns its id.
    ///
    /// Backpressure is reported as [`Delivery::Dropped`] or
    /// [`Delivery::Displaced`], never as an error.
    pub async fn tell(&self, role: &str, record: Record) -> Result<Delivery, TellError> {
        let entry = self.lookup(role)?;
        check(&entry, &record)?;

        match &entry.remote {
            Some(client) => self.forward(&entry, client, &record).await,
            None => Ok(self.enqueue(&entry, record).await),
        }
    }

    /// Routes `record` to a local worker even if the role is owned
    /// elsewhere. Used for records received from peers so a frame is
    /// never forwarded twice.
    pub async fn tell_local(&self, role: &str, record: Record) -> Result<Delivery, TellError> {
        let entry = self.lookup(role)?;
        check(&entry, &record)?;
        Ok(self.enqueue(&entry, record).await)
    }

    fn lookup(&self, role: &str) -> Result<Arc<RoleEntry>, TellError> {
        match self.routes.load().get(role) {
            Some(entry) => Ok(Arc::clone(entry)),
            None => {
                if let Some(health) = &self.health {
                    health.routing_errors.inc();
                }
                Err(TellError::UnknownRole {
                    role: role.to_string(),
                })
            }
        }
    }

    async fn enqueue(&self, entry: &RoleEntry, record: Record) -> Delivery {
        let pool = &entry.pool;
        let index = pool.selector.select(record.id(), pool.queues.len());
        let queue = &pool.queues[index];
        let id = record.id().to_string();

        match queue.push(record).await {
            Ok(Pushed::Enqueued) => {
                self.count_received(&entry.role.name);
                Delivery::Enqueued
            }
            Ok(Pushed::Displaced(old)) => {
                tracing::warn!(
                    role = %entry.role.name,
                    worker = index,
                    id = old.id(),
                    "queue full, evicted oldest record",
                );
                self.count_received(&entry.role.name);
                self.count_dropped(&entry.role.name, "displaced");
                Delivery::Displaced
            }
            Err(e) => {
                tracing::warn!(
                    role = %entry.role.name,
                    worker = index,
                    id = %id,
                    error = %e,
                    "dropping record",
                );
                self.count_dropped(&entry.role.name, e.reason());
                Delivery::Dropped(e)
            }
        }
    }

    async fn forward(
        &self,
        entry: &RoleEntry,
        client: &RemoteClient,
        record: &Record,
    ) -> Result<Delivery, TellError> {
        let name = &entry.role.name;
        let message = RemoteMessage::from_record(name, &entry.role.schema, record).map_err(
            |source| TellError::Encode {
                role: name.clone(),
                source,
            },
        )?;

        client
            .send(&message)
            .await
            .map_err(|source| TellError::Forward {
                role: name.clone(),
                addr: client.addr().to_string(),
                source,
            })?;

        if let Some(health) = &self.health {
            health.records_forwarded.with_label_values(&[name]).inc();
        }
        Ok(Delivery::Forwarded)
    }

    fn client(&self, addr: &str) -> Arc<RemoteClient> {
        let mut clients = self.clients.lock();
        Arc::clone(
            clients
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(RemoteClient::new(addr, self.connect_timeout))),
        )
    }

    fn count_received(&self, role: &str) {
        if let Some(health) = &self.health {
            health.records_received.with_label_values(&[role]).inc();
        }
    }

    fn count_dropped(&self, role: &str, reason: &str) {
        if let Some(health) = &self.health {
            health
                .records_dropped
                .with_label_values(&[role, reason])
                .inc();
        }
    }
}

fn check(entry: &RoleEntry, record: &Record) -> Result<(), TellError> {
    entry
        .role
        .schema
        .check(record)
        .map_err(|source| TellError::Schema {
            role: entry.role.name.clone(),
            id: record.id().to_string(),
            source,
        })
}
