use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::codec::{RemoteMessage, MAX_FRAME_LEN};
use crate::export::health::HealthMetrics;
use crate::worker::WorkerRegistry;

/// Accepts frames forwarded by peer nodes and dispatches them to local
/// workers.
pub struct RemoteServer {
    addr: String,
    registry: Arc<WorkerRegistry>,
    health: Option<Arc<HealthMetrics>>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl RemoteServer {
    pub fn new(
        addr: impl Into<String>,
        registry: Arc<WorkerRegistry>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            addr: addr.into(),
            registry,
            health,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address, which differs from the configured one for port 0.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let registry = Arc::clone(&self.registry);
        let health = self.health.clone();

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "remote receiver started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let registry = Arc::clone(&registry);
                            let health = health.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, &registry, health.as_deref(), cancel).await {
                                    tracing::warn!(peer = %peer, error = format!("{e:#}"), "peer connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accepting peer connection");
                        }
                    },
                }
            }

            tracing::info!("remote receiver stopped");
        });

        Ok(local_addr)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    registry: &WorkerRegistry,
    health: Option<&HealthMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut frame = Vec::new();

    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            len = reader.read_u32_le() => match len {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e).context("reading frame length"),
            },
        };

        if len > MAX_FRAME_LEN {
            bail!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit");
        }

        frame.resize(len, 0);
        reader
            .read_exact(&mut frame)
            .await
            .context("reading frame body")?;

        dispatch(&frame, registry, health).await;
    }
}

/// Decodes one frame and hands the record to a local worker. Failures
/// affect only this frame.
async fn dispatch(frame: &[u8], registry: &WorkerRegistry, health: Option<&HealthMetrics>) {
    let reject = |reason: &dyn std::fmt::Display| {
        tracing::warn!(error = %reason, "rejecting peer frame");
        if let Some(health) = health {
            health.remote_decode_errors.inc();
        }
    };

    let message = match RemoteMessage::decode(frame) {
        Ok(message) => message,
        Err(e) => return reject(&e),
    };

    let Some(schema) = registry.role(&message.role).map(|r| Arc::clone(&r.schema)) else {
        return reject(&format!("unknown role {}", message.role));
    };

    let role = message.role.clone();
    let record = match message.into_record(&schema) {
        Ok(record) => record,
        Err(e) => return reject(&e),
    };

    if let Some(health) = health {
        health.remote_frames_received.inc();
    }

    if let Err(e) = registry.tell_local(&role, record).await {
        tracing::warn!(role = %role, error = %e, "dispatching peer record");
    }
}
