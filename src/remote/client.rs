use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::codec::{RemoteMessage, MAX_FRAME_LEN};

/// Forwards frames to one peer node over a lazily opened TCP stream.
///
/// The connection is dropped on any write error and reopened by the next
/// send, so a restarted peer is picked up without intervention.
pub struct RemoteClient {
    addr: String,
    connect_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl RemoteClient {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            stream: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one length-prefixed frame.
    pub async fn send(&self, message: &RemoteMessage) -> io::Result<()> {
        let body = message.encode();
        if body.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit", body.len()),
            ));
        }

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);

        let mut guard = self.stream.lock().await;
        // Out of the slot while writing: if this future is dropped midway,
        // the half-written stream is closed instead of being reused.
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        if let Err(e) = stream.write_all(&frame).await {
            tracing::debug!(peer = %self.addr, error = %e, "dropping broken peer connection");
            return Err(e);
        }

        *guard = Some(stream);
        Ok(())
    }

    /// True when an open connection is cached for the next send.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", self.addr),
                )
            })??;
        stream.set_nodelay(true)?;

        tracing::info!(peer = %self.addr, "connected to peer node");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::model::{Attribute, AttributeSchema, AttributeType, MergeOperation, Record, Value};

    fn message(payload: usize) -> RemoteMessage {
        let schema = Arc::new(
            AttributeSchema::new(
                "blob",
                1,
                vec![Attribute::new("data", AttributeType::Bytes, MergeOperation::Cover)],
            )
            .expect("schema"),
        );
        let record = Record::new("b-1", vec![Value::from(vec![7u8; payload])]);
        RemoteMessage::from_record("blob", &schema, &record).expect("message")
    }

    #[tokio::test]
    async fn test_send_keeps_connection_for_next_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut frames = 0;
            for _ in 0..2 {
                let len = stream.read_u32_le().await.expect("length");
                let mut body = vec![0u8; len as usize];
                stream.read_exact(&mut body).await.expect("body");
                RemoteMessage::decode(&body).expect("decode");
                frames += 1;
            }
            frames
        });

        let client = RemoteClient::new(addr.to_string(), Duration::from_secs(1));
        client.send(&message(16)).await.expect("first send");
        assert!(client.is_connected().await);
        client.send(&message(16)).await.expect("second send");

        assert_eq!(reader.await.expect("reader"), 2);
    }

    #[tokio::test]
    async fn test_cancelled_send_discards_partial_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        // Accept but never read, so a large frame cannot be fully written.
        let _peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let client = RemoteClient::new(addr.to_string(), Duration::from_secs(1));
        let big = message(15 * 1024 * 1024);
        let cancelled =
            tokio::time::timeout(Duration::from_millis(200), client.send(&big)).await;

        assert!(cancelled.is_err(), "send should still be blocked");
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_refused_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = RemoteClient::new(addr.to_string(), Duration::from_secs(1));
        assert!(client.send(&message(4)).await.is_err());
        assert!(!client.is_connected().await);
    }
}
