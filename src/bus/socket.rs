//! Unix socket client for the message bus.
//!
//! One connection carries every method call, match-rule registration and
//! notification. Frames are [`BusFrame`]s encoded as length-prefixed JSON.
//! A reader task demultiplexes replies to waiting callers by serial and
//! forwards notifications into the raw signal channel.

use super::{RawSignal, Transport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use vmorch_protocol::{decode_body, encode_body, encode_message, BusFrame, MatchRule, MAX_FRAME_SIZE};

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>>>>>>;

/// Bus client over a Unix socket.
pub struct SocketTransport {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    pending: PendingReplies,
    next_serial: AtomicU64,
    reader: JoinHandle<()>,
}

impl SocketTransport {
    /// Connect to the bus.
    ///
    /// Returns the transport and the channel notifications are delivered on.
    pub async fn connect(
        socket_path: impl AsRef<Path>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RawSignal>)> {
        let path = socket_path.as_ref();
        let stream = UnixStream::connect(path).await.map_err(|e| {
            Error::transport(format!("connect to {}", path.display()), e.to_string())
        })?;

        tracing::debug!(socket = %path.display(), "connected to bus");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream) -> (Arc<Self>, mpsc::UnboundedReceiver<RawSignal>) {
        let (read_half, write_half) = stream.into_split();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));

        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&pending), signal_tx));

        let transport = Arc::new(Self {
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            pending,
            next_serial: AtomicU64::new(1),
            reader,
        });
        (transport, signal_rx)
    }

    /// Send a frame and wait for the reply carrying the same serial.
    async fn roundtrip<F>(&self, operation: &str, build: F) -> Result<Vec<u8>>
    where
        F: FnOnce(u64) -> BusFrame,
    {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let data = encode_message(&build(serial))
            .map_err(|e| Error::transport(operation, format!("encode frame: {}", e)))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(serial, tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            serial,
        };

        // Spawned so an abandoned call still writes its whole frame.
        let writer = Arc::clone(&self.writer);
        let written = tokio::spawn(async move {
            let mut writer = writer.lock().await;
            writer.write_all(&data).await
        })
        .await
        .map_err(|e| Error::transport(operation, format!("send frame: {}", e)))?;
        if let Err(e) = written {
            return Err(Error::transport(operation, format!("send frame: {}", e)));
        }

        rx.await
            .map_err(|_| Error::transport(operation, "connection closed before reply"))?
    }
}

/// Drops the reply slot of a call that finished or was abandoned.
struct PendingGuard {
    pending: PendingReplies,
    serial: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.serial);
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn call(&self, destination: &str, method: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let operation = format!("call {}.{}", destination, method);
        self.roundtrip(&operation, |serial| BusFrame::Call {
            serial,
            destination: destination.to_string(),
            method: method.to_string(),
            body: encode_body(&body),
        })
        .await
    }

    async fn add_match(&self, rule: &MatchRule) -> Result<()> {
        self.roundtrip("add match", |serial| BusFrame::AddMatch {
            serial,
            rule: rule.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn remove_match(&self, rule: &MatchRule) -> Result<()> {
        self.roundtrip("remove match", |serial| BusFrame::RemoveMatch {
            serial,
            rule: rule.clone(),
        })
        .await
        .map(|_| ())
    }
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<BusFrame> {
    let mut header = [0u8; 4];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::transport("read header", e.to_string()))?;

    let len = u32::from_be_bytes(header) as usize;

    // Validate frame size to prevent OOM from malicious/buggy peers
    if len > MAX_FRAME_SIZE as usize {
        return Err(Error::transport(
            "validate frame",
            format!("frame too large: {} bytes (max: {} bytes)", len, MAX_FRAME_SIZE),
        ));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::transport("read payload", e.to_string()))?;

    serde_json::from_slice(&buf).map_err(|e| Error::transport("parse frame", e.to_string()))
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    pending: PendingReplies,
    signals: mpsc::UnboundedSender<RawSignal>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "bus connection closed");
                break;
            }
        };

        match frame {
            BusFrame::Reply { serial, body } => {
                let reply = decode_body(&body)
                    .map_err(|e| Error::transport("decode reply body", e.to_string()));
                complete(&pending, serial, reply);
            }
            BusFrame::Error { serial, message } => {
                complete(&pending, serial, Err(Error::transport("bus reply", message)));
            }
            BusFrame::Signal {
                interface,
                path,
                member,
                payload,
            } => {
                // An undecodable body is forwarded empty so waiters see a decode error.
                let payload = decode_body(&payload).unwrap_or_else(|e| {
                    tracing::warn!(signal = %member, error = %e, "undecodable signal body");
                    Vec::new()
                });
                let _ = signals.send(RawSignal {
                    interface,
                    path,
                    member,
                    payload,
                });
            }
            other => {
                tracing::warn!(frame = ?other, "unexpected frame from bus");
            }
        }
    }

    // Fail everything still waiting; dropping `signals` closes the notification stream.
    for (_, tx) in pending.lock().drain() {
        let _ = tx.send(Err(Error::transport("bus connection", "connection closed")));
    }
}

fn complete(pending: &PendingReplies, serial: u64, reply: Result<Vec<u8>>) {
    match pending.lock().remove(&serial) {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => tracing::debug!(serial, "reply for abandoned or unknown serial"),
    }
}
