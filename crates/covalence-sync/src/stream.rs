//! NDJSON transport over any byte stream (TCP, duplex pipes).
//!
//! Three tasks serve one connection: a writer draining encoded frames to the
//! socket, a reader decoding lines and answering pings, and a keepalive that
//! pings on an interval and drops the connection after `pong_timeout` of
//! silence. `send` blocks cooperatively while more than `outgoing_watermark`
//! bytes are queued but not yet written.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::codec::{encode_line, LineDecoder};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::messages::SyncMessage;
use crate::transport::{disconnected, ConnectionStatus, Transport};

/// Frames queued for the writer task, with their byte count.
#[derive(Clone)]
struct Outgoing {
    tx: mpsc::UnboundedSender<Bytes>,
    buffered: Arc<AtomicUsize>,
}

impl Outgoing {
    fn push(&self, frame: Bytes) -> Result<()> {
        self.buffered.fetch_add(frame.len(), Ordering::AcqRel);
        self.tx.send(frame).map_err(|_| SyncError::Closed)
    }
}

pub struct StreamTransport {
    outgoing: Outgoing,
    incoming: Mutex<mpsc::Receiver<SyncMessage>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    config: SyncConfig,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl StreamTransport {
    /// Serve `stream` on the current runtime.
    pub fn spawn<S>(stream: S, config: SyncConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (status, _) = watch::channel(ConnectionStatus::Connected);
        let status = Arc::new(status);
        let last_seen = Arc::new(StdMutex::new(Instant::now()));

        let outgoing = Outgoing {
            tx: frames_tx,
            buffered: Arc::new(AtomicUsize::new(0)),
        };

        let tasks = vec![
            tokio::spawn(write_loop(
                writer,
                frames_rx,
                outgoing.buffered.clone(),
                status.clone(),
            )),
            tokio::spawn(read_loop(
                reader,
                incoming_tx,
                outgoing.clone(),
                last_seen.clone(),
                status.clone(),
                config.max_line_bytes,
            )),
            tokio::spawn(keepalive_loop(
                outgoing.clone(),
                last_seen,
                status.clone(),
                config.clone(),
            )),
        ];

        Self {
            outgoing,
            incoming: Mutex::new(incoming_rx),
            status,
            config,
            tasks: StdMutex::new(tasks),
        }
    }

    /// Dial a TCP peer.
    pub async fn connect(addr: impl ToSocketAddrs, config: SyncConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::spawn(stream, config))
    }

    /// Bytes handed to the writer but not yet written.
    pub fn buffered_bytes(&self) -> usize {
        self.outgoing.buffered.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&self, message: SyncMessage) -> Result<()> {
        let frame = encode_line(&message)?;
        loop {
            if !self.is_connected() {
                return Err(SyncError::Closed);
            }
            if self.buffered_bytes() <= self.config.outgoing_watermark {
                break;
            }
            tokio::time::sleep(self.config.poll_delay).await;
        }
        self.outgoing.push(frame)
    }

    async fn recv(&self) -> Result<Option<SyncMessage>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            message = incoming.recv() => Ok(message),
            _ = disconnected(self.status.subscribe()) => Ok(None),
        }
    }

    async fn close(&self) {
        self.status.send_replace(ConnectionStatus::Disconnected);
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    buffered: Arc<AtomicUsize>,
    status: Arc<watch::Sender<ConnectionStatus>>,
) {
    while let Some(frame) = frames.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        buffered.fetch_sub(frame.len(), Ordering::AcqRel);
        if let Err(e) = written {
            tracing::debug!(error = %e, "connection write failed");
            break;
        }
    }
    status.send_replace(ConnectionStatus::Disconnected);
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    incoming: mpsc::Sender<SyncMessage>,
    outgoing: Outgoing,
    last_seen: Arc<StdMutex<Instant>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    max_line_bytes: usize,
) {
    let mut decoder = LineDecoder::new(max_line_bytes);
    let mut buf = vec![0u8; 16 * 1024];

    'conn: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "connection read failed");
                break;
            }
        };
        *last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        decoder.push(&buf[..n]);

        loop {
            match decoder.next_message() {
                Ok(Some(SyncMessage::Ping)) => {
                    let pong = encode_line(&SyncMessage::Pong).and_then(|frame| outgoing.push(frame));
                    if pong.is_err() {
                        break 'conn;
                    }
                }
                Ok(Some(SyncMessage::Pong)) => {}
                Ok(Some(message)) => {
                    if incoming.send(message).await.is_err() {
                        break 'conn;
                    }
                }
                Ok(None) => break,
                Err(e) if decoder.pending() > max_line_bytes => {
                    tracing::warn!(error = %e, "dropping connection with oversized frame");
                    break 'conn;
                }
                Err(e) => tracing::warn!(error = %e, "skipping malformed frame"),
            }
        }
    }
    status.send_replace(ConnectionStatus::Disconnected);
}

async fn keepalive_loop(
    outgoing: Outgoing,
    last_seen: Arc<StdMutex<Instant>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    config: SyncConfig,
) {
    let mut ticks = tokio::time::interval(config.ping_interval);
    ticks.tick().await;
    loop {
        tokio::select! {
            _ = ticks.tick() => {}
            _ = disconnected(status.subscribe()) => return,
        }
        let silent_for = last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if silent_for > config.pong_timeout {
            tracing::info!(silent_ms = silent_for.as_millis() as u64, "peer stopped answering pings");
            status.send_replace(ConnectionStatus::Disconnected);
            return;
        }
        let ping = encode_line(&SyncMessage::Ping).and_then(|frame| outgoing.push(frame));
        if ping.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalence_core::CoValueId;
    use std::time::Duration;

    fn fast_config() -> SyncConfig {
        SyncConfig::default()
            .with_ping_interval(Duration::from_millis(20))
            .with_pong_timeout(Duration::from_millis(150))
            .with_poll_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let a = StreamTransport::spawn(a, fast_config());
        let b = StreamTransport::spawn(b, fast_config());
        let id = CoValueId::derive(b"v");

        a.send(SyncMessage::Done { id }).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(SyncMessage::Done { id }));

        // Keepalives never surface through recv, and answered pings keep the
        // connection up well past the timeout.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(a.is_connected());
        assert!(b.is_connected());

        b.send(SyncMessage::Done { id }).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Some(SyncMessage::Done { id }));
    }

    #[tokio::test]
    async fn test_silent_peer_is_disconnected() {
        let (a, _silent) = tokio::io::duplex(64 * 1024);
        let a = StreamTransport::spawn(a, fast_config());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!a.is_connected());
        assert_eq!(a.recv().await.unwrap(), None);
        assert!(a.send(SyncMessage::Ping).await.is_err());
    }

    #[tokio::test]
    async fn test_send_blocks_above_watermark() {
        let config = fast_config()
            .with_outgoing_watermark(256)
            .with_ping_interval(Duration::from_secs(60))
            .with_pong_timeout(Duration::from_secs(120));
        let (a, b) = tokio::io::duplex(64);
        let a = StreamTransport::spawn(a, config.clone());

        let big = SyncMessage::Load(covalence_core::KnownState {
            id: CoValueId::derive(b"big"),
            header: true,
            sessions: Default::default(),
        });
        // Nobody reads the other end, so the writer stalls once the pipe is full.
        for _ in 0..3 {
            a.send(big.clone()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.buffered_bytes() > 256);
        let blocked = tokio::time::timeout(Duration::from_millis(100), a.send(big.clone())).await;
        assert!(blocked.is_err());

        // Draining the pipe releases the sender.
        let b = StreamTransport::spawn(b, config);
        tokio::time::timeout(Duration::from_secs(5), a.send(big.clone()))
            .await
            .unwrap()
            .unwrap();
        for _ in 0..4 {
            assert_eq!(b.recv().await.unwrap(), Some(big.clone()));
        }
    }
}
