use crate::config::RallyConfig;
use crate::error::{RallyError, Result};
use crate::protocol::{RallyCodec, RallyMessage};
use crate::transport::listener::resolve;
use futures::SinkExt;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Inbound half of a connection, yielding decoded frames.
pub type FrameReader = FramedRead<OwnedReadHalf, RallyCodec>;

/// Outbound half of a connection, accepting frames to encode.
pub type FrameWriter = FramedWrite<OwnedWriteHalf, RallyCodec>;

/// Split a connected stream into framed read and write halves.
pub fn split_framed(stream: TcpStream, max_frame_bytes: usize) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    (
        FramedRead::new(read, RallyCodec::new(max_frame_bytes)),
        FramedWrite::new(write, RallyCodec::new(max_frame_bytes)),
    )
}

/// Cloneable handle that queues frames for a connection's writer task.
///
/// Frames queued from any number of handles go out in the order they were
/// queued. Once every handle is dropped the writer flushes and half-closes
/// the stream.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<RallyMessage>,
}

impl Outbound {
    /// Queue a frame. Fails only when the writer task has stopped.
    pub fn send(&self, msg: RallyMessage) -> Result<()> {
        self.tx.send(msg).map_err(|e| RallyError::ConnectionLost {
            reason: format!("writer stopped, dropped {} frame", e.0.name()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the task that owns `writer` and drains the returned queue into it.
///
/// The task ends on the first write error, or after a clean close once all
/// [`Outbound`] handles are gone.
pub fn spawn_writer(mut writer: FrameWriter, peer: String) -> (Outbound, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RallyMessage>();
    let task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let name = msg.name();
            if let Err(e) = writer.send(msg).await {
                tracing::warn!(peer = %peer, frame = name, error = %e, "frame write failed");
                return;
            }
            tracing::trace!(peer = %peer, frame = name, "frame sent");
        }
        // flush + shutdown(SHUT_WR)
        if let Err(e) = writer.close().await {
            tracing::debug!(peer = %peer, error = %e, "close after drain failed");
        }
    });
    (Outbound { tx }, task)
}

/// Connect to `endpoint`, retrying every resolved address until one accepts
/// or `config.connect_timeout` elapses.
pub async fn connect_with_retry(endpoint: &str, config: &RallyConfig) -> Result<TcpStream> {
    let deadline = Instant::now() + config.connect_timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match try_connect(endpoint).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                tracing::debug!(endpoint, attempts, "connected to chief");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(endpoint, attempts, error = %e, "chief not reachable yet");
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(RallyError::ChiefUnreachable {
                addr: endpoint.to_string(),
                attempts,
            });
        }
        let pause = config
            .connect_retry_interval
            .min(deadline.saturating_duration_since(now))
            .max(Duration::from_millis(1));
        tokio::time::sleep(pause).await;
    }
}

async fn try_connect(endpoint: &str) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in resolve(endpoint).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => RallyError::transport_with_source(format!("connect {endpoint}"), e),
        None => RallyError::transport(format!("connect {endpoint}: no addresses")),
    })
}
