//! Dedicated writer task for outbound commands.
//!
//! Each link owns one writer task that receives encoded command arrays via an
//! mpsc channel and writes them to the socket write half. Callers never touch
//! the socket directly, and several commands queued at once are flushed with a
//! single vectored write.
//!
//! # Architecture
//!
//! ```text
//! Producer ─┐
//! Consumer ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► TcpStream (write half)
//! Core     ─┘
//! ```
//!
//! Backpressure is tracked with a pending-command counter: `try_send` refuses
//! new work once the counter reaches `max_pending_frames`. Every caller is
//! synchronous, so a full queue is reported at once rather than waited out.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{OrigamiError, Result};

/// Default maximum pending commands before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum commands to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending commands before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the command queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending encoded commands to the writer task.
///
/// This is cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<Bytes>, pending: Arc<AtomicUsize>, max_pending: usize) -> Self {
        Self {
            tx,
            pending,
            max_pending,
        }
    }

    /// Commands queued but not yet written.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queue a command without waiting.
    ///
    /// Returns `Err(Backpressure)` immediately if at capacity and
    /// `Err(ConnectionLost)` if the writer task has exited.
    pub fn try_send(&self, command: Bytes) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(OrigamiError::Backpressure);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(command).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => OrigamiError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => OrigamiError::ConnectionLost,
            }
        })
    }
}

/// Spawn the writer task and return a handle for queueing commands.
///
/// The task ends cleanly when every handle is dropped, or with an error when
/// the socket write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(tx, pending.clone(), config.max_pending_frames);

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(command) => batch.push(command),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;

        pending.fetch_sub(batch_size, Ordering::Release);
    }

    Ok(())
}

/// Write a batch of commands using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(OrigamiError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut start = 0;

    for command in batch {
        let end = start + command.len();
        if skip_bytes < end && !command.is_empty() {
            let offset = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&command[offset..]));
        }
        start = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_command;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let command = encode_command(&["PING"]);
        handle.try_send(command.clone()).unwrap();

        let mut buf = vec![0u8; command.len()];
        server.read_exact(&mut buf).await.unwrap();

        assert_eq!(buf, command.to_vec());
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let mut expected = Vec::new();
        for i in 0..10u32 {
            let command = encode_command(&["PUBLISH", "ch", &i.to_string()]);
            expected.extend_from_slice(&command);
            handle.try_send(command).unwrap();
        }

        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();

        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (tx, _rx) = mpsc::channel::<Bytes>(10);
        let pending = Arc::new(AtomicUsize::new(100));

        let handle = WriterHandle::new(tx, pending, 100);

        let result = handle.try_send(Bytes::from_static(b"x"));
        assert!(matches!(result, Err(OrigamiError::Backpressure)));
        assert_eq!(handle.pending_count(), 100);
    }

    #[tokio::test]
    async fn test_try_send_after_writer_exit() {
        let (tx, rx) = mpsc::channel::<Bytes>(10);
        drop(rx);

        let handle = WriterHandle::new(tx, Arc::new(AtomicUsize::new(0)), 10);

        let result = handle.try_send(Bytes::from_static(b"x"));
        assert!(matches!(result, Err(OrigamiError::ConnectionLost)));
        assert_eq!(handle.pending_count(), 0);
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defg")];

        assert_eq!(build_remaining_slices(&batch, 0).len(), 2);

        let partial = build_remaining_slices(&batch, 2);
        assert_eq!(partial.len(), 2);
        assert_eq!(&*partial[0], b"c");

        let second_only = build_remaining_slices(&batch, 3);
        assert_eq!(second_only.len(), 1);
        assert_eq!(&*second_only[0], b"defg");

        assert!(build_remaining_slices(&batch, 7).is_empty());
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());

        let batch: Vec<_> = (0..5).map(|_| Bytes::from_static(b"abc")).collect();
        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner(), b"abcabcabcabcabc".to_vec());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
