//! Reply path of a component connection.
//!
//! Handlers for one connection finish in any order, but the socket must see
//! whole frames one after another. Each connection therefore owns a single
//! writer task. Handlers encode their reply and queue the bytes; the task
//! drains whatever has queued up and hands it to the socket in one vectored
//! write.
//!
//! ```text
//! handler ─┐
//! handler ─┼─► reply queue ─► writer task ─► socket
//! handler ─┘      (slots)
//! ```
//!
//! Slots bound how many encoded replies may wait for the socket. A handler
//! that cannot get a slot within `slot_timeout` gives up with a
//! `TransportWrite` error instead of growing the queue.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{CallmeshError, Result};
use crate::protocol::Frame;

/// Replies allowed to wait for the socket.
pub const DEFAULT_REPLY_SLOTS: usize = 1024;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub const DEFAULT_SLOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Most replies written by one vectored write.
const MAX_REPLIES_PER_WRITE: usize = 64;

/// Limits of a connection's reply path.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub reply_slots: usize,
    pub queue_capacity: usize,
    /// How long a handler waits for a free slot.
    pub slot_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            reply_slots: DEFAULT_REPLY_SLOTS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            slot_timeout: DEFAULT_SLOT_TIMEOUT,
        }
    }
}

/// Queues encoded replies for a connection's writer task.
///
/// Clones share the queue and its slots. A slot is taken when a reply is
/// queued and given back once the writer task has flushed it.
#[derive(Clone)]
pub struct WriterHandle {
    queue: mpsc::Sender<Bytes>,
    slots: Arc<Semaphore>,
    total_slots: usize,
    slot_timeout: Duration,
}

impl WriterHandle {
    /// Encode `frame` and queue it.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send(frame.encode()?).await
    }

    /// Queue already encoded bytes.
    ///
    /// # Errors
    ///
    /// `TransportWrite` when no slot frees up in time or the writer task has
    /// stopped.
    pub async fn send(&self, encoded: Bytes) -> Result<()> {
        let slot = tokio::time::timeout(self.slot_timeout, self.slots.acquire())
            .await
            .map_err(|_| {
                CallmeshError::TransportWrite(format!(
                    "No reply slot free after {:?}",
                    self.slot_timeout
                ))
            })?
            .map_err(|_| writer_stopped())?;

        self.queue.send(encoded).await.map_err(|_| writer_stopped())?;
        slot.forget();
        Ok(())
    }

    /// Whether every slot is taken.
    pub fn is_backpressure_active(&self) -> bool {
        self.slots.available_permits() == 0
    }

    /// Replies queued and not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.total_slots.saturating_sub(self.slots.available_permits())
    }
}

fn writer_stopped() -> CallmeshError {
    CallmeshError::TransportWrite("Connection closed".to_string())
}

/// Start the writer task for `socket`.
///
/// The task ends with `Ok` once every [`WriterHandle`] is dropped and the
/// queue is drained, or with the first write error.
pub fn spawn_writer_task<W>(socket: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let total_slots = config.reply_slots.max(1);
    let slots = Arc::new(Semaphore::new(total_slots));
    let (queue, replies) = mpsc::channel(config.queue_capacity.max(1));

    let task = tokio::spawn(drain_replies(replies, socket, slots.clone()));
    let handle = WriterHandle {
        queue,
        slots,
        total_slots,
        slot_timeout: config.slot_timeout,
    };
    (handle, task)
}

async fn drain_replies<W>(
    mut replies: mpsc::Receiver<Bytes>,
    mut socket: W,
    slots: Arc<Semaphore>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut pending = VecDeque::with_capacity(MAX_REPLIES_PER_WRITE);

    while let Some(reply) = replies.recv().await {
        pending.push_back(reply);
        while pending.len() < MAX_REPLIES_PER_WRITE {
            let Ok(reply) = replies.try_recv() else { break };
            pending.push_back(reply);
        }

        let count = pending.len();
        trace!(replies = count, "Flushing replies");
        write_all_vectored(&mut socket, &mut pending).await?;
        slots.add_permits(count);
    }

    Ok(())
}

/// Write every queued buffer, emptying `pending`.
async fn write_all_vectored<W>(socket: &mut W, pending: &mut VecDeque<Bytes>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    pending.retain(|b| !b.is_empty());

    while !pending.is_empty() {
        let written = {
            let slices: Vec<IoSlice<'_>> = pending.iter().map(|b| IoSlice::new(b)).collect();
            socket
                .write_vectored(&slices)
                .await
                .map_err(|e| CallmeshError::TransportWrite(e.to_string()))?
        };
        if written == 0 {
            return Err(CallmeshError::TransportWrite(
                "Socket accepted no bytes".to_string(),
            ));
        }
        consume(pending, written);
    }

    socket
        .flush()
        .await
        .map_err(|e| CallmeshError::TransportWrite(e.to_string()))
}

/// Drop `written` bytes from the front of the queue.
fn consume(pending: &mut VecDeque<Bytes>, mut written: usize) {
    while written > 0 {
        let Some(front) = pending.front_mut() else { return };
        if written < front.len() {
            front.advance(written);
            return;
        }
        written -= front.len();
        pending.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::duplex;

    use super::*;
    use crate::protocol::{read_frame, FrameReader, Signal, Tag};

    fn ping() -> Bytes {
        Frame::control(vec![], Signal::Ping).encode().unwrap()
    }

    fn handle_with(slots: usize, available: usize, timeout: Duration) -> (WriterHandle, mpsc::Receiver<Bytes>) {
        let (queue, replies) = mpsc::channel(10);
        let handle = WriterHandle {
            queue,
            slots: Arc::new(Semaphore::new(available)),
            total_slots: slots,
            slot_timeout: timeout,
        };
        (handle, replies)
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.reply_slots, DEFAULT_REPLY_SLOTS);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.slot_timeout, DEFAULT_SLOT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_replies_arrive_in_queue_order() {
        let (client, server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..10u8 {
            let frame = Frame::request(format!("action-{}", i), vec![Bytes::copy_from_slice(&[i])]);
            handle.send_frame(&frame).await.unwrap();
        }

        let mut reader = FrameReader::new(server);
        for i in 0..10 {
            let frame = reader.next_frame().await.unwrap().unwrap();
            assert_eq!(frame.action(), Some(format!("action-{}", i).as_str()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_without_slot() {
        let (handle, _replies) = handle_with(5, 0, Duration::from_millis(20));

        assert!(handle.is_backpressure_active());
        assert_eq!(handle.pending_count(), 5);
        let err = handle.send(ping()).await.unwrap_err();
        assert!(matches!(err, CallmeshError::TransportWrite(ref m) if m.starts_with("No reply slot")));
    }

    #[tokio::test]
    async fn test_send_after_writer_stopped() {
        let (handle, replies) = handle_with(10, 10, Duration::from_secs(1));
        drop(replies);

        assert!(handle.send(ping()).await.is_err());
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_slots_released_after_write() {
        let (client, mut server) = duplex(64 * 1024);
        let config = WriterConfig {
            reply_slots: 2,
            ..WriterConfig::default()
        };
        let (handle, _task) = spawn_writer_task(client, config);

        for _ in 0..6 {
            handle.send(ping()).await.unwrap();
        }
        for _ in 0..6 {
            let frame = read_frame(&mut server).await.unwrap();
            assert_eq!(frame.tag, Tag::Control(Signal::Ping));
        }
    }

    #[test]
    fn test_consume_partial_writes() {
        let mut pending: VecDeque<Bytes> =
            [Bytes::from_static(b"hello"), Bytes::from_static(b"world!")].into();

        consume(&mut pending, 3);
        assert_eq!(pending[0], Bytes::from_static(b"lo"));
        assert_eq!(pending.len(), 2);

        consume(&mut pending, 2);
        assert_eq!(pending.len(), 1);

        consume(&mut pending, 10);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_write_all_vectored_empties_queue() {
        let mut buf = Cursor::new(Vec::new());
        let mut pending: VecDeque<Bytes> = (0..5).map(|_| ping()).collect();
        pending.push_back(Bytes::new());
        let expected: usize = pending.iter().map(Bytes::len).sum();

        write_all_vectored(&mut buf, &mut pending).await.unwrap();
        assert!(pending.is_empty());
        assert_eq!(buf.into_inner().len(), expected);
    }

    #[tokio::test]
    async fn test_task_ends_when_handles_dropped() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
    }
}
