//! Per-connection tasks
//!
//! Each accepted socket gets a reader task and a writer task. The
//! reader decodes frames and hands them to the dispatcher; the writer
//! drains the connection's outbound queue, enforcing the slow-consumer
//! stall policy. Whichever side fails first tears the connection down.

use std::io::ErrorKind;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::broker::{Broker, SendBuffer};
use crate::server::ServerConfig;
use crate::wire::{read_frame, FrameError, RoutingHeader};

/// Why the writer task stopped
enum WriteExit {
    /// The outbound queue closed; nothing more will ever be sent
    QueueClosed,
    /// No write progress within the stall timeout
    Stalled,
    /// The peer went away mid-write
    BrokenPipe,
    /// Any other write failure
    Fatal(std::io::Error),
}

/// Drive one client connection until it dies or the broker stops
pub(crate) async fn run(broker: Arc<Broker>, stream: UnixStream, config: ServerConfig) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (conn, lname) = broker.register_connection(outbound_tx);
    debug!(conn, lname = %lname, "New connection");

    let (reader, writer) = stream.into_split();
    let mut shutdown = broker.shutdown_rx();

    tokio::select! {
        _ = shutdown.changed() => {
            debug!(conn, "Connection closing for broker shutdown");
        }
        () = read_loop(&broker, conn, reader, config.max_frame_size) => {}
        exit = write_loop(writer, outbound_rx, config.stall_timeout) => match exit {
            WriteExit::QueueClosed => debug!(conn, "Outbound queue closed"),
            WriteExit::Stalled => error!(
                conn,
                stall_ms = config.stall_timeout.as_millis() as u64,
                "Send buffer stalled, killing slow consumer"
            ),
            WriteExit::BrokenPipe => warn!(conn, "Broken pipe while writing to client"),
            WriteExit::Fatal(e) => error!(conn, error = %e, "Write failed, killing connection"),
        }
    }

    broker.destroy_connection(conn);
    debug!(conn, lname = %lname, "Connection closed");
}

/// Read frames and dispatch them until the stream ends or misbehaves
async fn read_loop(broker: &Arc<Broker>, conn: u64, mut reader: OwnedReadHalf, max_frame: usize) {
    loop {
        match read_frame(&mut reader, max_frame).await {
            Ok(Some(frame)) => match RoutingHeader::from_bytes(&frame.routing) {
                Ok(header) => broker.dispatch(conn, &header, &frame),
                Err(e) => {
                    error!(conn, error = %e, "Malformed routing header, killing connection");
                    return;
                }
            },
            Ok(None) => {
                // Clean close between frames: a normal disconnection
                debug!(conn, "Client closed connection");
                return;
            }
            Err(FrameError::Truncated) => {
                error!(conn, "Connection closed mid-frame");
                return;
            }
            Err(e) => {
                error!(conn, error = %e, "Malformed frame, killing connection");
                return;
            }
        }
    }
}

/// Drain the outbound queue onto the socket.
///
/// A non-empty buffer must make progress before the stall deadline,
/// measured from the last byte that actually went out, or the
/// connection is declared a slow consumer.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    stall_timeout: std::time::Duration,
) -> WriteExit {
    let mut buffer = SendBuffer::new(Instant::now());
    loop {
        if buffer.is_empty() {
            match queue.recv().await {
                Some(bytes) => buffer.push(&bytes, Instant::now()),
                None => return WriteExit::QueueClosed,
            }
        }
        // Absorb anything else already queued before draining
        while let Ok(bytes) = queue.try_recv() {
            buffer.push(&bytes, Instant::now());
        }

        while !buffer.is_empty() {
            let deadline = buffer.stall_deadline(stall_timeout);
            match timeout_at(deadline, writer.write(buffer.chunk())).await {
                Err(_) => return WriteExit::Stalled,
                Ok(Ok(0)) => {
                    return WriteExit::Fatal(ErrorKind::WriteZero.into());
                }
                Ok(Ok(n)) => buffer.advance(n, Instant::now()),
                Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
                Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => return WriteExit::BrokenPipe,
                Ok(Err(e)) => return WriteExit::Fatal(e),
            }
        }
    }
}
