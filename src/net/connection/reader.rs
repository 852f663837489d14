use std::{io, os::fd::AsRawFd, sync::atomic::Ordering};

use futures::future::{self, Either};
use tracing::{debug, trace};

use crate::Error;

use super::{Connection, Inner};

/// The outcome of a single read attempt.
#[derive(Debug)]
pub(super) enum Step {
    Read(usize),
    Retry,
    WouldBlock,
    Backpressure,
    Eof,
    Closed,
    Failed(Error),
}

impl Inner {
    /// Request space, read into it once and acknowledge what was read. The input lock is held
    /// throughout, which is what lets close wait out an in-flight read.
    pub(super) fn read_once(&self) -> Step {
        let mut input = self.lock_input();
        if !self.active.load(Ordering::Acquire) {
            return Step::Closed;
        }

        let space = match input.request_space(self.options.min_read_size) {
            Some(space) => space,
            None => return Step::Backpressure,
        };
        let n = match self.socket.read(space) {
            Ok(0) => return Step::Eof,
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::WouldBlock,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Step::Retry,
            Err(e) => return Step::Failed(e.into()),
        };

        match input.acknowledge(n) {
            Ok(()) => Step::Read(n),
            Err(e) => Step::Failed(e),
        }
    }
}

/// Drive a connection's reads until it closes. Registrations are edge-triggered, so every wake
/// is followed by reading until the socket reports it would block, only then does the loop go
/// back to waiting.
pub(super) async fn read_loop(conn: Connection) {
    let inner = &conn.inner;
    let fd = conn.as_raw_fd();
    trace!(fd, id = inner.id, "reader started");

    loop {
        match inner.read_once() {
            Step::Read(n) => {
                trace!(fd, n, "read");
                inner.touch();
                inner.data.notify();
            }
            Step::Retry => {}
            Step::WouldBlock => {
                if !wait_readable(&conn).await {
                    break;
                }
            }
            Step::Backpressure => {
                trace!(fd, "input buffer full, waiting for consumer");
                inner.drained.wait().await;
            }
            Step::Eof => {
                debug!(fd, id = inner.id, "peer closed connection");
                close(&conn);
                break;
            }
            Step::Closed => break,
            Step::Failed(e) => {
                debug!(fd, id = inner.id, "read failed, closing connection: {}", e);
                close(&conn);
                break;
            }
        }
    }

    trace!(fd, id = inner.id, "reader stopped");
}

/// Wait for the next readable edge. With a read timeout configured the wait is bounded, and a
/// timeout backs off before the caller retries, unless the connection has been quiet for longer
/// than the idle timeout in which case it is closed and false is returned.
async fn wait_readable(conn: &Connection) -> bool {
    let inner = &conn.inner;
    let timeout = match inner.read_timeout() {
        Some(timeout) => timeout,
        None => {
            inner.readable.wait().await;
            return true;
        }
    };

    match future::select(inner.readable.wait(), inner.engine.sleep(timeout)).await {
        Either::Left(..) => true,
        Either::Right(..) => {
            if let Some(idle) = inner.options.idle_timeout {
                if conn.last_activity().elapsed() >= idle {
                    debug!(fd = conn.as_raw_fd(), id = inner.id, "connection idle, closing");
                    close(conn);
                    return false;
                }
            }
            trace!(fd = conn.as_raw_fd(), "read timed out, backing off");
            inner.engine.sleep(inner.options.timeout_backoff).await;
            true
        }
    }
}

fn close(conn: &Connection) {
    if let Err(e) = conn.close() {
        debug!(fd = conn.as_raw_fd(), "error while closing connection: {}", e);
    }
}
