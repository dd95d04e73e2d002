//! Byte relays between task pipes and client I/O streams.
//!
//! Each relay owns its source, its sink and its circular buffer and runs on
//! its own thread. A relay whose sink fails switches to discard mode and keeps
//! draining its source, so a vanished client never blocks a task on a full
//! pipe.

use crate::cbuf::CircularBuffer;
use crate::lifecycle::deliver_signal;
use crate::registry::{TaskHandle, TaskRegistry};
use nagent_proto::io_stream::decode_signal;
use nix::sys::signal::Signal;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes read from the source.
    pub received: usize,
    /// Bytes written to the sink.
    pub forwarded: usize,
    /// Bytes dropped because there was no usable sink.
    pub discarded: usize,
}

/// Copy `source` into `sink` through `buf` until the source reaches end of
/// input or fails. A `None` sink discards everything.
pub fn relay<R: Read, W: Write>(
    source: &mut R,
    mut sink: Option<&mut W>,
    buf: &mut CircularBuffer,
) -> RelayStats {
    let mut stats = RelayStats::default();
    let mut eof = false;

    while !eof {
        match buf.fill_from(source) {
            Ok(0) if !buf.is_full() => eof = true,
            Ok(n) => stats.received += n,
            Err(e) => {
                debug!(error = %e, "Relay source failed");
                eof = true;
            }
        }

        while !buf.is_empty() {
            let Some(w) = sink.as_deref_mut() else {
                stats.discarded += buf.readable_bytes();
                buf.clear();
                break;
            };
            match buf.drain_to(w) {
                Ok(0) => {
                    debug!("Relay sink closed, discarding");
                    sink = None;
                }
                Ok(n) => stats.forwarded += n,
                Err(e) => {
                    debug!(error = %e, "Relay sink failed, discarding");
                    sink = None;
                }
            }
        }
    }

    if let Some(w) = sink
        && let Err(e) = w.flush()
    {
        debug!(error = %e, "Relay sink flush failed");
    }
    trace!(?stats, "Relay finished");
    stats
}

/// Task output (stdout or stderr pipe) towards the client.
pub(crate) fn spawn_output(
    name: String,
    mut pipe: File,
    mut stream: Option<TcpStream>,
    buffer_size: usize,
) -> io::Result<JoinHandle<RelayStats>> {
    let mut buf = CircularBuffer::new(buffer_size).map_err(io::Error::other)?;
    thread::Builder::new().name(name).spawn(move || {
        relay(&mut pipe, stream.as_mut(), &mut buf)
    })
}

/// Client bytes towards the task's stdin pipe. Closing the pipe on return
/// delivers end of input to the task.
pub(crate) fn spawn_input(
    name: String,
    mut stream: TcpStream,
    pipe: File,
    buffer_size: usize,
) -> io::Result<JoinHandle<RelayStats>> {
    let mut buf = CircularBuffer::new(buffer_size).map_err(io::Error::other)?;
    thread::Builder::new().name(name).spawn(move || {
        let mut pipe = Some(pipe);
        relay(&mut stream, pipe.as_mut(), &mut buf)
    })
}

/// Read 4-byte signal numbers from the client and deliver them to the task.
pub fn forward_signals<R: Read>(source: &mut R, registry: &TaskRegistry, task: TaskHandle) -> usize {
    let mut delivered = 0;
    let mut raw = [0u8; 4];
    while source.read_exact(&mut raw).is_ok() {
        let signo = decode_signal(raw);
        let Ok(signal) = Signal::try_from(signo as i32) else {
            warn!(signo, "Ignoring invalid signal from client");
            continue;
        };
        match registry.signal_task(task, signal, deliver_signal) {
            Ok(true) => delivered += 1,
            Ok(false) => debug!(%signal, "Task not live, signal dropped"),
            Err(e) => {
                debug!(error = %e, "Task gone, stopping signal relay");
                break;
            }
        }
    }
    delivered
}

pub(crate) fn spawn_signals(
    name: String,
    mut stream: TcpStream,
    registry: Arc<TaskRegistry>,
    task: TaskHandle,
) -> io::Result<JoinHandle<usize>> {
    thread::Builder::new()
        .name(name)
        .spawn(move || forward_signals(&mut stream, &registry, task))
}
