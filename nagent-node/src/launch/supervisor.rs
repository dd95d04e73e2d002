//! Per-task supervisor thread: wires I/O streams, watches the error pipe,
//! reaps the child and hands the final status to the reporter.
//!
//! The exit report is queued as soon as the task is terminal. The slot is
//! released separately, after the relays have drained.

use super::child::{ERROR_RECORD_LEN, ExecOutcome};
use crate::lifecycle::{TaskEvent, TaskExit, complete_task};
use crate::registry::{TaskHandle, TaskRegistry};
use crate::relay::{self, RelayStats};
use crossbeam_channel::Sender;
use nagent_proto::transport::{connect_stream, retry_eintr, shutdown_stream};
use nagent_proto::{IoStreamHeader, StreamKind, TaskState, TransportError};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Parent ends of the task's pipes.
pub(crate) struct TaskPipes {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
    pub error: OwnedFd,
}

pub(crate) struct Supervisor {
    pub registry: Arc<TaskRegistry>,
    pub events: Sender<TaskEvent>,
    pub task: TaskHandle,
    pub pid: Pid,
    pub job_id: u32,
    pub step_id: u32,
    pub task_id: u32,
    pub io_addr: Option<SocketAddr>,
    pub resp_addr: Option<SocketAddr>,
    pub buffer_size: usize,
    pub connect_timeout: Duration,
}

#[derive(Default)]
struct Relays {
    stdout: Option<JoinHandle<RelayStats>>,
    stderr: Option<JoinHandle<RelayStats>>,
    stdin: Option<JoinHandle<RelayStats>>,
    signals: Option<JoinHandle<usize>>,
}

impl Supervisor {
    pub(crate) fn run(self, pipes: TaskPipes) {
        let inout = self.open_stream(StreamKind::InOut);
        let sigerr = self.open_stream(StreamKind::SigErr);
        let relays = self.start_relays(pipes.stdin, pipes.stdout, pipes.stderr, &inout, &sigerr);

        let outcome = read_exec_outcome(pipes.error);
        match outcome {
            ExecOutcome::Started => {
                for state in [TaskState::Execed, TaskState::Running] {
                    if let Err(e) = self.registry.transition(self.task, state) {
                        warn!(task_id = self.task_id, error = %e, "Unexpected task transition");
                    }
                }
                debug!(job_id = self.job_id, step_id = self.step_id, task_id = self.task_id, pid = %self.pid, "Task running");
            }
            ExecOutcome::Failed { stage, errno } => {
                warn!(
                    job_id = self.job_id,
                    step_id = self.step_id,
                    task_id = self.task_id,
                    %stage,
                    %errno,
                    "Task setup failed"
                );
            }
        }

        // The child stays a zombie until the terminal state is recorded, so
        // its pid and process group cannot be reused while the registry still
        // lets signals through to it.
        let waited = wait_for_exit(self.pid);
        let exit = match (outcome, waited) {
            (ExecOutcome::Failed { stage, errno }, _) => TaskExit::SetupFailed { stage, errno },
            (ExecOutcome::Started, Some(exit)) => exit,
            (ExecOutcome::Started, None) => TaskExit::Exited(255),
        };
        let report = complete_task(&self.registry, self.task, exit, self.resp_addr);
        if waited.is_some() {
            self.reap_group();
        }

        match report {
            Ok(report) => {
                if self.events.send(TaskEvent::Finished(report)).is_err() {
                    error!(task_id = self.task_id, "Reporter gone, task exit not reported");
                }
            }
            Err(e) => error!(task_id = self.task_id, error = %e, "Failed to record task exit"),
        }

        // Output relays end once every writer of the pipes is gone; only then
        // are the streams torn down.
        let stdout = join(relays.stdout);
        let stderr = join(relays.stderr);
        for stream in [&inout, &sigerr].into_iter().flatten() {
            shutdown_stream(stream, Shutdown::Both);
        }
        let stdin = join(relays.stdin);
        join(relays.signals);
        debug!(
            task_id = self.task_id,
            stdout = stdout.map(|s| s.received),
            stderr = stderr.map(|s| s.received),
            stdin = stdin.map(|s| s.forwarded),
            "Task I/O closed"
        );

        if self.events.send(TaskEvent::Drained(self.task)).is_err() {
            error!(task_id = self.task_id, "Reporter gone, task slot not freed");
        }
    }

    /// Kill whatever the task left behind in its process group, then reap
    /// the leader.
    fn reap_group(&self) {
        match killpg(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(task_id = self.task_id, pid = %self.pid, error = %e, "Failed to kill leftover processes"),
        }
        let reaped = loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                other => break other,
            }
        };
        if let Err(e) = reaped {
            warn!(task_id = self.task_id, pid = %self.pid, error = %e, "Failed to reap task");
        }
    }

    fn open_stream(&self, kind: StreamKind) -> Option<TcpStream> {
        let addr = self.io_addr?;
        let header = IoStreamHeader {
            kind,
            job_id: self.job_id,
            step_id: self.step_id,
            task_id: self.task_id,
        };
        match connect_with_header(addr, &header, self.connect_timeout) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(task_id = self.task_id, ?kind, %addr, error = %e, "I/O stream unavailable, discarding");
                None
            }
        }
    }

    fn start_relays(
        &self,
        stdin: OwnedFd,
        stdout: OwnedFd,
        stderr: OwnedFd,
        inout: &Option<TcpStream>,
        sigerr: &Option<TcpStream>,
    ) -> Relays {
        let prefix = format!("t{}.{}.{}", self.job_id, self.step_id, self.task_id);
        let clone = |s: &Option<TcpStream>| s.as_ref().and_then(|s| s.try_clone().ok());
        let mut relays = Relays::default();

        relays.stdout = self.started(
            "stdout",
            relay::spawn_output(format!("{prefix}-out"), File::from(stdout), clone(inout), self.buffer_size),
        );
        relays.stderr = self.started(
            "stderr",
            relay::spawn_output(format!("{prefix}-err"), File::from(stderr), clone(sigerr), self.buffer_size),
        );
        // Without a stream the stdin pipe is dropped here and the task sees
        // end of input.
        if let Some(stream) = clone(inout) {
            relays.stdin = self.started(
                "stdin",
                relay::spawn_input(format!("{prefix}-in"), stream, File::from(stdin), self.buffer_size),
            );
        }
        if let Some(stream) = clone(sigerr) {
            relays.signals = self.started(
                "signals",
                relay::spawn_signals(format!("{prefix}-sig"), stream, Arc::clone(&self.registry), self.task),
            );
        }
        relays
    }

    fn started<T>(&self, channel: &str, spawned: std::io::Result<JoinHandle<T>>) -> Option<JoinHandle<T>> {
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(task_id = self.task_id, channel, error = %e, "Failed to start relay");
                None
            }
        }
    }
}

fn connect_with_header(
    addr: SocketAddr,
    header: &IoStreamHeader,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let mut stream = connect_stream(addr, timeout)?;
    stream.write_all(&header.encode())?;
    Ok(stream)
}

fn join<T>(handle: Option<JoinHandle<T>>) -> Option<T> {
    handle.and_then(|h| h.join().ok())
}

/// Block until the child execs (pipe closes empty) or reports a failure.
fn read_exec_outcome(pipe: OwnedFd) -> ExecOutcome {
    let mut pipe = File::from(pipe);
    let mut record = [0u8; ERROR_RECORD_LEN];
    let mut len = 0;
    while len < record.len() {
        match retry_eintr(|| pipe.read(&mut record[len..])) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(e) => {
                warn!(error = %e, "Failed to read exec error pipe");
                break;
            }
        }
    }
    ExecOutcome::decode(&record[..len])
}

/// Wait for `pid` to terminate without reaping it. `None` when the wait
/// itself failed; the child is then not known to be a zombie.
fn wait_for_exit(pid: Pid) -> Option<TaskExit> {
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(WaitStatus::Exited(_, code)) => return Some(TaskExit::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Some(TaskExit::Signaled(signal)),
            Ok(status) => debug!(%pid, ?status, "Ignoring wait status"),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!(%pid, error = %e, "waitid failed");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    #[test]
    fn test_wait_leaves_child_reapable() {
        let child = std::process::Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        assert_eq!(wait_for_exit(pid), Some(TaskExit::Exited(7)));
        // Still a zombie: the pid is not free for reuse yet.
        assert_eq!(waitpid(pid, None), Ok(WaitStatus::Exited(pid, 7)));
    }

    #[test]
    fn test_exec_outcome_from_closed_pipe() {
        let (r, w) = pipe().unwrap();
        drop(w);
        assert_eq!(read_exec_outcome(r), ExecOutcome::Started);
    }

    #[test]
    fn test_exec_outcome_from_record() {
        let (r, w) = pipe().unwrap();
        let mut w = File::from(w);
        w.write_all(&3u32.to_be_bytes()).unwrap();
        w.write_all(&2i32.to_be_bytes()).unwrap();
        drop(w);
        assert_eq!(
            read_exec_outcome(r),
            ExecOutcome::Failed {
                stage: crate::launch::SetupStage::Groups,
                errno: Errno::ENOENT
            }
        );
    }
}
