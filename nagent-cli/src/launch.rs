//! `nagent launch`: submit a job step, relay task I/O, collect exit codes.

use crate::Client;
use anyhow::{Context, Result, bail};
use nagent_proto::transport::{listen_stream, shutdown_stream};
use nagent_proto::{
    IO_HEADER_LEN, IoStreamHeader, LaunchTasksRequest, Message, ReturnCode, StepId, StreamKind,
    TaskExitMsg, TaskState,
};
use nix::unistd::{getgid, getuid};
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL: Duration = Duration::from_millis(100);

pub(crate) struct LaunchOptions {
    pub job_id: u32,
    pub step_id: u32,
    pub ntasks: u32,
    pub cwd: Option<String>,
    pub credential: String,
    pub label: bool,
    pub io: bool,
    pub argv: Vec<String>,
}

/// Launch the step and block until every task has exited. Returns the
/// highest task exit code.
pub(crate) fn run(client: &mut Client, opts: LaunchOptions) -> Result<i32> {
    if opts.ntasks == 0 {
        bail!("at least one task is required");
    }
    let resp_addr = client.local_addr()?;
    let listener = if opts.io {
        let listener = listen_stream(SocketAddr::new(resp_addr.ip(), 0))?;
        listener.set_nonblocking(true)?;
        Some(listener)
    } else {
        None
    };

    let cwd = match opts.cwd.clone() {
        Some(cwd) => cwd,
        None => std::env::current_dir()?.to_string_lossy().into_owned(),
    };
    let req = LaunchTasksRequest {
        job_id: opts.job_id,
        step_id: opts.step_id,
        uid: getuid().as_raw(),
        gid: getgid().as_raw(),
        credential: opts.credential.clone().into_bytes(),
        argv: opts.argv.clone(),
        env: std::env::vars().map(|(k, v)| format!("{k}={v}")).collect(),
        cwd: Some(cwd),
        global_task_ids: (0..opts.ntasks).collect(),
        io_addr: listener.as_ref().map(|l| l.local_addr()).transpose()?,
        resp_addr: Some(resp_addr),
    };

    match client.request(&Message::LaunchTasks(req))? {
        Message::ReturnCode(ReturnCode::Success) => {}
        Message::ReturnCode(rc) => bail!("launch of step {}.{} failed: {rc}", opts.job_id, opts.step_id),
        other => bail!("unexpected reply {:?}", other.msg_type()),
    }

    let mut io = IoRelay {
        label: opts.label,
        outputs: Vec::new(),
        stdin_forwarded: false,
    };
    let mut exits: BTreeMap<u32, TaskExitMsg> = BTreeMap::new();
    let mut last_exit = Instant::now();
    while exits.len() < opts.ntasks as usize {
        if let Some(listener) = &listener {
            io.accept_pending(listener)?;
        }
        if let Some(exit) = client.next_exit(POLL)? {
            if exit.job_id == opts.job_id && exit.step_id == opts.step_id {
                exits.insert(exit.task_id, exit);
                last_exit = Instant::now();
            }
        } else if last_exit.elapsed() >= client.timeout() {
            recover_lost_exits(client, &opts, &mut exits)?;
            // Tasks still running are queried again after another quiet
            // period.
            last_exit = Instant::now();
        }
    }
    // A task connects its streams before it can exit, so every stream is
    // connected by now.
    if let Some(listener) = &listener {
        io.accept_pending(listener)?;
    }
    io.finish();

    let mut worst = 0;
    for exit in exits.values() {
        if exit.exit_code != 0 {
            let detail = match (exit.signal, exit.errno) {
                (0, 0) => String::new(),
                (0, errno) => format!(" (setup errno {errno})"),
                (sig, _) => format!(" (signal {sig})"),
            };
            eprintln!(
                "nagent: task {} {} with exit code {}{}",
                exit.task_id, exit.state, exit.exit_code, detail
            );
        }
        worst = worst.max(exit.exit_code);
    }
    Ok(worst)
}

/// Exit code recorded for a task whose report never arrived and whose slot
/// the node has already freed.
const EXIT_REPORT_LOST: i32 = 255;

/// Exit reports are datagrams and can be lost. Ask the node for the step and
/// fill in every task it no longer runs.
fn recover_lost_exits(
    client: &mut Client,
    opts: &LaunchOptions,
    exits: &mut BTreeMap<u32, TaskExitMsg>,
) -> Result<()> {
    let (job_id, step_id) = (opts.job_id, opts.step_id);
    debug!(job_id, step_id, missing = opts.ntasks as usize - exits.len(), "Querying step status");
    let reply = client.request(&Message::StepStatus(StepId { job_id, step_id }))?;
    // Reports that arrived meanwhile win over anything derived from status.
    for exit in client.take_pending_exits() {
        if exit.job_id == job_id && exit.step_id == step_id {
            exits.insert(exit.task_id, exit);
        }
    }
    let tasks = match reply {
        Message::StepStatusResponse(status) => status.tasks,
        // Released by someone else: every slot is gone.
        Message::ReturnCode(ReturnCode::UnknownStep) => Vec::new(),
        Message::ReturnCode(rc) => bail!("status of step {job_id}.{step_id} failed: {rc}"),
        other => bail!("unexpected reply {:?}", other.msg_type()),
    };

    for task_id in 0..opts.ntasks {
        if exits.contains_key(&task_id) {
            continue;
        }
        let exit = match tasks.iter().find(|t| t.task_id == task_id) {
            Some(entry) if entry.state.is_terminal() => TaskExitMsg {
                job_id,
                step_id,
                task_id,
                state: entry.state,
                exit_code: entry.exit_code,
                signal: 0,
                errno: 0,
            },
            Some(_) => continue,
            // Slots are freed only after reporting.
            None => {
                eprintln!("nagent: exit report of task {task_id} was lost");
                TaskExitMsg {
                    job_id,
                    step_id,
                    task_id,
                    state: TaskState::Exited,
                    exit_code: EXIT_REPORT_LOST,
                    signal: 0,
                    errno: 0,
                }
            }
        };
        exits.insert(task_id, exit);
    }
    Ok(())
}

struct IoRelay {
    label: bool,
    outputs: Vec<JoinHandle<()>>,
    stdin_forwarded: bool,
}

impl IoRelay {
    fn accept_pending(&mut self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.attach(stream) {
                        warn!(%peer, error = %e, "Rejected I/O stream");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("accepting I/O stream"),
            }
        }
    }

    fn attach(&mut self, mut stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        let mut raw = [0u8; IO_HEADER_LEN];
        stream.read_exact(&mut raw)?;
        let header = IoStreamHeader::decode(&raw)?;
        debug!(task_id = header.task_id, kind = ?header.kind, "I/O stream attached");

        let prefix = self.label.then(|| format!("{}: ", header.task_id));
        let handle = match header.kind {
            StreamKind::InOut => {
                // Terminal input goes to task 0 only.
                if header.task_id == 0 && !self.stdin_forwarded {
                    self.stdin_forwarded = true;
                    forward_stdin(stream.try_clone()?);
                }
                thread::spawn(move || copy_output(stream, io::stdout(), prefix))
            }
            StreamKind::SigErr => thread::spawn(move || copy_output(stream, io::stderr(), prefix)),
        };
        self.outputs.push(handle);
        Ok(())
    }

    fn finish(self) {
        for handle in self.outputs {
            let _ = handle.join();
        }
    }
}

fn copy_output<W: Write>(stream: TcpStream, mut out: W, prefix: Option<String>) {
    let result = match prefix {
        None => io::copy(&mut &stream, &mut out).map(|_| ()),
        Some(prefix) => {
            let mut reader = BufReader::new(&stream);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break Ok(()),
                    Ok(_) => {
                        if let Err(e) = out
                            .write_all(prefix.as_bytes())
                            .and_then(|_| out.write_all(&line))
                        {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e),
                }
            }
        }
    };
    if let Err(e) = result.and_then(|_| out.flush()) {
        debug!(error = %e, "Output relay stopped");
    }
}

/// Copy our stdin to the task; end of input half-closes the stream.
/// Detached: a pending terminal read must not hold up exit.
fn forward_stdin(stream: TcpStream) {
    thread::spawn(move || {
        let mut sink = &stream;
        let mut input = io::stdin().lock();
        if let Err(e) = io::copy(&mut input, &mut sink) {
            debug!(error = %e, "Stdin relay stopped");
        }
        shutdown_stream(&stream, Shutdown::Write);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use nagent_proto::{StepStatusResponse, TaskStatusEntry, init_message_engine};

    fn options(job_id: u32, ntasks: u32) -> LaunchOptions {
        LaunchOptions {
            job_id,
            step_id: 0,
            ntasks,
            cwd: Some("/".into()),
            credential: "test".into(),
            label: false,
            io: false,
            argv: vec!["true".into()],
        }
    }

    fn exited(req: &LaunchTasksRequest, task_id: u32, exit_code: i32) -> Message {
        Message::TaskExit(TaskExitMsg {
            job_id: req.job_id,
            step_id: req.step_id,
            task_id,
            state: TaskState::Exited,
            exit_code,
            signal: 0,
            errno: 0,
        })
    }

    /// Node double: accepts the launch, reports only task 0 and answers the
    /// status query with `tasks`.
    fn fake_node(tasks: Vec<TaskStatusEntry>) -> (SocketAddr, JoinHandle<()>) {
        let node = init_message_engine("127.0.0.1:0".parse().unwrap()).unwrap();
        node.set_receive_timeout(Some(Duration::from_secs(10))).unwrap();
        let addr = node.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (src, msg) = node.receive_message().unwrap();
            let Message::LaunchTasks(req) = msg else {
                panic!("expected launch, got {msg:?}");
            };
            node.send_message(src, &Message::ReturnCode(ReturnCode::Success))
                .unwrap();
            node.send_message(req.resp_addr.unwrap(), &exited(&req, 0, 0))
                .unwrap();

            let (src, msg) = node.receive_message().unwrap();
            assert_eq!(
                msg,
                Message::StepStatus(StepId {
                    job_id: req.job_id,
                    step_id: req.step_id
                })
            );
            let status = StepStatusResponse {
                node_name: "fake".into(),
                job_id: req.job_id,
                step_id: req.step_id,
                capacity: 2,
                tasks,
            };
            node.send_message(src, &Message::StepStatusResponse(status))
                .unwrap();
        });
        (addr, handle)
    }

    #[test]
    fn test_launch_collects_every_exit() {
        let node = init_message_engine("127.0.0.1:0".parse().unwrap()).unwrap();
        node.set_receive_timeout(Some(Duration::from_secs(10))).unwrap();
        let addr = node.local_addr().unwrap();
        let fake = thread::spawn(move || {
            let (src, msg) = node.receive_message().unwrap();
            let Message::LaunchTasks(req) = msg else {
                panic!("expected launch, got {msg:?}");
            };
            assert_eq!(req.global_task_ids, vec![0, 1]);
            assert!(req.io_addr.is_none());
            node.send_message(src, &Message::ReturnCode(ReturnCode::Success))
                .unwrap();
            for (task_id, code) in [(1, 3), (0, 0)] {
                node.send_message(req.resp_addr.unwrap(), &exited(&req, task_id, code))
                    .unwrap();
            }
        });

        let mut client = Client::connect(addr, Duration::from_secs(5)).unwrap();
        assert_eq!(run(&mut client, options(1, 2)).unwrap(), 3);
        fake.join().unwrap();
    }

    #[test]
    fn test_lost_exit_is_taken_from_step_status() {
        let (addr, fake) = fake_node(vec![TaskStatusEntry {
            task_id: 1,
            pid: 77,
            state: TaskState::Exited,
            exit_code: 4,
        }]);
        let mut client = Client::connect(addr, Duration::from_millis(500)).unwrap();
        assert_eq!(run(&mut client, options(2, 2)).unwrap(), 4);
        fake.join().unwrap();
    }

    #[test]
    fn test_freed_task_without_report_counts_as_lost() {
        let (addr, fake) = fake_node(Vec::new());
        let mut client = Client::connect(addr, Duration::from_millis(500)).unwrap();
        assert_eq!(run(&mut client, options(3, 2)).unwrap(), EXIT_REPORT_LOST);
        fake.join().unwrap();
    }
}
