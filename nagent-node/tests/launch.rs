//! Real fork/exec of small programs through the launcher.

use crossbeam_channel::Receiver;
use nagent_node::{
    LaunchError, Launcher, RegistryError, RegistryLimits, TaskEvent, TaskHandle, TaskRegistry,
    TaskReport, kill_tasks,
};
use nagent_proto::{IO_HEADER_LEN, IoStreamHeader, LaunchTasksRequest, ReturnCode, StreamKind, TaskState};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::{getegid, geteuid};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

fn setup(limits: RegistryLimits) -> (Arc<TaskRegistry>, Launcher, Receiver<TaskEvent>) {
    let registry = Arc::new(TaskRegistry::new(limits));
    let (tx, rx) = crossbeam_channel::unbounded();
    let launcher = Launcher::new(
        Arc::clone(&registry),
        tx,
        "testnode".into(),
        256,
        Duration::from_secs(2),
    );
    (registry, launcher, rx)
}

fn small() -> RegistryLimits {
    RegistryLimits {
        max_steps: 4,
        max_tasks: 8,
        max_tasks_per_step: 4,
    }
}

fn request(job_id: u32, argv: &[&str]) -> LaunchTasksRequest {
    LaunchTasksRequest {
        job_id,
        step_id: 0,
        uid: geteuid().as_raw(),
        gid: getegid().as_raw(),
        credential: b"test".to_vec(),
        argv: argv.iter().map(|s| s.to_string()).collect(),
        env: vec!["PATH=/usr/bin:/bin".into()],
        cwd: None,
        global_task_ids: vec![0],
        io_addr: None,
        resp_addr: None,
    }
}

/// Next exit report, skipping drain events.
fn next_report(rx: &Receiver<TaskEvent>) -> TaskReport {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left).expect("task exit report") {
            TaskEvent::Finished(report) => return report,
            TaskEvent::Drained(_) => {}
        }
    }
}

/// Wait for the drain event of `task`.
fn wait_drained(rx: &Receiver<TaskEvent>, task: TaskHandle) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left).expect("task drain event") {
            TaskEvent::Drained(drained) if drained == task => return,
            _ => {}
        }
    }
}

fn assert_no_more_reports(rx: &Receiver<TaskEvent>) {
    while let Ok(event) = rx.recv_timeout(Duration::from_millis(300)) {
        assert!(
            matches!(event, TaskEvent::Drained(_)),
            "unexpected second report {event:?}"
        );
    }
}

fn wait_for_state(registry: &TaskRegistry, task: TaskHandle, state: TaskState) {
    let deadline = Instant::now() + TIMEOUT;
    while registry.task_info(task).map(|t| t.state) != Some(state) {
        assert!(Instant::now() < deadline, "task never reached {state}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Accept both streams of one task, returned as (InOut, SigErr).
fn accept_task_streams(listener: &TcpListener) -> (TcpStream, TcpStream) {
    let mut inout = None;
    let mut sigerr = None;
    for _ in 0..2 {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut raw = [0u8; IO_HEADER_LEN];
        stream.read_exact(&mut raw).unwrap();
        let header = IoStreamHeader::decode(&raw).unwrap();
        match header.kind {
            StreamKind::InOut => inout = Some(stream),
            StreamKind::SigErr => sigerr = Some(stream),
        }
    }
    (inout.unwrap(), sigerr.unwrap())
}

fn read_all(stream: &mut TcpStream) -> String {
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    out
}

#[test]
fn true_walks_every_state_and_reports_once() {
    let (registry, launcher, rx) = setup(small());
    let tasks = launcher.launch_step(&request(1, &["/bin/true"])).unwrap();
    assert_eq!(tasks.len(), 1);

    let report = next_report(&rx);
    assert_eq!(report.task, tasks[0]);
    assert_eq!(report.msg.state, TaskState::Exited);
    assert_eq!(report.msg.exit_code, 0);
    assert_eq!(report.msg.signal, 0);
    assert_no_more_reports(&rx);

    let info = registry.task_info(tasks[0]).unwrap();
    assert_eq!(
        info.history,
        vec![
            TaskState::Requested,
            TaskState::Forked,
            TaskState::Execed,
            TaskState::Running,
            TaskState::Exited
        ]
    );
}

#[test]
fn exit_status_passes_through() {
    let (_registry, launcher, rx) = setup(small());
    launcher
        .launch_step(&request(2, &["sh", "-c", "exit 3"]))
        .unwrap();
    let report = next_report(&rx);
    assert_eq!(report.msg.state, TaskState::Exited);
    assert_eq!(report.msg.exit_code, 3);
}

#[test]
fn missing_command_reports_127() {
    let (registry, launcher, rx) = setup(small());
    let tasks = launcher
        .launch_step(&request(3, &["/nonexistent/nagent-test-cmd"]))
        .unwrap();
    let report = next_report(&rx);
    assert_eq!(report.msg.state, TaskState::Exited);
    assert_eq!(report.msg.exit_code, 127);
    assert_eq!(report.msg.errno, libc::ENOENT);
    assert_eq!(
        registry.task_info(tasks[0]).unwrap().history,
        vec![TaskState::Requested, TaskState::Forked, TaskState::Exited]
    );
}

#[test]
fn unknown_uid_fails_without_orphan() {
    let (registry, launcher, rx) = setup(small());
    let mut req = request(4, &["/bin/true"]);
    req.uid = 4_000_000;
    req.gid = 4_000_000;
    let tasks = launcher.launch_step(&req).unwrap();

    let report = next_report(&rx);
    assert_eq!(report.msg.state, TaskState::Exited);
    assert_ne!(report.msg.exit_code, 0);
    assert_eq!(report.msg.errno, libc::ENOENT);

    // Already reaped by the supervisor.
    let pid = registry.task_info(tasks[0]).unwrap().pid.unwrap();
    assert_eq!(
        waitpid(pid, Some(WaitPidFlag::WNOHANG)),
        Err(Errno::ECHILD)
    );
}

#[test]
fn kill_twice_is_a_noop() {
    let (registry, launcher, rx) = setup(small());
    let tasks = launcher
        .launch_step(&request(5, &["sleep", "30"]))
        .unwrap();
    wait_for_state(&registry, tasks[0], TaskState::Running);

    let first = kill_tasks(&registry, 5, 0, Signal::SIGTERM).unwrap();
    assert_eq!(first.signalled, 1);

    let report = next_report(&rx);
    assert_eq!(report.msg.state, TaskState::Killed);
    assert_eq!(report.msg.signal, Signal::SIGTERM as u32);
    assert_eq!(report.msg.exit_code, 128 + Signal::SIGTERM as i32);

    let second = kill_tasks(&registry, 5, 0, Signal::SIGTERM).unwrap();
    assert_eq!(second.signalled, 0);
    assert_eq!(second.skipped, 1);
    assert_no_more_reports(&rx);
}

#[test]
fn background_child_does_not_hold_back_report() {
    let (registry, launcher, rx) = setup(small());
    let started = Instant::now();
    let tasks = launcher
        .launch_step(&request(15, &["sh", "-c", "sleep 30 & exit 0"]))
        .unwrap();

    let report = next_report(&rx);
    assert_eq!(report.msg.state, TaskState::Exited);
    assert_eq!(report.msg.exit_code, 0);
    assert!(started.elapsed() < Duration::from_secs(5));

    // The leftover sleep held the output pipes; it is killed with the
    // task's process group, so the relays drain well before it would exit.
    wait_drained(&rx, tasks[0]);
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(
        registry.task_info(tasks[0]).unwrap().state,
        TaskState::Exited
    );
}

#[test]
fn exhausted_slots_leave_no_residue() {
    let (registry, launcher, _rx) = setup(RegistryLimits {
        max_steps: 4,
        max_tasks: 1,
        max_tasks_per_step: 4,
    });
    let mut req = request(6, &["/bin/true"]);
    req.global_task_ids = vec![0, 1];

    let err = launcher.launch_step(&req).unwrap_err();
    assert!(matches!(
        err,
        LaunchError::Registry(RegistryError::CapacityExceeded(_))
    ));
    assert_eq!(err.return_code(), ReturnCode::NoSlots);
    assert_eq!(registry.step_count(), 0);
    assert_eq!(registry.task_count(), 0);
}

#[test]
fn duplicate_step_is_rejected() {
    let (_registry, launcher, rx) = setup(small());
    launcher.launch_step(&request(7, &["/bin/true"])).unwrap();
    let err = launcher.launch_step(&request(7, &["/bin/true"])).unwrap_err();
    assert_eq!(err.return_code(), ReturnCode::StepExists);
    next_report(&rx);
}

#[test]
fn output_streams_reach_client() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (_registry, launcher, rx) = setup(small());
    let mut req = request(8, &["sh", "-c", "echo hello; echo oops >&2; exit 1"]);
    req.io_addr = Some(listener.local_addr().unwrap());
    launcher.launch_step(&req).unwrap();

    let (mut inout, mut sigerr) = accept_task_streams(&listener);
    assert_eq!(read_all(&mut inout), "hello\n");
    assert_eq!(read_all(&mut sigerr), "oops\n");
    assert_eq!(next_report(&rx).msg.exit_code, 1);
}

#[test]
fn stdin_is_forwarded_to_task() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (_registry, launcher, rx) = setup(small());
    let mut req = request(9, &["sh", "-c", "read line; echo \"got $line\""]);
    req.io_addr = Some(listener.local_addr().unwrap());
    launcher.launch_step(&req).unwrap();

    let (mut inout, _sigerr) = accept_task_streams(&listener);
    inout.write_all(b"ping\n").unwrap();
    assert_eq!(read_all(&mut inout), "got ping\n");
    assert_eq!(next_report(&rx).msg.exit_code, 0);
}

#[test]
fn setup_failure_diagnostic_reaches_stderr_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (_registry, launcher, rx) = setup(small());
    let mut req = request(10, &["/nonexistent/nagent-test-cmd"]);
    req.io_addr = Some(listener.local_addr().unwrap());
    launcher.launch_step(&req).unwrap();

    let (mut inout, mut sigerr) = accept_task_streams(&listener);
    assert_eq!(read_all(&mut inout), "");
    assert_eq!(read_all(&mut sigerr), "nagent: execve failed: errno 2\n");
    assert_eq!(next_report(&rx).msg.exit_code, 127);
}

#[test]
fn unreachable_client_output_is_discarded() {
    // Bind then drop to get a port nobody listens on.
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let (_registry, launcher, rx) = setup(small());
    let mut req = request(11, &["sh", "-c", "head -c 200000 /dev/zero"]);
    req.io_addr = Some(addr);
    launcher.launch_step(&req).unwrap();

    let report = next_report(&rx);
    assert_eq!(report.msg.state, TaskState::Exited);
    assert_eq!(report.msg.exit_code, 0);
}

#[test]
fn task_environment_is_set() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (_registry, launcher, rx) = setup(small());
    let mut req = request(
        12,
        &["sh", "-c", "echo $NAGENT_JOB_ID $NAGENT_TASK_ID $NAGENT_NODENAME"],
    );
    req.global_task_ids = vec![5];
    req.io_addr = Some(listener.local_addr().unwrap());
    launcher.launch_step(&req).unwrap();

    let (mut inout, _sigerr) = accept_task_streams(&listener);
    assert_eq!(read_all(&mut inout), "12 5 testnode\n");
    next_report(&rx);
}

#[test]
fn cwd_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (_registry, launcher, rx) = setup(small());
    let mut req = request(13, &["pwd"]);
    req.cwd = Some(dir.path().to_string_lossy().into_owned());
    req.io_addr = Some(listener.local_addr().unwrap());
    launcher.launch_step(&req).unwrap();

    let (mut inout, _sigerr) = accept_task_streams(&listener);
    let printed = read_all(&mut inout);
    let expected = dir.path().canonicalize().unwrap();
    assert_eq!(
        std::path::Path::new(printed.trim_end()).canonicalize().unwrap(),
        expected
    );
    next_report(&rx);
}

#[test]
fn privilege_drop_to_nobody_as_root() {
    if !geteuid().is_root() {
        return;
    }
    let Ok(Some(nobody)) = nix::unistd::User::from_name("nobody") else {
        return;
    };
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (_registry, launcher, rx) = setup(small());
    let mut req = request(14, &["id", "-u"]);
    req.uid = nobody.uid.as_raw();
    req.gid = nobody.gid.as_raw();
    req.io_addr = Some(listener.local_addr().unwrap());
    launcher.launch_step(&req).unwrap();

    let (mut inout, _sigerr) = accept_task_streams(&listener);
    assert_eq!(read_all(&mut inout).trim(), nobody.uid.to_string());
    assert_eq!(next_report(&rx).msg.exit_code, 0);
}
