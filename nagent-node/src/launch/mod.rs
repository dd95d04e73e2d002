//! Task launch: fork/exec of job step tasks under the requested identity.
//!
//! The control thread prepares everything the child needs, forks, records
//! the pid and hands the task to a supervisor thread. Setup failures inside
//! the child surface asynchronously through the error pipe.

mod child;
mod supervisor;

pub use child::{ExecOutcome, SetupStage};

use crate::error::LaunchError;
use crate::lifecycle::{EXIT_SETUP_FAILED, TaskEvent, deliver_signal};
use crate::registry::{StepHandle, TaskHandle, TaskRegistry, TaskSpec};
use child::{ChildFds, ExecPlan, Privileges};
use crossbeam_channel::Sender;
use nagent_proto::{LaunchTasksRequest, TaskState};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl, open};
use nix::sys::stat::Mode;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Gid, Pid, Uid, User, fork, getegid, geteuid, getgrouplist, pipe2, setpgid};
use std::ffi::CString;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use supervisor::{Supervisor, TaskPipes};
use tracing::{debug, error, info, warn};

/// One task of a launch request, as seen by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub job_id: u32,
    pub step_id: u32,
    /// Global rank within the step.
    pub task_id: u32,
    pub local_id: u32,
    /// Tasks of the step on this node.
    pub ntasks: u32,
    pub uid: u32,
    pub gid: u32,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub cwd: Option<String>,
    pub io_addr: Option<SocketAddr>,
    pub resp_addr: Option<SocketAddr>,
}

impl TaskDescriptor {
    /// Split a launch request into one descriptor per task.
    pub fn from_request(req: &LaunchTasksRequest) -> Vec<TaskDescriptor> {
        let ntasks = req.global_task_ids.len() as u32;
        req.global_task_ids
            .iter()
            .enumerate()
            .map(|(local_id, &task_id)| TaskDescriptor {
                job_id: req.job_id,
                step_id: req.step_id,
                task_id,
                local_id: local_id as u32,
                ntasks,
                uid: req.uid,
                gid: req.gid,
                argv: req.argv.clone(),
                env: req.env.clone(),
                cwd: req.cwd.clone(),
                io_addr: req.io_addr,
                resp_addr: req.resp_addr,
            })
            .collect()
    }

    fn spec(&self) -> TaskSpec {
        TaskSpec {
            task_id: self.task_id,
            local_id: self.local_id,
            uid: self.uid,
            gid: self.gid,
        }
    }
}

/// Forks tasks and hands them to supervisor threads.
pub struct Launcher {
    registry: Arc<TaskRegistry>,
    events: Sender<TaskEvent>,
    node_name: String,
    buffer_size: usize,
    connect_timeout: Duration,
}

impl Launcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        events: Sender<TaskEvent>,
        node_name: String,
        buffer_size: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            node_name,
            buffer_size,
            connect_timeout,
        }
    }

    /// Launch every task of a request as a new job step.
    ///
    /// All task slots are reserved before the first fork. A fork failure
    /// frees the slots of every task not yet started and kills the ones that
    /// were; they are reported like any other terminated task.
    pub fn launch_step(&self, req: &LaunchTasksRequest) -> Result<Vec<TaskHandle>, LaunchError> {
        if req.argv.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }
        if req.global_task_ids.is_empty() {
            return Err(LaunchError::NoTasks);
        }
        let descriptors = TaskDescriptor::from_request(req);
        let step = self.registry.alloc_job_step(req.job_id, req.step_id)?;

        let mut tasks = Vec::with_capacity(descriptors.len());
        for desc in &descriptors {
            match self.registry.alloc_task(step, desc.spec()) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    self.abort_reserved(req, &tasks);
                    return Err(e.into());
                }
            }
        }

        for (started, (task, desc)) in tasks.iter().zip(&descriptors).enumerate() {
            if let Err(e) = self.start(*task, desc) {
                error!(job_id = req.job_id, step_id = req.step_id, task_id = desc.task_id, error = %e, "Task launch failed");
                for running in &tasks[..started] {
                    if let Err(e) = self.registry.signal_task(*running, Signal::SIGKILL, deliver_signal) {
                        warn!(job_id = req.job_id, step_id = req.step_id, error = %e, "Failed to kill started task");
                    }
                }
                self.abort_reserved(req, &tasks[started..]);
                return Err(e);
            }
        }

        info!(
            job_id = req.job_id,
            step_id = req.step_id,
            ntasks = tasks.len(),
            uid = req.uid,
            argv0 = %req.argv[0],
            "Job step launched"
        );
        Ok(tasks)
    }

    /// Launch a single task into an existing step.
    pub fn launch_task(&self, step: StepHandle, desc: &TaskDescriptor) -> Result<TaskHandle, LaunchError> {
        if desc.argv.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }
        let task = self.registry.alloc_task(step, desc.spec())?;
        if let Err(e) = self.start(task, desc) {
            if let Err(free_err) = self.registry.free_task(task) {
                warn!(task_id = desc.task_id, error = %free_err, "Failed to free task slot");
            }
            return Err(e);
        }
        Ok(task)
    }

    /// Free slots of tasks that never started; drop the step if it is empty.
    fn abort_reserved(&self, req: &LaunchTasksRequest, tasks: &[TaskHandle]) {
        for task in tasks {
            if let Err(e) = self.registry.free_task(*task) {
                warn!(error = %e, "Failed to free reserved task slot");
            }
        }
        let empty = self
            .registry
            .step_snapshot(req.job_id, req.step_id)
            .is_ok_and(|s| s.tasks.is_empty());
        if empty && let Err(e) = self.registry.release_job_step(req.job_id, req.step_id) {
            warn!(job_id = req.job_id, step_id = req.step_id, error = %e, "Failed to drop empty job step");
        }
    }

    fn start(&self, task: TaskHandle, desc: &TaskDescriptor) -> Result<(), LaunchError> {
        let plan = build_plan(desc, &self.node_name)?;

        let (stdin_r, stdin_w) = pipe2(OFlag::O_CLOEXEC).map_err(LaunchError::Pipe)?;
        let (stdout_r, stdout_w) = pipe2(OFlag::O_CLOEXEC).map_err(LaunchError::Pipe)?;
        let (stderr_r, stderr_w) = pipe2(OFlag::O_CLOEXEC).map_err(LaunchError::Pipe)?;
        let (error_r, error_w) = pipe2(OFlag::O_CLOEXEC).map_err(LaunchError::Pipe)?;

        // SAFETY: the child runs only async-signal-safe code until execve.
        let pid = match unsafe { fork() }.map_err(LaunchError::Fork)? {
            ForkResult::Child => unsafe {
                child::run_child(
                    &plan,
                    &ChildFds {
                        stdin: &stdin_r,
                        stdout: &stdout_w,
                        stderr: &stderr_w,
                        error: &error_w,
                    },
                )
            },
            ForkResult::Parent { child: pid } => pid,
        };
        drop((stdin_r, stdout_w, stderr_w, error_w));

        // Also set from the parent so the group exists before the pid is
        // recorded. Fails with EACCES once the child has exec'd, by which
        // point the child has set it itself.
        if let Err(e) = setpgid(pid, pid) {
            debug!(task_id = desc.task_id, %pid, error = %e, "setpgid from parent failed");
        }
        debug!(
            job_id = desc.job_id,
            step_id = desc.step_id,
            task_id = desc.task_id,
            %pid,
            path = ?plan.path(),
            "Task forked"
        );

        if let Err(e) = self.registry.set_forked(task, pid) {
            abandon(pid);
            return Err(e.into());
        }

        let supervisor = Supervisor {
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            task,
            pid,
            job_id: desc.job_id,
            step_id: desc.step_id,
            task_id: desc.task_id,
            io_addr: desc.io_addr,
            resp_addr: desc.resp_addr,
            buffer_size: self.buffer_size,
            connect_timeout: self.connect_timeout,
        };
        let pipes = TaskPipes {
            stdin: stdin_w,
            stdout: stdout_r,
            stderr: stderr_r,
            error: error_r,
        };
        let spawned = thread::Builder::new()
            .name(format!("task-{}.{}.{}", desc.job_id, desc.step_id, desc.task_id))
            .spawn(move || supervisor.run(pipes));

        if let Err(e) = spawned {
            abandon(pid);
            if let Err(record_err) = self.registry.record_exit(task, TaskState::Exited, EXIT_SETUP_FAILED) {
                warn!(task_id = desc.task_id, error = %record_err, "Failed to record abandoned task");
            }
            return Err(LaunchError::Thread(e));
        }
        Ok(())
    }
}

/// Kill and reap a child that cannot be supervised.
fn abandon(pid: Pid) {
    // Not reaped yet, so the pid is still ours.
    if let Err(e) = kill(pid, Signal::SIGKILL) {
        warn!(%pid, error = %e, "Failed to kill unsupervised task");
    }
    while let Err(Errno::EINTR) = waitpid(pid, None) {}
}

/// Make sure descriptors 0, 1 and 2 are open, pointing any closed one at
/// `/dev/null`. Task pipes then never land on them, so wiring a pipe onto
/// the child's stdio never clobbers another pipe end.
pub fn reserve_standard_fds() -> nix::Result<()> {
    for fd in 0..3 {
        match fcntl(fd, FcntlArg::F_GETFD) {
            Ok(_) => continue,
            Err(Errno::EBADF) => {}
            Err(e) => return Err(e),
        }
        // open() returns the lowest free descriptor, which is `fd`. It stays
        // open for the life of the daemon.
        open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
    }
    Ok(())
}

fn cstring(value: &str) -> Result<CString, LaunchError> {
    CString::new(value).map_err(|_| LaunchError::InvalidArgument(value.to_string()))
}

fn build_plan(desc: &TaskDescriptor, node_name: &str) -> Result<ExecPlan, LaunchError> {
    let env = task_environment(desc, node_name);
    let path = resolve_command(&desc.argv[0], &env);
    let argv = desc.argv.iter().map(|a| cstring(a)).collect::<Result<Vec<_>, _>>()?;
    let envp = env.iter().map(|e| cstring(e)).collect::<Result<Vec<_>, _>>()?;
    let cwd = desc.cwd.as_deref().map(cstring).transpose()?;
    let privileges = resolve_privileges(desc.uid, desc.gid);
    Ok(ExecPlan::new(cstring(&path)?, argv, envp, cwd, privileges))
}

/// Request environment plus the per-task `NAGENT_*` variables. Request
/// entries with the same names are replaced.
pub fn task_environment(desc: &TaskDescriptor, node_name: &str) -> Vec<String> {
    let ours = [
        ("NAGENT_JOB_ID", desc.job_id.to_string()),
        ("NAGENT_STEP_ID", desc.step_id.to_string()),
        ("NAGENT_TASK_ID", desc.task_id.to_string()),
        ("NAGENT_LOCAL_ID", desc.local_id.to_string()),
        ("NAGENT_NTASKS", desc.ntasks.to_string()),
        ("NAGENT_NODENAME", node_name.to_string()),
    ];
    let mut env: Vec<String> = desc
        .env
        .iter()
        .filter(|entry| {
            let name = entry.split_once('=').map_or(entry.as_str(), |(n, _)| n);
            !ours.iter().any(|(k, _)| *k == name)
        })
        .cloned()
        .collect();
    env.extend(ours.iter().map(|(k, v)| format!("{k}={v}")));
    env
}

/// Resolve `command` against `PATH` from the task environment, falling back
/// to the daemon's own. Commands containing `/` are used as given, as are
/// commands that are not found (exec then reports `ENOENT`).
pub fn resolve_command(command: &str, env: &[String]) -> String {
    if command.contains('/') {
        return command.to_string();
    }
    let search = env
        .iter()
        .find_map(|e| e.strip_prefix("PATH="))
        .map(str::to_owned)
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_default();

    search
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(command))
        .find(|candidate| is_executable(candidate))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.to_string())
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Decide the identity switch for the child. Nothing changes only when the
/// daemon is unprivileged and already runs as the requested user.
fn resolve_privileges(uid: u32, gid: u32) -> Privileges {
    let euid = geteuid();
    if !euid.is_root() && euid.as_raw() == uid && getegid().as_raw() == gid {
        return Privileges::Keep;
    }
    let user = match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user,
        Ok(None) => return Privileges::UnknownUser,
        Err(e) => {
            warn!(uid, error = %e, "User lookup failed");
            return Privileges::UnknownUser;
        }
    };
    let groups = CString::new(user.name.as_str())
        .ok()
        .and_then(|name| getgrouplist(&name, Gid::from_raw(gid)).ok())
        .unwrap_or_else(|| vec![Gid::from_raw(gid)]);
    Privileges::Drop {
        uid,
        gid,
        groups: groups.iter().map(|g| g.as_raw()).collect(),
    }
}
