//! Task state machine, exit status mapping, kill delivery and exit reporting.

use crate::error::RegistryError;
use crate::launch::SetupStage;
use crate::registry::{KillSummary, TaskHandle, TaskRegistry};
use crossbeam_channel::Receiver;
use nagent_proto::{Message, MessageEngine, TaskExitMsg, TaskState};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Exit code reported when exec found no such file.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;
/// Exit code reported for every other setup failure.
pub const EXIT_SETUP_FAILED: i32 = 126;

/// Check that `from -> to` is a legal task transition.
pub fn check_transition(from: TaskState, to: TaskState) -> Result<(), RegistryError> {
    use TaskState::*;
    let allowed = matches!(
        (from, to),
        (Requested, Forked)
            | (Forked, Execed)
            | (Forked, Exited)
            | (Execed, Running)
            | (Running, Exited)
            | (Running, Killed)
    );
    if allowed {
        Ok(())
    } else {
        Err(RegistryError::InvalidTransition { from, to })
    }
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    /// Normal exit with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(Signal),
    /// The child failed before or at exec.
    SetupFailed { stage: SetupStage, errno: Errno },
}

impl TaskExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskExit::Exited(code) => *code,
            TaskExit::Signaled(sig) => 128 + *sig as i32,
            TaskExit::SetupFailed {
                stage: SetupStage::Exec,
                errno: Errno::ENOENT,
            } => EXIT_COMMAND_NOT_FOUND,
            TaskExit::SetupFailed { .. } => EXIT_SETUP_FAILED,
        }
    }

    pub fn signal(&self) -> u32 {
        match self {
            TaskExit::Signaled(sig) => *sig as u32,
            _ => 0,
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            TaskExit::SetupFailed { errno, .. } => *errno as i32,
            _ => 0,
        }
    }

    /// Terminal state for this exit. Death by signal counts as `Killed`
    /// only when the daemon delivered a kill to the task.
    pub fn terminal_state(&self, kill_sent: bool) -> TaskState {
        match self {
            TaskExit::Signaled(_) if kill_sent => TaskState::Killed,
            _ => TaskState::Exited,
        }
    }
}

/// A terminal task waiting to be reported and freed.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: TaskHandle,
    pub msg: TaskExitMsg,
    /// Response address from the launch request.
    pub resp_addr: Option<SocketAddr>,
}

/// Signal the process group led by a task.
///
/// Every task leads its own group, set up on both sides of the fork before
/// the pid is recorded. The pid alone is never signalled: once the group is
/// gone the pid may belong to an unrelated process.
pub fn deliver_signal(pid: Pid, signal: Signal) -> nix::Result<()> {
    killpg(pid, signal)
}

/// Signal every live task of a job step.
///
/// Never blocks on the tasks; terminal tasks are skipped so a repeated kill
/// succeeds without effect.
pub fn kill_tasks(
    registry: &TaskRegistry,
    job_id: u32,
    step_id: u32,
    signal: Signal,
) -> Result<KillSummary, RegistryError> {
    let summary = registry.signal_step(job_id, step_id, signal, deliver_signal)?;
    info!(
        job_id,
        step_id,
        signal = %signal,
        signalled = summary.signalled,
        skipped = summary.skipped,
        "Kill request processed"
    );
    Ok(summary)
}

/// Record the terminal state of a reaped task and build its report.
pub fn complete_task(
    registry: &TaskRegistry,
    task: TaskHandle,
    exit: TaskExit,
    resp_addr: Option<SocketAddr>,
) -> Result<TaskReport, RegistryError> {
    let kill_sent = registry.task_info(task).is_some_and(|t| t.kill_sent);
    let state = exit.terminal_state(kill_sent);
    let info = registry.record_exit(task, state, exit.exit_code())?;
    info!(
        job_id = info.job_id,
        step_id = info.step_id,
        task_id = info.task_id,
        pid = ?info.pid,
        state = %state,
        exit_code = info.exit_code,
        "Task finished"
    );
    Ok(TaskReport {
        task,
        msg: TaskExitMsg {
            job_id: info.job_id,
            step_id: info.step_id,
            task_id: info.task_id,
            state,
            exit_code: exit.exit_code(),
            signal: exit.signal(),
            errno: exit.errno(),
        },
        resp_addr,
    })
}

/// What supervisors hand to the reporter, in order, for each task.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// The task reached a terminal state; send its report.
    Finished(TaskReport),
    /// The task's relay threads are gone; its slot may be freed.
    Drained(TaskHandle),
}

/// Sends task exit reports and frees registry slots once a task is both
/// reported and drained.
pub struct Reporter {
    engine: MessageEngine,
    controller: Option<SocketAddr>,
    registry: Arc<TaskRegistry>,
}

impl Reporter {
    pub fn new(
        engine: MessageEngine,
        controller: Option<SocketAddr>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            engine,
            controller,
            registry,
        }
    }

    /// Drain `events` on a dedicated thread until every sender is gone.
    ///
    /// A supervisor queues `Drained` after `Finished`, so a slot is freed only
    /// after its report went out.
    pub fn spawn(self, events: Receiver<TaskEvent>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("reporter".into())
            .spawn(move || {
                for event in events {
                    match event {
                        TaskEvent::Finished(report) => self.report(report),
                        TaskEvent::Drained(task) => self.free(task),
                    }
                }
                debug!("Reporter finished");
            })
    }

    fn report(&self, report: TaskReport) {
        let msg = Message::TaskExit(report.msg);
        let mut dests: Vec<SocketAddr> = self.controller.into_iter().collect();
        if let Some(addr) = report.resp_addr
            && !dests.contains(&addr)
        {
            dests.push(addr);
        }
        if dests.is_empty() {
            debug!(task_id = report.msg.task_id, "No destination for task exit report");
        }
        for dest in dests {
            if let Err(e) = self.engine.send_message(dest, &msg) {
                warn!(
                    job_id = report.msg.job_id,
                    step_id = report.msg.step_id,
                    task_id = report.msg.task_id,
                    %dest,
                    error = %e,
                    "Failed to send task exit report"
                );
            }
        }
    }

    fn free(&self, task: TaskHandle) {
        if let Err(e) = self.registry.free_task(task) {
            warn!(?task, error = %e, "Failed to free task slot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryLimits, TaskSpec};

    #[test]
    fn test_transition_table() {
        use TaskState::*;
        assert!(check_transition(Requested, Forked).is_ok());
        assert!(check_transition(Forked, Execed).is_ok());
        assert!(check_transition(Forked, Exited).is_ok());
        assert!(check_transition(Execed, Running).is_ok());
        assert!(check_transition(Running, Exited).is_ok());
        assert!(check_transition(Running, Killed).is_ok());

        assert!(check_transition(Requested, Running).is_err());
        assert!(check_transition(Forked, Killed).is_err());
        assert!(check_transition(Exited, Running).is_err());
        assert!(check_transition(Killed, Exited).is_err());
        assert!(check_transition(Running, Running).is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(TaskExit::Exited(0).exit_code(), 0);
        assert_eq!(TaskExit::Exited(3).exit_code(), 3);
        assert_eq!(TaskExit::Signaled(Signal::SIGKILL).exit_code(), 137);
        assert_eq!(TaskExit::Signaled(Signal::SIGTERM).signal(), 15);
        assert_eq!(
            TaskExit::SetupFailed {
                stage: SetupStage::Exec,
                errno: Errno::ENOENT
            }
            .exit_code(),
            127
        );
        let eperm = TaskExit::SetupFailed {
            stage: SetupStage::Setuid,
            errno: Errno::EPERM,
        };
        assert_eq!(eperm.exit_code(), 126);
        assert_eq!(eperm.errno(), libc::EPERM);
    }

    #[test]
    fn test_killed_requires_delivered_kill() {
        let exit = TaskExit::Signaled(Signal::SIGSEGV);
        assert_eq!(exit.terminal_state(false), TaskState::Exited);
        assert_eq!(exit.terminal_state(true), TaskState::Killed);
        assert_eq!(TaskExit::Exited(0).terminal_state(true), TaskState::Exited);
    }

    #[test]
    fn test_signal_reaches_only_process_groups() {
        // Spawned into our own group, so its pid names no group.
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        assert_eq!(deliver_signal(pid, Signal::SIGTERM), Err(Errno::ESRCH));
        assert!(child.try_wait().unwrap().is_none());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_kill_unknown_step() {
        let registry = TaskRegistry::new(RegistryLimits {
            max_steps: 1,
            max_tasks: 1,
            max_tasks_per_step: 1,
        });
        assert_eq!(
            kill_tasks(&registry, 9, 9, Signal::SIGTERM),
            Err(RegistryError::UnknownStep {
                job_id: 9,
                step_id: 9
            })
        );
    }

    #[test]
    fn test_complete_task_builds_report() {
        let registry = TaskRegistry::new(RegistryLimits {
            max_steps: 1,
            max_tasks: 1,
            max_tasks_per_step: 1,
        });
        let step = registry.alloc_job_step(5, 6).unwrap();
        let task = registry
            .alloc_task(
                step,
                TaskSpec {
                    task_id: 11,
                    local_id: 0,
                    uid: 0,
                    gid: 0,
                },
            )
            .unwrap();
        registry.set_forked(task, Pid::from_raw(321)).unwrap();

        let exit = TaskExit::SetupFailed {
            stage: SetupStage::Groups,
            errno: Errno::ENOENT,
        };
        let report = complete_task(&registry, task, exit, None).unwrap();
        assert_eq!(report.msg.job_id, 5);
        assert_eq!(report.msg.task_id, 11);
        assert_eq!(report.msg.state, TaskState::Exited);
        assert_eq!(report.msg.exit_code, 126);
        assert_eq!(report.msg.errno, libc::ENOENT);
        assert_eq!(registry.task_info(task).unwrap().state, TaskState::Exited);
    }
}
