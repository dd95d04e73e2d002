//! Node agent: control loop dispatching requests from the message engine.

use crate::config::NodeConfig;
use crate::credential::CredentialVerifier;
use crate::error::Result;
use crate::launch::Launcher;
use crate::lifecycle::{Reporter, kill_tasks};
use crate::registry::TaskRegistry;
use nagent_proto::{
    KillTasksRequest, LaunchTasksRequest, Message, MessageEngine, MsgType, ReturnCode, StepId,
    StepStatusResponse, TaskStatusEntry, TransportError, init_message_engine,
};
use nix::sys::signal::Signal;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct NodeAgent {
    config: NodeConfig,
    engine: MessageEngine,
    registry: Arc<TaskRegistry>,
    /// Dropped on shutdown so the reporter sees the event queue close.
    launcher: Option<Launcher>,
    verifier: Box<dyn CredentialVerifier>,
    reporter: Option<JoinHandle<()>>,
}

impl NodeAgent {
    /// Bind the message engine and start the reporter thread.
    pub fn new(config: NodeConfig, verifier: Box<dyn CredentialVerifier>) -> Result<Self> {
        config.validate()?;
        let engine = init_message_engine(config.listen)?;
        engine.set_receive_timeout(Some(config.poll_interval))?;

        let registry = Arc::new(TaskRegistry::new(config.limits));
        // Each task queues one report and one drain event, and its slot is
        // freed only once both are consumed.
        let (events_tx, events_rx) = crossbeam_channel::bounded(2 * config.limits.max_tasks);
        let reporter = Reporter::new(engine.try_clone()?, config.controller, Arc::clone(&registry))
            .spawn(events_rx)?;
        let launcher = Launcher::new(
            Arc::clone(&registry),
            events_tx,
            config.node_name.clone(),
            config.buffer_size,
            config.connect_timeout,
        );

        info!(
            node = %config.node_name,
            listen = %engine.local_addr()?,
            controller = ?config.controller,
            max_steps = config.limits.max_steps,
            max_tasks = config.limits.max_tasks,
            "Node agent ready"
        );

        Ok(Self {
            config,
            engine,
            registry,
            launcher: Some(launcher),
            verifier,
            reporter: Some(reporter),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.engine.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Serve requests until `shutdown` is raised.
    pub fn run(&self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::SeqCst) {
            match self.engine.receive_message() {
                Ok((src, msg)) => {
                    if let Some(reply) = self.handle_message(src, msg) {
                        self.reply(src, &reply);
                    }
                }
                Err(TransportError::Timeout) => {}
                Err(TransportError::Decode {
                    src,
                    msg_type,
                    source,
                }) => {
                    warn!(%src, ?msg_type, error = %source, "Dropping malformed message");
                    let is_request = msg_type
                        .and_then(MsgType::from_u16)
                        .is_some_and(MsgType::is_request);
                    if is_request {
                        self.reply(src, &Message::ReturnCode(ReturnCode::ProtocolError));
                    }
                }
                Err(e) => warn!(error = %e, "Receive failed"),
            }
        }
        info!("Control loop stopped");
        Ok(())
    }

    /// Handle one decoded message; returns the reply, if any.
    pub fn handle_message(&self, src: SocketAddr, msg: Message) -> Option<Message> {
        debug!(%src, msg_type = ?msg.msg_type(), "Handling message");
        let rc = match msg {
            Message::Ping => ReturnCode::Success,
            Message::LaunchTasks(req) => self.launch(src, &req),
            Message::KillTasks(req) => self.kill(&req),
            Message::ReleaseJobStep(id) => self.release(id),
            Message::StepStatus(id) => return Some(self.status(id)),
            Message::ReturnCode(_) | Message::StepStatusResponse(_) | Message::TaskExit(_) => {
                debug!(%src, "Ignoring response message");
                return None;
            }
        };
        Some(Message::ReturnCode(rc))
    }

    fn launch(&self, src: SocketAddr, req: &LaunchTasksRequest) -> ReturnCode {
        if !self.verifier.verify(req) {
            warn!(%src, job_id = req.job_id, step_id = req.step_id, uid = req.uid, "Launch rejected: invalid credential");
            return ReturnCode::InvalidCredential;
        }
        let Some(launcher) = &self.launcher else {
            return ReturnCode::InvalidRequest;
        };
        match launcher.launch_step(req) {
            Ok(_) => ReturnCode::Success,
            Err(e) => {
                warn!(job_id = req.job_id, step_id = req.step_id, error = %e, "Launch failed");
                e.return_code()
            }
        }
    }

    fn kill(&self, req: &KillTasksRequest) -> ReturnCode {
        let Ok(signal) = Signal::try_from(req.signal as i32) else {
            warn!(signal = req.signal, "Kill rejected: invalid signal");
            return ReturnCode::InvalidRequest;
        };
        match kill_tasks(&self.registry, req.job_id, req.step_id, signal) {
            Ok(_) => ReturnCode::Success,
            Err(e) => {
                debug!(job_id = req.job_id, step_id = req.step_id, error = %e, "Kill failed");
                e.return_code()
            }
        }
    }

    fn release(&self, id: StepId) -> ReturnCode {
        match self.registry.release_job_step(id.job_id, id.step_id) {
            Ok(freed) => {
                info!(job_id = id.job_id, step_id = id.step_id, freed, "Job step released");
                ReturnCode::Success
            }
            Err(e) => {
                debug!(job_id = id.job_id, step_id = id.step_id, error = %e, "Release failed");
                e.return_code()
            }
        }
    }

    fn status(&self, id: StepId) -> Message {
        match self.registry.step_snapshot(id.job_id, id.step_id) {
            Ok(step) => Message::StepStatusResponse(StepStatusResponse {
                node_name: self.config.node_name.clone(),
                job_id: step.job_id,
                step_id: step.step_id,
                capacity: step.capacity as u32,
                tasks: step
                    .tasks
                    .iter()
                    .map(|t| TaskStatusEntry {
                        task_id: t.task_id,
                        pid: t.pid.map_or(0, |p| p.as_raw() as u32),
                        state: t.state,
                        exit_code: t.exit_code,
                    })
                    .collect(),
            }),
            Err(e) => Message::ReturnCode(e.return_code()),
        }
    }

    fn reply(&self, dest: SocketAddr, msg: &Message) {
        if let Err(e) = self.engine.send_message(dest, msg) {
            warn!(%dest, error = %e, "Failed to send reply");
        }
    }

    /// Kill every live task, wait for their reports to go out and release
    /// the socket.
    pub fn shutdown(mut self) -> Result<()> {
        for step in self.registry.snapshot() {
            if step.tasks.iter().any(|t| t.state.is_live())
                && let Err(e) = kill_tasks(&self.registry, step.job_id, step.step_id, Signal::SIGKILL)
            {
                error!(job_id = step.job_id, step_id = step.step_id, error = %e, "Failed to kill job step");
            }
        }
        drop(self.launcher.take());
        if let Some(reporter) = self.reporter.take() {
            if reporter.join().is_err() {
                error!("Reporter thread panicked");
            }
        }
        self.engine.shutdown();
        info!("Node agent stopped");
        Ok(())
    }
}
