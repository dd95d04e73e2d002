use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nagent_proto::{
    KillTasksRequest, Message, MessageEngine, ReturnCode, StepId, TaskExitMsg, TransportError,
    init_message_engine,
};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use tabled::{Table, Tabled};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod launch;

#[derive(Parser)]
#[command(name = "nagent")]
#[command(about = "Client for the nagent Node Agent", long_about = None)]
struct Cli {
    /// Node agent address
    #[arg(short, long, env = "NAGENT_NODE", default_value = "127.0.0.1:6818")]
    node: SocketAddr,

    /// Seconds to wait for a reply
    #[arg(long, default_value = "5")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a job step and relay its I/O
    Launch {
        /// Job ID
        #[arg(long)]
        job: u32,

        /// Step ID
        #[arg(long, default_value = "0")]
        step: u32,

        /// Number of tasks
        #[arg(short = 'n', long, default_value = "1")]
        ntasks: u32,

        /// Working directory (defaults to the current one)
        #[arg(long)]
        cwd: Option<String>,

        /// Credential presented to the node
        #[arg(long, env = "NAGENT_CREDENTIAL", default_value = "nagent")]
        credential: String,

        /// Prefix output lines with the task ID
        #[arg(short, long)]
        label: bool,

        /// Do not open I/O streams; task output is discarded
        #[arg(long)]
        no_io: bool,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Signal every task of a job step
    Kill {
        /// Job ID
        job: u32,

        /// Step ID
        step: u32,

        /// Signal number
        #[arg(short, long, default_value = "15")]
        signal: u32,
    },

    /// Show the tasks of a job step
    Status {
        /// Job ID
        job: u32,

        /// Step ID
        step: u32,
    },

    /// Release a finished job step
    Release {
        /// Job ID
        job: u32,

        /// Step ID
        step: u32,
    },

    /// Check that the node agent answers
    Ping,
}

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "TASK")]
    task_id: u32,
    #[tabled(rename = "PID")]
    pid: u32,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "EXIT")]
    exit_code: String,
}

/// Datagram client bound on the interface that routes to the node.
pub(crate) struct Client {
    engine: MessageEngine,
    node: SocketAddr,
    timeout: Duration,
    /// Task exits that arrived while waiting for a reply.
    pending_exits: Vec<TaskExitMsg>,
}

impl Client {
    fn connect(node: SocketAddr, timeout: Duration) -> Result<Self> {
        let local = local_ip_towards(node)?;
        let engine = init_message_engine(SocketAddr::new(local, 0))?;
        Ok(Self {
            engine,
            node,
            timeout,
            pending_exits: Vec::new(),
        })
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Task exits buffered while waiting for replies.
    pub(crate) fn take_pending_exits(&mut self) -> Vec<TaskExitMsg> {
        std::mem::take(&mut self.pending_exits)
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.engine.local_addr()?)
    }

    /// Send `msg` and wait for the node's reply.
    pub(crate) fn request(&mut self, msg: &Message) -> Result<Message> {
        self.engine.send_message(self.node, msg)?;
        let deadline = Instant::now() + self.timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                bail!("no reply from {} within {:?}", self.node, self.timeout);
            }
            self.engine.set_receive_timeout(Some(left))?;
            match self.engine.receive_message() {
                Ok((_, Message::TaskExit(exit))) => self.pending_exits.push(exit),
                Ok((src, reply)) if src.port() == self.node.port() => return Ok(reply),
                Ok((src, _)) => debug!(%src, "Ignoring message from unexpected peer"),
                Err(TransportError::Timeout) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Next task exit report, waiting at most `wait`.
    pub(crate) fn next_exit(&mut self, wait: Duration) -> Result<Option<TaskExitMsg>> {
        if let Some(exit) = self.pending_exits.pop() {
            return Ok(Some(exit));
        }
        self.engine.set_receive_timeout(Some(wait))?;
        match self.engine.receive_message() {
            Ok((_, Message::TaskExit(exit))) => Ok(Some(exit)),
            Ok(_) | Err(TransportError::Timeout) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Local address the kernel would use to reach `node`.
fn local_ip_towards(node: SocketAddr) -> Result<IpAddr> {
    let unspecified: SocketAddr = match node {
        SocketAddr::V4(_) => "0.0.0.0:0".parse()?,
        SocketAddr::V6(_) => "[::]:0".parse()?,
    };
    let route = UdpSocket::bind(unspecified)?;
    route
        .connect(node)
        .with_context(|| format!("no route to {node}"))?;
    Ok(route.local_addr()?.ip())
}

fn expect_success(reply: Message) -> Result<()> {
    match reply {
        Message::ReturnCode(ReturnCode::Success) => Ok(()),
        Message::ReturnCode(rc) => bail!("node returned {rc}"),
        other => bail!("unexpected reply {:?}", other.msg_type()),
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nagent=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut client = Client::connect(cli.node, Duration::from_secs(cli.timeout))?;

    match cli.command {
        Commands::Launch {
            job,
            step,
            ntasks,
            cwd,
            credential,
            label,
            no_io,
            command,
        } => {
            let opts = launch::LaunchOptions {
                job_id: job,
                step_id: step,
                ntasks,
                cwd,
                credential,
                label,
                io: !no_io,
                argv: command,
            };
            launch::run(&mut client, opts)
        }
        Commands::Kill { job, step, signal } => {
            let reply = client.request(&Message::KillTasks(KillTasksRequest {
                job_id: job,
                step_id: step,
                signal,
            }))?;
            expect_success(reply)?;
            println!("Signal {} sent to step {}.{}", signal, job, step);
            Ok(0)
        }
        Commands::Status { job, step } => {
            let reply = client.request(&Message::StepStatus(StepId {
                job_id: job,
                step_id: step,
            }))?;
            let status = match reply {
                Message::StepStatusResponse(status) => status,
                other => {
                    expect_success(other)?;
                    bail!("node returned no status");
                }
            };
            println!(
                "Step {}.{} on {} ({} of {} task slots)",
                status.job_id,
                status.step_id,
                status.node_name,
                status.tasks.len(),
                status.capacity
            );
            let rows: Vec<TaskRow> = status
                .tasks
                .iter()
                .map(|t| TaskRow {
                    task_id: t.task_id,
                    pid: t.pid,
                    state: t.state.to_string(),
                    exit_code: if t.state.is_terminal() {
                        t.exit_code.to_string()
                    } else {
                        "-".to_string()
                    },
                })
                .collect();
            if !rows.is_empty() {
                println!("{}", Table::new(rows));
            }
            Ok(0)
        }
        Commands::Release { job, step } => {
            let reply = client.request(&Message::ReleaseJobStep(StepId {
                job_id: job,
                step_id: step,
            }))?;
            expect_success(reply)?;
            println!("Step {}.{} released", job, step);
            Ok(0)
        }
        Commands::Ping => {
            let start = Instant::now();
            expect_success(client.request(&Message::Ping)?)?;
            println!("{} answered in {:?}", cli.node, start.elapsed());
            Ok(0)
        }
    }
}
