//! Runs the analysis agent as a subprocess.
//!
//! The instruction document goes to the child's stdin, which is then closed.
//! Stdout and stderr are captured in full. A run that outlives the configured
//! limit is killed, along with everything it started, and reported as timed
//! out with whatever output it produced. The call never waits much past the
//! limit, even when descendants keep the output pipes open.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::AgentError;

/// The agent binary, looked up on `PATH`.
pub const AGENT_PROGRAM: &str = "claude";
pub const AGENT_ARGS: &[&str] = &["-p", "--dangerously-skip-permissions"];

/// How long output pipes may stay open once the agent itself has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// What one agent run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed or died by signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Run the agent over `instructions`. `Err` only when the process could
    /// not be driven at all; exit status is reported in the outcome.
    async fn invoke(&self, instructions: &str) -> Result<ExecutionOutcome, AgentError>;
}

pub struct ProcessAgent {
    program: &'static str,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessAgent {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: AGENT_PROGRAM,
            args: AGENT_ARGS.iter().map(|a| a.to_string()).collect(),
            timeout,
        }
    }

    #[cfg(test)]
    fn with_program(program: &'static str, args: &[&str], timeout: Duration) -> Self {
        Self {
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout,
        }
    }
}

#[async_trait]
impl AgentInvoker for ProcessAgent {
    async fn invoke(&self, instructions: &str) -> Result<ExecutionOutcome, AgentError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeout;
        tracing::info!(program = self.program, "launching agent");

        let mut child = {
            let mut command = Command::new(self.program);
            command
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            // Tools the agent starts share its group, so one signal reaches them all.
            #[cfg(unix)]
            command.process_group(0);
            command.spawn().map_err(|source| AgentError::Launch {
                program: self.program,
                source,
            })?
        };
        let pid = child.id();

        let stdin = child.stdin.take();
        let input = instructions.to_owned();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // A child that exits without reading its input closes the pipe.
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!("agent stdin closed early: {e}");
                }
                let _ = stdin.shutdown().await;
            }
        });

        let stdout = Captured::default();
        let stderr = Captured::default();
        let mut readers = [
            tokio::spawn(capture(child.stdout.take(), stdout.clone())),
            tokio::spawn(capture(child.stderr.take(), stderr.clone())),
        ];

        let (exit_code, timed_out) = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "agent exceeded time limit, killing"
                );
                kill_process_group(pid);
                if let Err(e) = child.kill().await {
                    tracing::debug!("agent already gone: {e}");
                }
                (None, true)
            }
        };

        // Descendants may still hold the pipes open after the agent is gone.
        let drain_deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        let mut lingering = false;
        for reader in readers.iter_mut() {
            match tokio::time::timeout_at(drain_deadline, &mut *reader).await {
                Ok(joined) => joined.map_err(|e| AgentError::Io(io::Error::other(e)))??,
                Err(_) => {
                    reader.abort();
                    lingering = true;
                }
            }
        }
        writer.abort();
        if lingering {
            tracing::warn!("agent left processes holding its output open, killing them");
            kill_process_group(pid);
        }

        Ok(ExecutionOutcome {
            stdout: stdout.text(),
            stderr: stderr.text(),
            exit_code,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            timed_out,
        })
    }
}

/// Output read so far from one pipe. Survives the reader being aborted.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn append(&self, bytes: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }

    fn text(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

async fn capture<R>(pipe: Option<R>, sink: Captured) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        sink.append(&chunk[..n]);
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // SAFETY: kill(2) only sends a signal; the group was created at spawn.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        tracing::debug!(
            pgid,
            "process group already gone: {}",
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
