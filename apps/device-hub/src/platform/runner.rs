use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{PlatformError, Resource};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn render(program: &str, args: &[&str]) -> String {
    let mut rendered = program.to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

fn spawn_error(program: &str, err: std::io::Error) -> PlatformError {
    if err.kind() == ErrorKind::NotFound {
        PlatformError::ToolMissing {
            tool: program.to_string(),
            detail: err.to_string(),
        }
    } else {
        PlatformError::Io(err)
    }
}

/// Runs a tool to completion. Both pipes are drained concurrently so a chatty
/// child cannot stall on a full pipe and masquerade as a timeout.
pub async fn run_tool(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, PlatformError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|err| spawn_error(program, err))?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => return Err(PlatformError::Timeout(render(program, args))),
    };

    Ok(CommandOutput {
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        exit_code: output.status.code(),
    })
}

/// Like [`run_tool`] but a non-zero exit becomes [`PlatformError::Command`].
pub async fn run_checked(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, PlatformError> {
    let output = run_tool(program, args, timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        let detail = if output.stderr.is_empty() {
            format!("exit code {:?}", output.exit_code)
        } else {
            output.stderr.clone()
        };
        Err(PlatformError::Command {
            command: render(program, args),
            detail,
        })
    }
}

/// A long-running helper process (tunnel, forwarder, agent runner). Killed
/// when closed or dropped.
pub struct ChildProcess {
    label: String,
    child: Child,
}

impl ChildProcess {
    pub fn spawn(label: impl Into<String>, program: &str, args: &[&str]) -> Result<Self, PlatformError> {
        let label = label.into();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| spawn_error(program, err))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_child_lines(stdout, label.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_child_lines(stderr, label.clone(), "stderr"));
        }
        debug!(label = %label, command = %render(program, args), "spawned helper process");
        Ok(Self { label, child })
    }
}

#[async_trait]
impl Resource for ChildProcess {
    fn label(&self) -> &str {
        &self.label
    }

    async fn close(mut self: Box<Self>) -> Result<(), PlatformError> {
        if let Err(err) = self.child.start_kill() {
            // already gone
            if err.kind() != ErrorKind::InvalidInput {
                return Err(PlatformError::Io(err));
            }
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(PlatformError::Io(err)),
            Err(_) => Err(PlatformError::Timeout(format!("waiting for {} to exit", self.label))),
        }
    }

    fn force_close(&mut self) {
        let _ = self.child.start_kill();
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

async fn forward_child_lines<R>(stream: R, label: String, channel: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(label = %label, channel, "{line}"),
            Ok(None) => break,
            Err(err) => {
                warn!(label = %label, channel, error = %err, "failed to read helper output");
                break;
            }
        }
    }
}
