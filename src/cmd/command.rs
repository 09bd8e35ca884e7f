use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use itertools::Itertools;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("Error while executing command")]
    ExecutionError(#[from] std::io::Error),

    #[error("Command terminated with a non success exit status code: {0}")]
    ExitStatusError(ExitStatus),

    #[error("Command killed due to timeout: {0}")]
    TimeoutError(String),
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 5);

/// External command with captured line-oriented output and a hard timeout.
pub struct HostCommand {
    command: Command,
    description: String,
    timeout: Duration,
}

impl HostCommand {
    pub fn new<P: AsRef<OsStr>>(binary: P, args: &[&str], envs: &[(&str, &str)]) -> HostCommand {
        let description = command_to_string(&binary, args, envs);
        let mut command = Command::new(binary);
        command.args(args);
        for (key, value) in envs {
            command.env(key, value);
        }
        command.kill_on_drop(true);

        HostCommand {
            command,
            description,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub async fn exec(&mut self) -> Result<(), CommandError> {
        self.exec_with_output(&mut |line| info!("{}", line), &mut |line| warn!("{}", line))
            .await
    }

    /// Runs the command to completion, feeding stdout and stderr lines to the
    /// given callbacks. Returns an error on non-zero exit or timeout.
    pub async fn exec_with_output<STDOUT, STDERR>(
        &mut self,
        stdout_output: &mut STDOUT,
        stderr_output: &mut STDERR,
    ) -> Result<(), CommandError>
    where
        STDOUT: FnMut(String),
        STDERR: FnMut(String),
    {
        debug!("command: {}", self.description);
        let mut child = self
            .command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            CommandError::ExecutionError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "Cannot get stdout for command",
            ))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            CommandError::ExecutionError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "Cannot get stderr for command",
            ))
        })?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let drain = async {
            let mut stdout_closed = false;
            let mut stderr_closed = false;
            while !stdout_closed || !stderr_closed {
                tokio::select! {
                    line = stdout_reader.next_line(), if !stdout_closed => match line {
                        Ok(Some(line)) => stdout_output(line),
                        Ok(None) => stdout_closed = true,
                        Err(err) => {
                            error!("Error on stdout of cmd {}: {:?}", self.description, err);
                            stdout_closed = true;
                        }
                    },
                    line = stderr_reader.next_line(), if !stderr_closed => match line {
                        Ok(Some(line)) => stderr_output(line),
                        Ok(None) => stderr_closed = true,
                        Err(err) => {
                            error!("Error on stderr of cmd {}: {:?}", self.description, err);
                            stderr_closed = true;
                        }
                    },
                }
            }
            child.wait().await
        };

        let exit_status = match tokio::time::timeout(self.timeout, drain).await {
            Ok(exit_status) => exit_status?,
            Err(_) => {
                let msg = format!("Killing process {} due to timeout {:?}", self.description, self.timeout);
                warn!("{}", msg);
                let _ = child.kill().await;
                return Err(CommandError::TimeoutError(msg));
            }
        };

        if !exit_status.success() {
            debug!(
                "command: {} terminated with error exit status {:?}",
                self.description, exit_status
            );
            return Err(CommandError::ExitStatusError(exit_status));
        }

        Ok(())
    }
}

pub fn command_to_string<P>(binary: P, args: &[&str], envs: &[(&str, &str)]) -> String
where
    P: AsRef<OsStr>,
{
    let envs = envs.iter().map(|(k, v)| format!("{k}={v}")).join(" ");
    format!("{} {:?} {}", envs, binary.as_ref(), args.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_ok() {
        let mut cmd = HostCommand::new("sh", &["-c", "echo hello"], &[]);
        let mut lines = vec![];
        let ret = cmd.exec_with_output(&mut |line| lines.push(line), &mut |_| {}).await;
        assert!(ret.is_ok());
        assert_eq!(lines, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_command_error_status() {
        let mut cmd = HostCommand::new("false", &[], &[]);
        assert!(matches!(cmd.exec().await, Err(CommandError::ExitStatusError(_))));
    }

    #[tokio::test]
    async fn test_command_with_timeout() {
        let mut cmd = HostCommand::new("sleep", &["120"], &[]);
        cmd.set_timeout(Duration::from_secs(1));
        let ret = cmd.exec_with_output(&mut |_| {}, &mut |_| {}).await;
        assert!(matches!(ret, Err(CommandError::TimeoutError(_))));

        let mut cmd = HostCommand::new("sleep", &["0"], &[]);
        cmd.set_timeout(Duration::from_secs(5));
        assert!(cmd.exec_with_output(&mut |_| {}, &mut |_| {}).await.is_ok());
    }

    #[tokio::test]
    async fn test_command_captures_stderr() {
        let mut cmd = HostCommand::new("sh", &["-c", "echo oops >&2"], &[]);
        let mut errs = vec![];
        let ret = cmd.exec_with_output(&mut |_| {}, &mut |line| errs.push(line)).await;
        assert!(ret.is_ok());
        assert_eq!(errs, vec!["oops".to_string()]);
    }
}
