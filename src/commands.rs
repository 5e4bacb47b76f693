use std::ffi::{OsStr, OsString};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use subprocess::{Exec, ExitStatus, Redirection};
use thiserror::Error;
use tracing::{debug, info};

/// Options applied to every ssh invocation. Nodes are probed before
/// they appear in `known_hosts` and nothing here is interactive.
const SSH_OPTS: &[&str] = &[
    "-o",
    "BatchMode=yes",
    "-o",
    "StrictHostKeyChecking=accept-new",
];

/// An external command, optionally executed on a remote node over ssh.
///
/// When `script` is attached the command reads it from stdin, which is
/// how local shell snippets are streamed to a remote `bash -s` without
/// ever landing on the remote disk.
#[derive(Debug)]
pub struct Command {
    message: Option<String>,
    command: OsString,
    args: Vec<OsString>,
    ssh: Option<String>,
    script: Option<String>,
    show_output: bool,
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(command: S) -> Self {
        Self {
            message: None,
            command: command.as_ref().to_os_string(),
            args: vec![],
            ssh: None,
            script: None,
            show_output: false,
        }
    }

    /// Set the `user@host` target for remote execution.
    #[must_use]
    pub fn ssh<S: AsRef<str>>(mut self, target: S) -> Self {
        self.ssh = Some(target.as_ref().to_string());
        self
    }

    /// Attach data to be fed to the command over stdin.
    #[must_use]
    pub fn script<S: AsRef<str>>(mut self, script: S) -> Self {
        self.script = Some(script.as_ref().to_string());
        self
    }

    /// Set whether command output passes through to the terminal.
    #[must_use]
    pub fn show_output(mut self, show_output: bool) -> Self {
        self.show_output = show_output;
        self
    }

    /// Add a single argument to the command.
    #[must_use]
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Add multiple arguments to the command.
    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<OsStr>,
    {
        for elem in args {
            self.args.push(elem.as_ref().to_os_string());
        }
        self
    }

    /// Set a message to display before running the command.
    #[must_use]
    pub fn message<S: AsRef<str>>(mut self, message: S) -> Self {
        self.message = Some(message.as_ref().to_string());
        self
    }

    fn build_exec(&self) -> Exec {
        let cmd = match &self.ssh {
            Some(target) => {
                let mut remote =
                    self.command.to_string_lossy().into_owned();
                for arg in &self.args {
                    remote.push(' ');
                    remote.push_str(&arg.to_string_lossy());
                }
                Exec::cmd("ssh")
                    .arg("-T")
                    .args(SSH_OPTS)
                    .arg(target)
                    .arg(remote)
            }
            None => Exec::cmd(&self.command).args(&self.args),
        };
        match &self.script {
            Some(script) => cmd.stdin(script.as_str()),
            None => cmd,
        }
    }

    /// Run the command, failing on any non-zero exit status.
    pub fn run(&self) -> Result<()> {
        if let Some(m) = &self.message {
            info!("{m}");
        }

        let cmd = self.build_exec();
        let cmd = if self.show_output {
            cmd.stderr(Redirection::Merge)
        } else {
            cmd.stderr(Redirection::Pipe).stdout(Redirection::None)
        };
        debug!(?cmd);

        let msg = self
            .message
            .clone()
            .unwrap_or_else(|| "Command failed".to_string());

        match cmd.capture() {
            Ok(capture) => {
                let status = &capture.exit_status;
                if !status.success() {
                    let stderr = capture.stderr_str();
                    if stderr.trim().is_empty() {
                        bail!("{msg} (exit status {status:?})");
                    }
                    bail!(
                        "{msg} (exit status {status:?})\nstderr:\n{stderr}"
                    );
                }
                Ok(())
            }
            Err(e) => Err(e).wrap_err(msg),
        }
    }

    /// Run the command and capture its stdout, failing on any non-zero
    /// exit status.
    pub fn run_capture(&self) -> Result<String> {
        if let Some(m) = &self.message {
            info!("{m}");
        }

        let cmd = self
            .build_exec()
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe);
        debug!(?cmd);

        let msg = self
            .message
            .clone()
            .unwrap_or_else(|| "Command failed".to_string());

        let capture = cmd.capture().wrap_err_with(|| msg.clone())?;
        let status = &capture.exit_status;
        if !status.success() {
            bail!(
                "{msg} (exit status {status:?})\nstderr:\n{}",
                capture.stderr_str()
            );
        }
        Ok(capture.stdout_str())
    }

    /// Run the command and return the raw exit code. Used where the
    /// exit code itself carries protocol meaning, such as the remote
    /// switch contract.
    pub fn run_code(&self) -> Result<u32> {
        if let Some(m) = &self.message {
            info!("{m}");
        }

        // Output passes through so remote activation logs stay visible.
        let cmd = self.build_exec();
        debug!(?cmd);

        match cmd.join().wrap_err("Failed to execute command")? {
            ExitStatus::Exited(code) => Ok(code),
            other => bail!(ExitError(other)),
        }
    }
}

#[derive(Debug, Error)]
#[error("Command exited with status {0:?}")]
pub struct ExitError(ExitStatus);
