//! Remote command execution on helper instances over SSH.
//!
//! Commands are passed to the local `ssh` client with the helper's key pair
//! as identity. The remote exit code is preserved in
//! [`RemoteCommandOutput`]; interpreting it is left to callers.

use std::ffi::OsString;

mod config;
mod types;
mod util;

pub use config::{DEFAULT_SSH_PORT, RemoteError, SshConfig, SshConfigLoadError};
pub use types::{
    CommandOutput, CommandRunner, ProcessCommandRunner, RemoteCommandOutput, RemoteTarget,
};
pub use util::expand_tilde;

/// Runs shell commands on a helper instance via the local SSH client.
#[derive(Clone, Debug)]
pub struct RemoteShell<R: CommandRunner> {
    config: SshConfig,
    runner: R,
}

impl RemoteShell<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, RemoteError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> RemoteShell<R> {
    /// Creates a shell using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when configuration validation
    /// fails.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, RemoteError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns the runner used to spawn the SSH client.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Executes `command` on `target` and captures its output.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] when the SSH client cannot be started.
    /// A non-zero remote exit status is not an error at this layer.
    ///
    /// # Security
    ///
    /// `command` is passed verbatim to the remote shell. Callers must quote
    /// any interpolated values.
    pub fn execute(
        &self,
        target: &RemoteTarget,
        command: &str,
    ) -> Result<RemoteCommandOutput, RemoteError> {
        let args = self.build_ssh_args(target, command);
        let output = self.runner.run(&self.config.ssh_bin, &args)?;

        Ok(RemoteCommandOutput {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn build_ssh_args(&self, target: &RemoteTarget, command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.config.ssh_port.to_string()),
            OsString::from("-i"),
            OsString::from(target.identity_file.as_str()),
        ];

        if self.config.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args.push(OsString::from(format!(
            "{}@{}",
            self.config.ssh_user, target.host
        )));
        args.push(OsString::from(command));
        args
    }
}
