//! Partitioning and formatting of the attached device over SSH.

use std::borrow::Cow;

use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{info, warn};

use crate::device::first_partition;
use crate::remote::{CommandRunner, RemoteCommandOutput, RemoteError, RemoteShell, RemoteTarget};

/// Errors raised while preparing the device on the helper.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DiskError {
    /// The SSH client could not be started.
    #[error("failed to run {program} on the helper: {source}")]
    Remote {
        /// Remote program that was being run.
        program: String,
        /// Underlying remote execution error.
        #[source]
        source: RemoteError,
    },
    /// The remote command ran but did not succeed.
    #[error("{}", command_failure_message(.program, *.status, .stderr))]
    CommandFailed {
        /// Remote program that failed.
        program: String,
        /// Exit status, when one was reported.
        status: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
}

fn command_failure_message(program: &str, status: Option<i32>, stderr: &str) -> String {
    let stderr = stderr.trim();
    match status {
        Some(code) if stderr.is_empty() => format!("{program} exited with status {code}"),
        Some(code) => format!("{program} exited with status {code}: {stderr}"),
        None if stderr.is_empty() => format!("{program} terminated without an exit status"),
        None => format!("{program} terminated without an exit status: {stderr}"),
    }
}

/// Builds the command that writes a single Linux partition spanning `device`.
#[must_use]
pub fn partition_command(device: &str) -> String {
    format!("echo ',,L' | sfdisk {}", escape(Cow::Borrowed(device)))
}

/// Builds the command that creates a `filesystem` on the first partition of
/// `device`. Both the `mkfs` program name and the partition are quoted.
#[must_use]
pub fn format_command(filesystem: &str, device: &str) -> String {
    let program = mkfs_program(filesystem);
    let partition = first_partition(device);
    format!(
        "{} {}",
        escape(Cow::Owned(program)),
        escape(Cow::Owned(partition))
    )
}

fn mkfs_program(filesystem: &str) -> String {
    format!("mkfs.{}", filesystem.trim())
}

/// Runs disk preparation commands on a helper instance.
#[derive(Debug)]
pub struct RemoteDiskInitializer<'a, R: CommandRunner> {
    shell: &'a RemoteShell<R>,
    target: RemoteTarget,
    filesystem: String,
}

impl<'a, R: CommandRunner> RemoteDiskInitializer<'a, R> {
    /// Creates an initializer that runs commands on `target`.
    pub fn new(shell: &'a RemoteShell<R>, target: RemoteTarget, filesystem: impl Into<String>) -> Self {
        Self {
            shell,
            target,
            filesystem: filesystem.into(),
        }
    }

    /// Writes a partition table with one partition covering `device`.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError`] when `sfdisk` cannot run or fails.
    pub fn partition(&self, device: &str) -> Result<(), DiskError> {
        info!(host = %self.target.host, device, "partitioning device");
        self.run("sfdisk", &partition_command(device))
    }

    /// Creates the configured filesystem on the first partition of `device`.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError`] when `mkfs` cannot run or fails.
    pub fn format_partition(&self, device: &str) -> Result<(), DiskError> {
        let program = mkfs_program(&self.filesystem);
        info!(
            host = %self.target.host,
            partition = %first_partition(device),
            filesystem = %self.filesystem,
            "formatting partition"
        );
        self.run(&program, &format_command(&self.filesystem, device))
    }

    fn run(&self, program: &str, command: &str) -> Result<(), DiskError> {
        let output = self
            .shell
            .execute(&self.target, command)
            .map_err(|source| DiskError::Remote {
                program: program.to_owned(),
                source,
            })?;
        log_output(program, &output);
        if output.is_success() {
            return Ok(());
        }
        Err(DiskError::CommandFailed {
            program: program.to_owned(),
            status: output.exit_code,
            stderr: output.stderr,
        })
    }
}

fn log_output(program: &str, output: &RemoteCommandOutput) {
    for line in output.stdout.lines().filter(|line| !line.trim().is_empty()) {
        info!(program, "{line}");
    }
    for line in output.stderr.lines().filter(|line| !line.trim().is_empty()) {
        warn!(program, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::SshConfig;
    use crate::test_support::ScriptedRunner;
    use camino::Utf8PathBuf;
    use rstest::{fixture, rstest};

    #[fixture]
    fn shell() -> RemoteShell<ScriptedRunner> {
        let config = SshConfig {
            ssh_bin: String::from("ssh"),
            ssh_user: String::from("root"),
            ssh_port: 22,
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
        };
        RemoteShell::new(config, ScriptedRunner::new())
            .unwrap_or_else(|err| panic!("shell: {err}"))
    }

    fn target() -> RemoteTarget {
        RemoteTarget {
            host: String::from("helper.example"),
            identity_file: Utf8PathBuf::from("/keys/helper.pem"),
        }
    }

    #[test]
    fn partition_command_pipes_layout_into_sfdisk() {
        assert_eq!(partition_command("/dev/sdz"), "echo ',,L' | sfdisk /dev/sdz");
    }

    #[rstest]
    #[case("ext3", "mkfs.ext3 /dev/sdz1")]
    #[case("ext4", "mkfs.ext4 /dev/sdz1")]
    fn format_command_targets_first_partition(#[case] filesystem: &str, #[case] expected: &str) {
        assert_eq!(format_command(filesystem, "/dev/sdz"), expected);
    }

    #[test]
    fn format_command_quotes_the_filesystem_name() {
        assert_eq!(
            format_command("ext4; reboot", "/dev/sdz"),
            "'mkfs.ext4; reboot' /dev/sdz1"
        );
    }

    #[rstest]
    fn partition_and_format_run_in_order(shell: RemoteShell<ScriptedRunner>) {
        let runner = shell_runner(&shell);
        runner.push_output(Some(0), "Device Boot Start End\n", "");
        runner.push_success();
        let disk = RemoteDiskInitializer::new(&shell, target(), "ext3");

        disk.partition("/dev/sdz")
            .unwrap_or_else(|err| panic!("partition: {err}"));
        disk.format_partition("/dev/sdz")
            .unwrap_or_else(|err| panic!("format: {err}"));

        let commands: Vec<String> = runner
            .invocations()
            .iter()
            .map(|call| call.command_string())
            .collect();
        let [partition, format] = commands.as_slice() else {
            panic!("expected two commands, got {commands:?}");
        };
        assert!(partition.ends_with("echo ',,L' | sfdisk /dev/sdz"));
        assert!(format.ends_with("mkfs.ext3 /dev/sdz1"));
    }

    #[rstest]
    fn failing_command_reports_status_and_stderr(shell: RemoteShell<ScriptedRunner>) {
        let runner = shell_runner(&shell);
        runner.push_output(Some(1), "", "sfdisk: cannot open /dev/sdz\n");
        let disk = RemoteDiskInitializer::new(&shell, target(), "ext3");

        let err = disk
            .partition("/dev/sdz")
            .expect_err("partition should fail");
        assert_eq!(
            err.to_string(),
            "sfdisk exited with status 1: sfdisk: cannot open /dev/sdz"
        );
    }

    #[rstest]
    fn missing_status_is_a_failure(shell: RemoteShell<ScriptedRunner>) {
        let runner = shell_runner(&shell);
        runner.push_missing_exit_code();
        let disk = RemoteDiskInitializer::new(&shell, target(), "ext3");

        let err = disk
            .format_partition("/dev/sdz")
            .expect_err("format should fail");
        assert!(matches!(
            err,
            DiskError::CommandFailed { status: None, .. }
        ));
    }

    fn shell_runner(shell: &RemoteShell<ScriptedRunner>) -> ScriptedRunner {
        shell.runner().clone()
    }
}
