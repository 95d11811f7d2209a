//! Remote command channel.
//!
//! A [`CommandChannel`] runs shell commands on an appliance and moves files
//! to and from it. The production implementation is SSH (see [`ssh`]); tests
//! plug in [`crate::mock::MockChannel`].

pub mod console;
#[cfg(unix)]
pub mod ssh;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ChannelError;
use crate::util::shell_quote;

/// Root of the appliance's Rails application.
pub const VMDB_ROOT: &str = "/var/www/miq/vmdb";

/// Exit status and combined stdout/stderr of a remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_status: i32,
    pub output: String,
}

impl CommandResult {
    pub fn new(exit_status: i32, output: impl Into<String>) -> Self {
        Self {
            exit_status,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    pub fn failed(&self) -> bool {
        !self.success()
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[rc={}] {}", self.exit_status, self.output.trim_end())
    }
}

/// Where and as whom to open a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SshEndpoint {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub identity_file: Option<PathBuf>,
    /// Run every command inside this container on the host.
    pub container: Option<String>,
    /// The container is an OpenShift pod rather than a plain docker container.
    pub is_pod: bool,
}

impl SshEndpoint {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: 22,
            username: username.into(),
            identity_file: None,
            container: None,
            is_pod: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, path: Option<PathBuf>) -> Self {
        self.identity_file = path;
        self
    }

    pub fn with_container(mut self, container: impl Into<String>, is_pod: bool) -> Self {
        self.container = Some(container.into());
        self.is_pod = is_pod;
        self
    }

    /// Wrap a command so it runs inside the configured container, if any.
    pub fn wrap_command(&self, command: &str) -> String {
        self.wrap(command, false)
    }

    /// Like [`wrap_command`](Self::wrap_command), keeping stdin attached.
    pub fn wrap_streaming_command(&self, command: &str) -> String {
        self.wrap(command, true)
    }

    fn wrap(&self, command: &str, stdin: bool) -> String {
        let interactive = if stdin { " -i" } else { "" };
        match (&self.container, self.is_pod) {
            (None, _) => command.to_string(),
            (Some(pod), true) => format!(
                "oc exec{interactive} {pod} -- bash -c {}",
                shell_quote(command)
            ),
            (Some(container), false) => format!(
                "docker exec{interactive} {container} bash -c {}",
                shell_quote(command)
            ),
        }
    }
}

/// Command execution and file transfer against one remote host.
#[async_trait]
pub trait CommandChannel: Send + Sync + fmt::Debug {
    /// Hostname this channel is connected to.
    fn host(&self) -> &str;

    /// Run a shell command. `timeout` bounds the whole command; exceeding it
    /// yields [`ChannelError::Timeout`], not a failed result.
    async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, ChannelError>;

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), ChannelError>;

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), ChannelError>;

    /// Open a long-lived shell for console-style interaction.
    async fn invoke_shell(&self) -> Result<Box<dyn InteractiveChannel>, ChannelError>;
}

/// Raw byte stream to a remote shell.
#[async_trait]
pub trait InteractiveChannel: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError>;

    /// Read whatever is available, waiting at most `timeout`. Returns 0 at EOF.
    async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError>;
}

/// Opens command channels. Lets the appliance model stay transport-agnostic.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, endpoint: &SshEndpoint) -> Result<Arc<dyn CommandChannel>, ChannelError>;
}

/// Appliance-specific conveniences layered on any channel.
#[async_trait]
pub trait ShellExt: CommandChannel {
    /// Run a Ruby snippet or script path through `rails runner`.
    async fn run_rails(&self, script: &str) -> Result<CommandResult, ChannelError> {
        self.run(&format!("cd {VMDB_ROOT}; bin/rails runner {script}"), None)
            .await
    }

    async fn run_rake(&self, task: &str) -> Result<CommandResult, ChannelError> {
        self.run(&format!("cd {VMDB_ROOT}; bin/rake {task}"), None)
            .await
    }

    /// Seconds since boot, from `/proc/uptime`.
    async fn uptime(&self) -> Result<f64, ChannelError> {
        let result = self.run("cat /proc/uptime", None).await?;
        result
            .output
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| ChannelError::Interactive(format!("unparsable uptime: {}", result.output)))
    }

    /// Cat a remote file, returning its contents on success.
    async fn read_remote(&self, path: &str) -> Result<Option<String>, ChannelError> {
        let result = self.run(&format!("cat {}", shell_quote(path)), None).await?;
        Ok(result.success().then_some(result.output))
    }

    async fn remove_remote(&self, path: &str) -> Result<(), ChannelError> {
        self.run(&format!("rm -f {}", shell_quote(path)), None)
            .await
            .map(|_| ())
    }
}

impl<T: CommandChannel + ?Sized> ShellExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_command_plain() {
        let ep = SshEndpoint::new("10.0.0.5", "root");
        assert_eq!(ep.wrap_command("ls /"), "ls /");
    }

    #[test]
    fn test_wrap_command_container_and_pod() {
        let docker = SshEndpoint::new("host", "root").with_container("cfme", false);
        assert_eq!(
            docker.wrap_command("systemctl status evmserverd"),
            "docker exec cfme bash -c 'systemctl status evmserverd'"
        );
        let pod = SshEndpoint::new("host", "root").with_container("cloudforms-0", true);
        assert!(pod.wrap_command("ls").starts_with("oc exec cloudforms-0 -- bash -c"));
    }

    #[test]
    fn test_command_result_display() {
        let r = CommandResult::new(1, "boom\n");
        assert!(r.failed());
        assert_eq!(r.to_string(), "[rc=1] boom");
    }
}
