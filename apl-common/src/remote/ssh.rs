//! SSH transport backed by OpenSSH multiplexed sessions.

use async_trait::async_trait;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{CommandChannel, CommandResult, Connector, InteractiveChannel, SshEndpoint};
use crate::errors::ChannelError;
use crate::util::{mask_sensitive_command, shell_quote};

/// Opens [`SshChannel`]s with a bounded connect time.
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, endpoint: &SshEndpoint) -> Result<Arc<dyn CommandChannel>, ChannelError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(endpoint.username.clone())
            .port(endpoint.port)
            .connect_timeout(self.connect_timeout)
            .known_hosts_check(KnownHosts::Accept);
        if let Some(key) = &endpoint.identity_file {
            builder.keyfile(key);
        }

        info!(
            host = %endpoint.hostname,
            port = endpoint.port,
            user = %endpoint.username,
            container = ?endpoint.container,
            "Opening SSH session"
        );
        let session = builder
            .connect(&endpoint.hostname)
            .await
            .map_err(|e| ChannelError::Connect {
                host: endpoint.hostname.clone(),
                message: e.to_string(),
            })?;

        Ok(Arc::new(SshChannel {
            endpoint: endpoint.clone(),
            session: Arc::new(session),
        }))
    }
}

/// A live SSH session to one host.
#[derive(Debug)]
pub struct SshChannel {
    endpoint: SshEndpoint,
    session: Arc<Session>,
}

impl SshChannel {
    fn session_error(&self, e: openssh::Error) -> ChannelError {
        ChannelError::Connect {
            host: self.endpoint.hostname.clone(),
            message: e.to_string(),
        }
    }

    fn transfer_error(&self, from: &str, to: &str, message: impl Into<String>) -> ChannelError {
        ChannelError::Transfer {
            from: from.to_string(),
            to: to.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl CommandChannel for SshChannel {
    fn host(&self) -> &str {
        &self.endpoint.hostname
    }

    async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, ChannelError> {
        let wrapped = self.endpoint.wrap_command(command);
        debug!(
            host = %self.endpoint.hostname,
            command = %mask_sensitive_command(&wrapped),
            "Running remote command"
        );

        let mut remote = self.session.shell(&wrapped);
        let fut = remote.output();
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| ChannelError::Timeout {
                    host: self.endpoint.hostname.clone(),
                    command: mask_sensitive_command(command),
                    timeout: limit,
                })?,
            None => fut.await,
        }
        .map_err(|e| self.session_error(e))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let exit_status = output.status.code().unwrap_or(-1);
        debug!(host = %self.endpoint.hostname, exit_status, bytes = text.len(), "Remote command finished");
        Ok(CommandResult::new(exit_status, text))
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), ChannelError> {
        let local_name = local.display().to_string();
        let data = tokio::fs::read(local).await?;
        debug!(host = %self.endpoint.hostname, local = %local_name, remote, bytes = data.len(), "Uploading file");

        let command = self
            .endpoint
            .wrap_streaming_command(&format!("cat > {}", shell_quote(remote)));
        let mut child = self
            .session
            .shell(&command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .await
            .map_err(|e| self.session_error(e))?;

        let Some(mut stdin) = child.stdin().take() else {
            return Err(self.transfer_error(&local_name, remote, "stdin not captured"));
        };
        stdin.write_all(&data).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let status = child.wait().await.map_err(|e| self.session_error(e))?;
        if !status.success() {
            return Err(self.transfer_error(
                &local_name,
                remote,
                format!("remote write exited with {:?}", status.code()),
            ));
        }
        Ok(())
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), ChannelError> {
        let local_name = local.display().to_string();
        let command = self
            .endpoint
            .wrap_command(&format!("cat {}", shell_quote(remote)));
        let output = self
            .session
            .shell(&command)
            .output()
            .await
            .map_err(|e| self.session_error(e))?;
        if !output.status.success() {
            return Err(self.transfer_error(
                remote,
                &local_name,
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        tokio::fs::write(local, &output.stdout).await?;
        debug!(host = %self.endpoint.hostname, remote, local = %local_name, bytes = output.stdout.len(), "Downloaded file");
        Ok(())
    }

    async fn invoke_shell(&self) -> Result<Box<dyn InteractiveChannel>, ChannelError> {
        let command = self.endpoint.wrap_streaming_command("bash -s");
        let mut shell = self.session.clone().arc_command("bash");
        shell
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = shell.spawn().await.map_err(|e| self.session_error(e))?;

        let stdin = child.stdin().take();
        let stdout = child.stdout().take();
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => Ok(Box::new(SshShell {
                host: self.endpoint.hostname.clone(),
                _child: child,
                stdin,
                stdout,
            })),
            _ => {
                warn!(host = %self.endpoint.hostname, "Interactive shell missing stdio handles");
                Err(ChannelError::Interactive(
                    "shell stdio was not captured".to_string(),
                ))
            }
        }
    }
}

struct SshShell {
    host: String,
    _child: openssh::Child<Arc<Session>>,
    stdin: openssh::ChildStdin,
    stdout: openssh::ChildStdout,
}

#[async_trait]
impl InteractiveChannel for SshShell {
    async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.stdin.write_all(data).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        tokio::time::timeout(timeout, self.stdout.read(buf))
            .await
            .map_err(|_| ChannelError::Timeout {
                host: self.host.clone(),
                command: "<interactive shell>".to_string(),
                timeout,
            })?
            .map_err(ChannelError::from)
    }
}
