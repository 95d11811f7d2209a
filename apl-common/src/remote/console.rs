//! The appliance's own configuration tools: the interactive text console and
//! its scriptable `appliance_console_cli` counterpart.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{CommandChannel, CommandResult, InteractiveChannel};
use crate::errors::{ApplianceError, ChannelError};

/// Printed by the console after every completed action.
pub const CONTINUE_PROMPT: &str = "Press any key to continue";

/// One line typed into the console, with how long to wait for its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleInput {
    pub text: String,
    pub timeout: Option<Duration>,
}

impl ConsoleInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(text: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            timeout: Some(timeout),
        }
    }
}

impl From<&str> for ConsoleInput {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// Drives the interactive `appliance_console` menu over a shell channel.
pub struct ApplianceConsole {
    shell: Box<dyn InteractiveChannel>,
    default_timeout: Duration,
    autoreturn: bool,
}

impl ApplianceConsole {
    pub async fn open(channel: &dyn CommandChannel) -> Result<Self, ChannelError> {
        Ok(Self::from_shell(channel.invoke_shell().await?))
    }

    pub fn from_shell(shell: Box<dyn InteractiveChannel>) -> Self {
        Self {
            shell,
            default_timeout: Duration::from_secs(10),
            autoreturn: true,
        }
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Send input verbatim, without appending a newline.
    pub fn autoreturn(mut self, autoreturn: bool) -> Self {
        self.autoreturn = autoreturn;
        self
    }

    /// Type each input and collect what the console printed back. Each step
    /// ends at the continue prompt or when its timeout passes quietly.
    pub async fn run_commands<I>(&mut self, inputs: I) -> Result<Vec<String>, ChannelError>
    where
        I: IntoIterator,
        I::Item: Into<ConsoleInput>,
    {
        let mut transcripts = Vec::new();
        for input in inputs {
            let input = input.into();
            let mut text = input.text;
            if self.autoreturn {
                text.push('\n');
            }
            self.shell.send(text.as_bytes()).await?;
            let timeout = input.timeout.unwrap_or(self.default_timeout);
            let (output, _) = read_until(self.shell.as_mut(), CONTINUE_PROMPT, timeout).await?;
            debug!(output = %output, "Console output");
            transcripts.push(output);
        }
        Ok(transcripts)
    }
}

/// Read from `shell` until `marker` shows up or `timeout` elapses.
/// Returns the text read and whether the marker was seen.
pub async fn read_until(
    shell: &mut dyn InteractiveChannel,
    marker: &str,
    timeout: Duration,
) -> Result<(String, bool), ChannelError> {
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok((String::from_utf8_lossy(&collected).into_owned(), false));
        }
        match shell.recv(&mut buf, remaining).await {
            Ok(0) => return Ok((String::from_utf8_lossy(&collected).into_owned(), false)),
            Ok(n) => {
                collected.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&collected);
                if text.contains(marker) {
                    return Ok((text.into_owned(), true));
                }
            }
            Err(e) if e.is_timeout() => {
                return Ok((String::from_utf8_lossy(&collected).into_owned(), false));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Credentials for joining or creating an external region database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalDbLogin {
    pub db_hostname: String,
    pub username: String,
    pub password: String,
    pub db_name: String,
    /// Appliance to fetch the encryption key from.
    pub fetch_key: String,
    pub ssh_login: String,
    pub ssh_password: String,
}

impl ExternalDbLogin {
    fn flags(&self) -> String {
        format!(
            "--hostname {} --username {} --password {} --dbname {} --verbose --fetch-key {} --sshlogin {} --sshpassword {}",
            self.db_hostname,
            self.username,
            self.password,
            self.db_name,
            self.fetch_key,
            self.ssh_login,
            self.ssh_password
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpaSettings {
    pub server: String,
    pub principal: String,
    pub password: String,
    pub domain: String,
    pub realm: String,
}

/// Scriptable wrapper for `appliance_console_cli`.
pub struct ApplianceConsoleCli<'a> {
    channel: &'a dyn CommandChannel,
}

impl<'a> ApplianceConsoleCli<'a> {
    pub fn new(channel: &'a dyn CommandChannel) -> Self {
        Self { channel }
    }

    async fn run(&self, args: &str) -> Result<CommandResult, ApplianceError> {
        let result = self
            .channel
            .run(&format!("appliance_console_cli {args}"), None)
            .await?;
        if result.failed() {
            return Err(ApplianceError::lifecycle(
                "appliance_console_cli",
                self.channel.host(),
                result.output,
            ));
        }
        Ok(result)
    }

    async fn check(&self, command: &str, want_success: bool, what: &str) -> Result<(), ApplianceError> {
        let result = self.channel.run(command, None).await?;
        if result.success() != want_success {
            return Err(ApplianceError::lifecycle(what, self.channel.host(), result.output));
        }
        Ok(())
    }

    pub async fn set_hostname(&self, hostname: &str) -> Result<CommandResult, ApplianceError> {
        self.run(&format!("--host {hostname}")).await
    }

    pub async fn configure_external_join(
        &self,
        login: &ExternalDbLogin,
    ) -> Result<CommandResult, ApplianceError> {
        self.run(&login.flags()).await
    }

    pub async fn configure_external_create(
        &self,
        region: u32,
        login: &ExternalDbLogin,
    ) -> Result<CommandResult, ApplianceError> {
        self.run(&format!("--region {region} {}", login.flags())).await
    }

    pub async fn configure_internal_fetch_key(
        &self,
        region: u32,
        login: &ExternalDbLogin,
    ) -> Result<CommandResult, ApplianceError> {
        self.run(&format!("--region {region} --internal {}", login.flags()))
            .await
    }

    /// Join an IPA domain and verify SSSD picked it up.
    pub async fn configure_ipa(&self, ipa: &IpaSettings) -> Result<(), ApplianceError> {
        self.run(&format!(
            "--ipaserver {} --ipaprincipal {} --ipapassword {} --ipadomain {} --iparealm {}",
            ipa.server, ipa.principal, ipa.password, ipa.domain, ipa.realm
        ))
        .await?;
        self.check("systemctl status sssd | grep running", true, "sssd running after IPA join")
            .await?;
        self.check(
            "cat /etc/ipa/default.conf | grep 'enable_ra = True'",
            true,
            "IPA client configuration",
        )
        .await
    }

    pub async fn uninstall_ipa_client(&self) -> Result<(), ApplianceError> {
        self.run("--uninstall-ipa").await?;
        self.check("cat /etc/ipa/default.conf", false, "IPA client removal")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockChannel, MockShell};

    fn login() -> ExternalDbLogin {
        ExternalDbLogin {
            db_hostname: "10.0.0.9".into(),
            username: "root".into(),
            password: "smartvm".into(),
            db_name: "vmdb_production".into(),
            fetch_key: "10.0.0.9".into(),
            ssh_login: "root".into(),
            ssh_password: "pw".into(),
        }
    }

    #[tokio::test]
    async fn test_cli_external_create_flags() {
        let channel = MockChannel::new("10.0.0.5");
        let cli = ApplianceConsoleCli::new(&channel);
        cli.configure_external_create(3, &login()).await.unwrap();

        let cmds = channel.commands();
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].starts_with("appliance_console_cli --region 3 --hostname 10.0.0.9"));
        assert!(cmds[0].contains("--sshpassword pw"));
    }

    #[tokio::test]
    async fn test_cli_failure_is_lifecycle_error() {
        let channel = MockChannel::new("10.0.0.5");
        channel.respond("appliance_console_cli --host", CommandResult::new(1, "bad hostname"));
        let err = ApplianceConsoleCli::new(&channel)
            .set_hostname("bad host")
            .await
            .unwrap_err();
        assert_eq!(err.captured_output(), Some("bad hostname"));
    }

    #[tokio::test]
    async fn test_uninstall_ipa_requires_config_gone() {
        let channel = MockChannel::new("10.0.0.5");
        // default responses succeed, so the config file still "exists"
        let err = ApplianceConsoleCli::new(&channel)
            .uninstall_ipa_client()
            .await
            .unwrap_err();
        assert!(matches!(err, ApplianceError::Lifecycle { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_console_stops_at_prompt() {
        let shell = MockShell::new(vec![
            b"Configuring...\n".to_vec(),
            b"Done. Press any key to continue".to_vec(),
        ]);
        let sent = shell.sent();
        let mut console = ApplianceConsole::from_shell(Box::new(shell));
        let out = console.run_commands(["ap", "1"]).await.unwrap();

        assert!(out[0].contains(CONTINUE_PROMPT));
        // nothing more queued, second step times out quietly
        assert_eq!(out[1], "");
        assert_eq!(sent.lock().unwrap().as_slice(), &[b"ap\n".to_vec(), b"1\n".to_vec()]);
    }
}
