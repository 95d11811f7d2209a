//! Readiness predicates and the waits built on them.
//!
//! Predicates answer "is the appliance in this state right now". They never
//! fail for "not yet": a refused connection or a non-zero exit is `false`.
//! The `wait_for_*` methods poll them through [`WaitFor`].

use chrono::NaiveDateTime;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info};

use super::Appliance;
use super::properties::{POSTGRES_SCL, compile};
use crate::errors::ApplianceError;
use crate::remote::VMDB_ROOT;
use crate::wait::WaitFor;

/// Result of the triple-sampled web UI probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebUiState {
    /// All samples answered 200.
    Running,
    /// No sample answered 200.
    NotRunning,
    /// The samples disagreed.
    Unsure,
}

impl WebUiState {
    pub const SAMPLES: usize = 3;

    pub fn from_samples(up: usize, total: usize) -> Self {
        match up {
            0 => Self::NotRunning,
            n if n == total => Self::Running,
            _ => Self::Unsure,
        }
    }
}

/// Log lines from the periodic API poller, which do not count as activity.
const API_NOISE: &str = r#"(Processing by Api::ApiController\#index as JSON|Started GET "/api" for 127.0.0.1|Completed 200 OK in)"#;

const LOG_TIMESTAMP: &str = r"\[(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})(?:\.\d+)?";

/// Idle verdict from the newest relevant log line.
///
/// No line at all means nothing ever happened, which is idle. A line without
/// a recognisable timestamp cannot be judged and is reported as busy.
pub fn idle_verdict(
    now: NaiveDateTime,
    last_line: Option<&str>,
    idle_time: Duration,
) -> Result<bool, ApplianceError> {
    let Some(line) = last_line.filter(|l| !l.trim().is_empty()) else {
        return Ok(true);
    };
    let pattern = compile(LOG_TIMESTAMP)?;
    let Some(stamp) = pattern
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| NaiveDateTime::parse_from_str(m.as_str(), "%Y-%m-%dT%H:%M:%S").ok())
    else {
        debug!(line, "Unrecognised log timestamp, assuming busy");
        return Ok(false);
    };
    let quiet_for = now.signed_duration_since(stamp);
    Ok(quiet_for.num_seconds() >= idle_time.as_secs() as i64)
}

impl Appliance {
    /// TCP probe of the SSH port.
    pub async fn is_ssh_running(&self) -> bool {
        let Ok(address) = self.address().await else {
            return false;
        };
        self.reachability
            .port_open(
                &address,
                self.config.credentials.ssh.port,
                self.config.timeouts.tcp_probe(),
            )
            .await
    }

    /// One HTTP probe of the UI base URL. Only status 200 counts as up.
    pub async fn web_ui_probe_once(&self) -> bool {
        let url = match self.url().await {
            Ok(url) => url,
            Err(e) => {
                debug!(appliance = %self, error = %e, "No URL to probe");
                return false;
            }
        };
        match self
            .reachability
            .http_status(&url, self.config.timeouts.http_probe())
            .await
        {
            Ok(200) => true,
            Ok(status) => {
                debug!(appliance = %self, status, "Web UI answered but is not ready");
                false
            }
            Err(e) => {
                debug!(appliance = %self, error = %e, "Web UI probe failed");
                false
            }
        }
    }

    /// Probe the UI three times with a short pause between samples.
    pub async fn is_web_ui_running(&self) -> WebUiState {
        let interval = self.config.timeouts.web_ui_sample_interval();
        let mut up = 0;
        for sample in 0..WebUiState::SAMPLES {
            if sample > 0 {
                tokio::time::sleep(interval).await;
            }
            if self.web_ui_probe_once().await {
                up += 1;
            }
        }
        let state = WebUiState::from_samples(up, WebUiState::SAMPLES);
        debug!(appliance = %self, up, ?state, "Web UI sampled");
        state
    }

    async fn probe(&self, command: &str) -> bool {
        match self.run(command).await {
            Ok(result) => result.success(),
            Err(e) => {
                debug!(appliance = %self, error = %e, "Probe could not run");
                false
            }
        }
    }

    async fn db_probe(&self, command: &str) -> bool {
        let client = match self.db_ssh_client().await {
            Ok(client) => client,
            Err(e) => {
                debug!(appliance = %self, error = %e, "No channel to the database host");
                return false;
            }
        };
        match client.run(command, None).await {
            Ok(result) => result.success(),
            Err(e) => {
                debug!(appliance = %self, error = %e, "Database probe could not run");
                false
            }
        }
    }

    pub async fn is_evm_service_running(&self) -> bool {
        self.probe("systemctl status evmserverd").await
    }

    pub async fn db_online(&self) -> bool {
        self.db_probe(r#"psql -U postgres -t  -c "select now()" postgres"#)
            .await
    }

    pub async fn db_has_database(&self) -> bool {
        self.db_probe(
            r#"psql -U postgres -t  -c "SELECT datname FROM pg_database WHERE datname LIKE 'vmdb_%';" postgres | grep -q vmdb_production"#,
        )
        .await
    }

    pub async fn db_has_tables(&self) -> bool {
        self.db_probe(
            r#"psql -U postgres -t  -c "SELECT * FROM information_schema.tables WHERE table_schema = 'public';" vmdb_production | grep -q vmdb_production"#,
        )
        .await
    }

    /// Online, has the database, has tables. Stops at the first `false`.
    pub async fn is_db_ready(&self) -> bool {
        self.db_online().await && self.db_has_database().await && self.db_has_tables().await
    }

    /// The PostgreSQL unit reports running on this machine.
    pub async fn is_dedicated_db_active(&self) -> bool {
        self.probe(&format!(
            "systemctl status {POSTGRES_SCL}-postgresql.service | grep running"
        ))
        .await
    }

    pub async fn is_supervisord_running(&self) -> bool {
        self.probe("systemctl status supervisord").await
    }

    pub async fn is_embedded_ansible_role_enabled(&self) -> Result<bool, ApplianceError> {
        let roles = self.server_roles().await?;
        Ok(roles.get("embedded_ansible").copied().unwrap_or(false))
    }

    pub async fn is_embedded_ansible_running(&self) -> Result<bool, ApplianceError> {
        Ok(self.is_embedded_ansible_role_enabled().await? && self.is_supervisord_running().await)
    }

    /// No user-driven activity in the production log for `idle_time`.
    pub async fn is_idle(&self, idle_time: Duration) -> Result<bool, ApplianceError> {
        let now = self.run_checked("read clock", "date -u '+%Y-%m-%dT%H:%M:%S'").await?;
        let now = NaiveDateTime::parse_from_str(now.output.trim(), "%Y-%m-%dT%H:%M:%S")
            .map_err(|e| self.lifecycle_error("parse clock", &format!("{e}: {}", now.output)))?;
        let last = self
            .run(&format!(
                "egrep -v '{API_NOISE}' {VMDB_ROOT}/log/production.log | tail -1"
            ))
            .await?;
        let last_line = last.success().then(|| last.output.trim().to_string());
        idle_verdict(now, last_line.as_deref(), idle_time)
    }

    /// Wait for the SSH port. Defaults to the configured SSH timeout.
    pub async fn wait_for_ssh(&self, timeout: Option<Duration>) -> Result<(), ApplianceError> {
        WaitFor::new("appliance.is_ssh_running")
            .delay(Duration::from_secs(5))
            .timeout(timeout.unwrap_or(self.config.timeouts.ssh()))
            .until(|| async move { Ok::<_, Infallible>(self.is_ssh_running().await) })
            .await?;
        Ok(())
    }

    pub async fn wait_for_db(&self, timeout: Option<Duration>) -> Result<(), ApplianceError> {
        WaitFor::new("appliance.is_db_ready")
            .delay(Duration::from_secs(20))
            .timeout(timeout.unwrap_or(self.config.timeouts.db()))
            .until(|| async move { Ok::<_, Infallible>(self.is_db_ready().await) })
            .await?;
        Ok(())
    }

    pub async fn wait_for_evm_service(&self, timeout: Option<Duration>) -> Result<(), ApplianceError> {
        info!(appliance = %self, "Waiting for evmserverd to be running");
        WaitFor::new("appliance.is_evm_service_running")
            .delay(Duration::from_secs(10))
            .timeout(timeout.unwrap_or(self.config.timeouts.evm()))
            .until_not(false, || async move {
                Ok::<_, Infallible>(self.is_evm_service_running().await)
            })
            .await?;
        Ok(())
    }

    /// Wait for the UI to appear (`running`) or to go away (`!running`).
    pub async fn wait_for_web_ui(
        &self,
        running: bool,
        timeout: Option<Duration>,
    ) -> Result<(), ApplianceError> {
        let prefix = if running { "" } else { "dis" };
        info!(appliance = %self, "Waiting for web UI to {prefix}appear");
        WaitFor::new(format!("web UI to {prefix}appear"))
            .delay(Duration::from_secs(10))
            .timeout(timeout.unwrap_or(self.config.timeouts.web_ui()))
            .until_not(!running, || async move {
                Ok::<_, Infallible>(self.web_ui_probe_once().await)
            })
            .await?;
        Ok(())
    }

    pub async fn wait_for_embedded_ansible(&self, timeout: Option<Duration>) -> Result<(), ApplianceError> {
        WaitFor::new("appliance.is_embedded_ansible_running")
            .delay(Duration::from_secs(60))
            .timeout(timeout.unwrap_or(Duration::from_secs(900)))
            .handle_exception(true)
            .until(|| async move {
                // Roles are re-read on every attempt.
                self.server_details_changed();
                self.is_embedded_ansible_running().await
            })
            .await?;
        Ok(())
    }
}
