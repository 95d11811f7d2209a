//! `apl status`, `apl roles` and `apl diagnose`.

use std::collections::BTreeMap;

use apl_common::{Appliance, ApplianceError, WebUiState};
use serde::Serialize;
use tracing::debug;

use super::Output;
use super::helpers::{indent_lines, yes_no};

#[derive(Debug, Serialize)]
struct StatusReport {
    address: String,
    version: Option<String>,
    ssh: bool,
    db_ready: bool,
    db_internal: Option<bool>,
    evm_service: bool,
    web_ui: WebUiState,
    server_name: Option<String>,
    region: Option<i64>,
}

/// Every probe runs even when earlier ones fail; facts that need SSH or the
/// database come back as `None` when unavailable.
pub async fn status(appliance: &Appliance, out: &Output) -> Result<(), ApplianceError> {
    let address = appliance.address().await?;
    let ssh = appliance.is_ssh_running().await;
    let version = if ssh {
        appliance.version().await.ok().map(|v| v.to_string())
    } else {
        None
    };
    let db_ready = ssh && appliance.is_db_ready().await;
    let (server_name, region) = if db_ready {
        match appliance.configuration_details().await {
            Ok(Some(identity)) => (Some(identity.name), Some(identity.region)),
            Ok(None) => (None, None),
            Err(e) => {
                debug!(error = %e, "Server identity unavailable");
                (None, None)
            }
        }
    } else {
        (None, None)
    };
    let report = StatusReport {
        address,
        version,
        ssh,
        db_ready,
        db_internal: appliance.is_db_internal().await.ok(),
        evm_service: appliance.is_evm_service_running().await,
        web_ui: appliance.is_web_ui_running().await,
        server_name,
        region,
    };
    out.emit(&report, |r| {
        println!("Appliance:    {}", r.address);
        println!("Version:      {}", r.version.as_deref().unwrap_or("unknown"));
        println!("SSH:          {}", yes_no(r.ssh));
        println!("Database:     {}", yes_no(r.db_ready));
        if let Some(internal) = r.db_internal {
            println!("DB location:  {}", if internal { "internal" } else { "external" });
        }
        println!("EVM service:  {}", yes_no(r.evm_service));
        println!("Web UI:       {:?}", r.web_ui);
        if let Some(name) = &r.server_name {
            println!("Server:       {name}");
        }
        if let Some(region) = r.region {
            println!("Region:       {region}");
        }
    });
    Ok(())
}

#[derive(Debug, Serialize)]
struct RolesReport {
    changed: bool,
    roles: BTreeMap<String, bool>,
}

pub async fn roles(
    appliance: &Appliance,
    set: Option<Vec<String>>,
    out: &Output,
) -> Result<(), ApplianceError> {
    let mut roles = appliance.server_roles().await?;
    let mut changed = false;
    if let Some(wanted) = set {
        for name in &wanted {
            if !roles.contains_key(name.as_str()) {
                return Err(ApplianceError::Unsupported(format!("unknown server role: {name}")));
            }
        }
        for (name, active) in roles.iter_mut() {
            *active = wanted.contains(name);
        }
        changed = appliance.set_server_roles(&roles).await?;
        roles = appliance.server_roles().await?;
    }
    let report = RolesReport { changed, roles };
    out.emit(&report, |r| {
        for (name, active) in &r.roles {
            println!("{} {name}", if *active { "[x]" } else { "[ ]" });
        }
        if r.changed {
            println!("Roles updated.");
        }
    });
    Ok(())
}

#[derive(Debug, Serialize)]
struct DiagnoseReport {
    healthy: bool,
    finding: Option<String>,
}

pub async fn diagnose(appliance: &Appliance, out: &Output) -> Result<(), ApplianceError> {
    let finding = appliance.diagnose_evm_failure().await?;
    let report = DiagnoseReport {
        healthy: finding.is_none(),
        finding,
    };
    out.emit(&report, |r| match &r.finding {
        Some(finding) => println!("Problem found:\n{}", indent_lines(finding, "  ")),
        None => println!("No problem found; evmserverd restarted cleanly."),
    });
    Ok(())
}
