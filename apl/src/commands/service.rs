//! `apl service`

use apl_common::{Appliance, ApplianceError};
use serde::Serialize;

use super::{Output, ServiceAction};

#[derive(Debug, Serialize)]
struct ServiceReport {
    action: ServiceAction,
    rude: bool,
    ok: bool,
}

pub async fn run(
    appliance: &Appliance,
    action: ServiceAction,
    rude: bool,
    out: &Output,
) -> Result<(), ApplianceError> {
    match action {
        ServiceAction::Start => appliance.start_evm_service().await?,
        ServiceAction::Stop => appliance.stop_evm_service().await?,
        ServiceAction::Restart => appliance.restart_evm_service(rude).await?,
    }
    let report = ServiceReport {
        action,
        rude: rude && action == ServiceAction::Restart,
        ok: true,
    };
    out.emit(&report, |r| println!("evmserverd: {:?} ok", r.action));
    Ok(())
}
