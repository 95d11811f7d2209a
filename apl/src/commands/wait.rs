//! `apl wait`

use std::time::{Duration, Instant};

use apl_common::{Appliance, ApplianceError};
use serde::Serialize;
use tracing::info;

use super::helpers::humanize_duration;
use super::{Output, WaitTarget};

#[derive(Debug, Serialize)]
struct WaitReport {
    target: WaitTarget,
    elapsed_secs: u64,
}

pub async fn run(
    appliance: &Appliance,
    target: WaitTarget,
    timeout_secs: Option<u64>,
    out: &Output,
) -> Result<(), ApplianceError> {
    let timeout = timeout_secs.map(Duration::from_secs);
    info!(appliance = %appliance, ?target, "Waiting");
    let start = Instant::now();
    match target {
        WaitTarget::Ssh => appliance.wait_for_ssh(timeout).await?,
        WaitTarget::Db => appliance.wait_for_db(timeout).await?,
        WaitTarget::Evm => appliance.wait_for_evm_service(timeout).await?,
        WaitTarget::WebUi => appliance.wait_for_web_ui(true, timeout).await?,
    }
    let elapsed = start.elapsed();
    let report = WaitReport {
        target,
        elapsed_secs: elapsed.as_secs(),
    };
    out.emit(&report, |r| {
        println!("{:?} is up after {}", r.target, humanize_duration(elapsed));
    });
    Ok(())
}
