//! `apl configure`

use std::time::Instant;

use apl_common::{Appliance, ApplianceError, ConfigureOptions};
use serde::Serialize;

use super::Output;
use super::helpers::humanize_duration;

#[derive(Debug, Serialize)]
struct ConfigureReport {
    appliance: String,
    region: u32,
    external_db: Option<String>,
    elapsed_secs: u64,
}

pub async fn run(
    appliance: &Appliance,
    options: &ConfigureOptions,
    out: &Output,
) -> Result<(), ApplianceError> {
    let start = Instant::now();
    appliance.configure(options).await?;
    let elapsed = start.elapsed();
    let report = ConfigureReport {
        appliance: appliance.address().await?,
        region: options.region,
        external_db: options.db_address.clone(),
        elapsed_secs: elapsed.as_secs(),
    };
    out.emit(&report, |r| {
        let db = r.external_db.as_deref().unwrap_or("internal");
        println!(
            "Configured {} (region {}, {db} database) in {}",
            r.appliance,
            r.region,
            humanize_duration(elapsed)
        );
    });
    Ok(())
}
