//! Appliance lifecycle CLI
//!
//! Configures a ManageIQ/CFME appliance, waits on its services and reports
//! what it knows about it.

#![forbid(unsafe_code)]

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use apl_common::{Appliance, ApplianceStack, HarnessConfig, LogConfig, init_logging};
use clap::{Parser, Subcommand};
use tracing::debug;

use commands::{Output, ServiceAction, WaitTarget};

#[derive(Parser)]
#[command(name = "apl")]
#[command(author, version, about = "Appliance lifecycle - bring-up, waits and status")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Appliance URL or address (overrides `appliance.base_url`)
    #[arg(short, long, global = true)]
    url: Option<String>,

    /// Config file (defaults to $APL_CONFIG or ~/.config/apl/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full bring-up: clock, database, EVM service, web UI
    Configure {
        /// Region number for a new database
        #[arg(short, long, default_value = "0")]
        region: u32,

        /// Join an external database on this host instead of creating one
        #[arg(long)]
        db_address: Option<String>,

        /// Fetch the encryption key from this appliance
        #[arg(long)]
        key_address: Option<String>,

        /// Skip the chrony setup
        #[arg(long)]
        no_ntp: bool,

        /// Keep the stock pg_hba.conf
        #[arg(long)]
        no_loosen_pgssl: bool,

        /// Rename the server once it is up
        #[arg(long)]
        name: Option<String>,
    },

    /// Block until a service is up
    Wait {
        #[arg(value_enum)]
        target: WaitTarget,

        /// Timeout in seconds (defaults to the configured one)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Control the evmserverd service
    Service {
        #[arg(value_enum)]
        action: ServiceAction,

        /// Kill ruby and bounce PostgreSQL instead of a clean restart
        #[arg(long)]
        rude: bool,
    },

    /// One-shot readiness and identity report
    Status,

    /// List server roles, or make exactly the given roles active
    Roles {
        /// Comma-separated role names to enable; all others are disabled
        #[arg(long, value_delimiter = ',')]
        set: Option<Vec<String>>,
    },

    /// Explain why the EVM service is not coming up
    Diagnose,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = HarnessConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = cli.url {
        config.appliance.base_url = Some(url);
    }

    let mut log_config = LogConfig::from_env(&config.log_level).with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let config = Arc::new(config);
    let appliance = Arc::new(
        Appliance::from_config(config.clone())
            .and_then(|builder| builder.build())
            .context("No usable appliance configured")?,
    );
    debug!(appliance = %appliance, "Resolved appliance");

    let out = Output::new(cli.json);
    let command = cli.command;
    let target = appliance.clone();
    ApplianceStack::scoped(appliance, async move {
        match command {
            Commands::Configure {
                region,
                db_address,
                key_address,
                no_ntp,
                no_loosen_pgssl,
                name,
            } => {
                let mut options = apl_common::ConfigureOptions::from_config(&config);
                options.region = region;
                options.db_address = db_address;
                options.key_address = key_address;
                options.name_to_set = name;
                options.fix_ntp_clock &= !no_ntp;
                options.loosen_pgssl &= !no_loosen_pgssl;
                commands::configure::run(&target, &options, &out).await
            }
            Commands::Wait { target: what, timeout } => {
                commands::wait::run(&target, what, timeout, &out).await
            }
            Commands::Service { action, rude } => {
                commands::service::run(&target, action, rude, &out).await
            }
            Commands::Status => commands::status::status(&target, &out).await,
            Commands::Roles { set } => commands::status::roles(&target, set, &out).await,
            Commands::Diagnose => commands::status::diagnose(&target, &out).await,
        }
    })
    .await?;
    Ok(())
}
