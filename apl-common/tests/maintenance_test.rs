//! Database backup and restore, asset compilation.

mod common;

use apl_common::ApplianceError;
use apl_common::appliance::DEFAULT_BACKUP_PATH;
use apl_common::cache::CachedField;
use apl_common::remote::CommandResult;
use common::TestAppliance;

fn lifecycle_output(err: &ApplianceError) -> &str {
    match err {
        ApplianceError::Lifecycle { output, .. } => output,
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_backup_defaults_path() {
    let t = TestAppliance::new();
    let path = t.appliance.backup_database(None).await.unwrap();
    assert_eq!(path, DEFAULT_BACKUP_PATH);
    assert!(t.channel().ran(&format!(
        "bin/rake evm:db:backup:local --trace -- --local-file {DEFAULT_BACKUP_PATH}"
    )));
}

#[tokio::test]
async fn test_backup_failure_carries_rake_output() {
    let t = TestAppliance::new();
    t.channel().respond(
        "evm:db:backup:local",
        CommandResult::new(1, "pg_dump: connection refused"),
    );
    let err = t.appliance.backup_database(Some("/tmp/nightly.backup")).await.unwrap_err();
    assert!(lifecycle_output(&err).contains("pg_dump: connection refused"));
}

#[tokio::test]
async fn test_restore_forgets_server_identity() {
    let t = TestAppliance::new();
    t.appliance.configuration_details().await.unwrap();
    assert!(t.appliance.cache().is_cached(CachedField::ConfigurationDetails));

    t.appliance.restore_database(None).await.unwrap();

    assert!(t.channel().ran("evm:db:restore:local"));
    assert!(!t.appliance.cache().is_cached(CachedField::ConfigurationDetails));
}

#[tokio::test]
async fn test_restore_failure_keeps_identity_cached() {
    let t = TestAppliance::new();
    t.appliance.configuration_details().await.unwrap();
    t.channel().respond(
        "evm:db:restore:local",
        CommandResult::new(1, "pg_restore: archive is corrupt"),
    );

    let err = t.appliance.restore_database(None).await.unwrap_err();

    assert!(lifecycle_output(&err).contains("archive is corrupt"));
    assert!(t.appliance.cache().is_cached(CachedField::ConfigurationDetails));
}

#[tokio::test]
async fn test_precompile_clobbers_first() {
    let t = TestAppliance::new();
    let channel = t.channel();
    t.appliance.precompile_assets().await.unwrap();

    let cmds = channel.commands();
    let clobber = cmds.iter().position(|c| c.ends_with("bin/rake assets:clobber")).unwrap();
    let precompile = cmds.iter().position(|c| c.ends_with("bin/rake assets:precompile")).unwrap();
    assert!(clobber < precompile);
}

#[tokio::test]
async fn test_precompile_stops_when_clobber_fails() {
    let t = TestAppliance::new();
    let channel = t.channel();
    channel.respond("assets:clobber", CommandResult::new(1, "rake aborted!"));

    let err = t.appliance.precompile_assets().await.unwrap_err();

    assert!(lifecycle_output(&err).contains("rake aborted!"));
    assert!(!channel.ran("assets:precompile"));
}
