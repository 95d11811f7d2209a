//! Subcommand implementations.
//!
//! Each command works on the appliance on top of the stack and prints
//! either text or, with `--json`, one JSON document.

pub mod configure;
pub mod helpers;
pub mod service;
pub mod status;
pub mod wait;

use clap::ValueEnum;
use serde::Serialize;
use tracing::warn;

/// Service `apl wait` can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitTarget {
    Ssh,
    Db,
    Evm,
    WebUi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

/// Text or JSON output, chosen once per invocation.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Print `value` as JSON, or run `text` to print it for humans.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) {
        if !self.json {
            text(value);
            return;
        }
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!(error = %e, "Could not serialize output"),
        }
    }
}
