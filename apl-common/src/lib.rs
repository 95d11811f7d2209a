//! Appliance lifecycle core.
//!
//! Drives a remote appliance from "just deployed" to "serving its web UI"
//! over SSH and its region database, with lazily cached facts, bounded
//! polling and a thread-scoped stack naming the current appliance.

#![forbid(unsafe_code)]

pub mod appliance;
pub mod cache;
pub mod config;
pub mod errors;
pub mod logging;
pub mod mock;
pub mod net;
pub mod remote;
pub mod stack;
pub mod store;
pub mod util;
pub mod version;
pub mod wait;

pub use appliance::{Appliance, ApplianceBuilder, ApplianceKind, ConfigureOptions, WebUiState};
pub use config::HarnessConfig;
pub use errors::{ApplianceError, ChannelError, StoreError, WaitError};
pub use logging::{LogConfig, LoggingGuards, init_logging};
pub use stack::{ApplianceStack, AppliancePush};
pub use wait::WaitFor;
