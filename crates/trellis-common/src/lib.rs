//! Common types for Trellis: errors, configuration, wire protocol and retry policy

pub mod config;
pub mod error;
pub mod mesh;
pub mod protocol;
pub mod retry;
pub mod telemetry;

pub use error::{AcquisitionStep, Error, Result};

/// Default mTLS listener address for workers
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8443";

/// Default plaintext liveness listener address
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

/// Default heartbeat cadence in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Default renewal margin before `not_after`, in seconds
pub const DEFAULT_RENEWAL_MARGIN_SECS: u64 = 300;

/// Default number of consecutive heartbeat failures before Degraded
pub const DEFAULT_DEGRADED_AFTER_FAILURES: u32 = 3;

/// Default drain period at shutdown, in seconds
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 20;

/// Default load score denominator
pub const DEFAULT_MAX_CONCURRENCY: u32 = 64;

/// Default address the reference authority listens on
pub const DEFAULT_AUTHORITY_ADDR: &str = "0.0.0.0:9443";
