//! Trellis worker runtime
//!
//! A worker proves its identity with a certificate issued by the mesh
//! authority, registers its capabilities with the platform, heartbeats on a
//! fixed cadence and serves mesh requests over mTLS.
//!
//! [`Worker::start`] runs the two startup phases; everything else is
//! exposed for embedding and testing.

pub mod certificate;
pub mod controller;
pub mod dispatch;
pub mod health;
pub mod lifecycle;
pub mod load;
pub mod policy;
pub mod receipt;
pub mod registry;
pub mod server;
pub mod startup;

pub use certificate::{CertificateManager, CertificateSettings};
pub use controller::{ControllerClient, ControllerClientConfig, CsrSubmitter, HttpControllerClient};
pub use dispatch::Dispatcher;
pub use lifecycle::{Lifecycle, StopReason, WorkerPhase};
pub use policy::{CallerIdentity, PolicyEngine};
pub use receipt::{LogReceiptSink, ReceiptSink};
pub use registry::{CapabilityHandler, CapabilitySet, HandlerError, ServiceRegistry};
pub use startup::{RunningWorker, Worker, WorkerOptions};
