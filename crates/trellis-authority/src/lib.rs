//! Reference certificate authority and platform registry
//!
//! An in-memory authority that signs worker CSRs for holders of a bootstrap
//! token, and a platform registry tracking registrations and heartbeats.
//! Used for local development and for the worker integration tests.

pub mod error;
pub mod peer;
pub mod routes;
pub mod server;
pub mod state;
pub mod token;

pub use error::AuthorityError;
pub use peer::{ConnectionPeer, PeerCertAcceptor, PeerIdentity};
pub use routes::authority_router;
pub use server::{serve, RunningAuthority, ServerError};
pub use state::{AuthorityConfig, AuthorityState};
pub use token::BootstrapToken;
