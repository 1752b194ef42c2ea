//! Stories of a worker joining, living in and leaving the mesh
//!
//! - `startup`: certificate bootstrap and registration, or failing before
//!   any listener opens
//! - `lifecycle`: degraded heartbeats, deregistration, platform instructions
//! - `mesh`: requests over mTLS

mod helpers;
mod lifecycle;
mod mesh;
mod startup;
