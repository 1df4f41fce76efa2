//! Correo Core - Mail delivery and MTA-STS policy handling
//!
//! This crate provides the core functionality of the correo mail server:
//! the MTA-STS (RFC 8461) policy subsystem with its persistent cache, and
//! the outbound delivery path that consumes it.

pub mod smtp;
pub mod sts;

pub use smtp::{Courier, Deliver, Envelope, QueueManager};
pub use sts::{Mode, Policy, PolicyCache, StsError, StsFetcher};
