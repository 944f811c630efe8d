#![forbid(unsafe_code)]
//! Server-side composition: configuration, client sessions, the clone
//! backend and the session thread pool. The `dnbdd` binary wires these
//! to the image registry and uplink subsystem.

pub mod client;
pub mod cloner;
pub mod config;
pub mod threadpool;
