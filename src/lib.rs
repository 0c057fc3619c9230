//! Backupgate - a supervising reverse proxy for a backup server add-on
//!
//! This library wraps a long-running backup server so it can live behind a
//! reverse-proxying ingress:
//! - Resolves layered runtime configuration and provisions secrets exactly once
//! - Optionally installs an alternate server build from a downloaded archive
//! - Spawns and supervises the server, relaying OS signals and propagating
//!   its exit status
//! - Fronts all traffic with an HTTP gateway that injects the pre-auth
//!   header and rewrites HTML responses for ingress path prefixes

pub mod config;
pub mod process;
pub mod proxy;
pub mod release;
pub mod rewrite;
pub mod secrets;
pub mod upstream;
