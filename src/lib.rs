//! Idlegate - on-demand container lifecycle controller
//!
//! This library sits behind a reverse proxy that asks, for each incoming
//! request, whether the target application's containers are up:
//! - Discovers an application's containers through Docker labels
//! - Starts stopped containers and answers "starting" so the proxy can wait
//! - Answers "started" once every container is running
//! - Stops the containers after a per-service inactivity timeout

pub mod adapter;
pub mod api;
pub mod config;
pub mod docker;
pub mod error;
pub mod registry;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;
