//! Infrastructure layer: storage, queueing, workers and the pipeline facade.

pub mod artifacts;
pub mod config;
pub mod processors;
pub mod queue;
pub mod retry;
pub mod service;
pub mod store;
pub mod usage;
pub mod workers;

#[cfg(test)]
mod integration_tests;
