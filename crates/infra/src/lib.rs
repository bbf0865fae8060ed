//! Infrastructure layer: job orchestration, progress broadcast, storage
//! adapters, entitlements and configuration.

pub mod broadcast;
pub mod config;
pub mod entitlements;
pub mod event_bus;
pub mod jobs;

#[cfg(test)]
mod integration_tests;
