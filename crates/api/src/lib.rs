//! HTTP API: submission, status polling, tenant stats and the realtime
//! progress channel.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
pub mod realtime;
