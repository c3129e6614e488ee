//! # Bharat Gateway
//!
//! Read-only HTTP surface over the worker's persisted state. Job runs and
//! dedup summaries come from the shared record store, so any replica
//! reports the same picture.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, serve};
