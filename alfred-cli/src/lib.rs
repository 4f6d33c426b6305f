//! Alfred service library: HTTP and WebSocket APIs over the state store.
//!
//! The binary lives in `main.rs`; everything here is a library so the
//! integration tests can assemble the same routers and sessions the service
//! runs in production.

pub mod api;
pub mod diag;
pub mod handlers;
pub mod service;
pub mod session;
pub mod transactions;
pub mod twitch;
