//! Protocol handlers mounted on the HTTP server.

pub mod ws;
