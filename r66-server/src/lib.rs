//! R66 Transfer Server Library
//!
//! This library exposes the server's internal modules for the `r66d` binary
//! and for integration testing.

pub mod admin;
pub mod args;
pub mod blacklist;
pub mod client;
pub mod connection;
pub mod connection_tracker;
pub mod constants;
pub mod db;
pub mod mux;
pub mod pipeline;
pub mod recovery;
pub mod registry;
pub mod server;
pub mod service;
pub mod session;
