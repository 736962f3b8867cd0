//! Library crate for reachprobe exposing reusable modules.
pub mod config;
pub mod error;
pub mod logging;
pub mod ports;
pub mod scanner;
pub mod server;
pub mod types;
