//! Library crate for recon-stream: scan-session aggregation plus the backend that feeds it.
pub mod client;
pub mod clock;
pub mod completion;
pub mod config;
pub mod error;
pub mod export;
pub mod history;
pub mod logging;
pub mod merge;
pub mod server;
pub mod session;
pub mod target;
pub mod tools;
pub mod types;
