//! Quai Mining Client
//!
//! An async mining client for the Quai hierarchical blockchain:
//! - Pending headers from the Prime/Region/Zone nodes of a slice, or from a mining proxy
//! - Interruptible sealing that always works on the newest header
//! - Solutions classified by difficulty order and submitted to every tier they satisfy
//! - Multi-threaded CPU sealing engine

pub mod config;
pub mod error;
pub mod types;
pub mod order;
pub mod rpc;
pub mod client;
pub mod proxy;
pub mod feed;
pub mod engine;
pub mod coordinator;
pub mod fanout;
pub mod miner;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Application information
pub const APP_NAME: &str = "quai-mining-client";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
