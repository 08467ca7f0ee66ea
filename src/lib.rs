//! Couchgate - application servers in front of a supervised CouchDB
//!
//! This library provides:
//! - A supervisor that spawns CouchDB with a derived ini and stops it cleanly
//! - A readiness poller that waits for CouchDB to answer with its version
//! - A minimum version gate
//! - A shutdown coordinator so the host never exits while CouchDB still runs
//! - A bounded, pooled proxy that forwards `/_api` requests to CouchDB
//! - www and admin servers, optionally behind a subdomain router

pub mod app;
pub mod config;
pub mod error;
pub mod process;
pub mod proxy;
pub mod readiness;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod startup;
pub mod version;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
