//! Veil - Fake-SNI Proxy Tunnel Toolkit
//!
//! Reaches HTTPS proxies while presenting a decoy SNI to on-path observers.
//!
//! ## Features
//!
//! - HTTP CONNECT tunnels through TLS-wrapped proxies
//! - Decoy SNI on the proxy leg, real SNI on the inner leg
//! - Single and bulk reachability probes
//! - Round-robin load balancing with retry
//! - Periodic health monitoring with an optional reconnect hook
//! - Session client with server-list cache, statistics and state persistence

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod session;

pub use client::{ServerSearch, VeilClient};
pub use config::Config;
pub use error::{Result, VeilError};
pub use events::{ClientEvent, EventBus};
pub use session::SessionApi;
