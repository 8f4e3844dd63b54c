//! Tunnel primitives
//!
//! This module provides the layers a request passes through:
//! - Hostname resolution
//! - HTTP CONNECT through a TLS-wrapped proxy
//! - Inner TLS with a decoy SNI
//! - HTTP/1.1 exchange over the tunnel
//! - Bulk probing, load balancing and health monitoring on top

pub mod balancer;
pub mod dialer;
pub mod exchange;
pub mod health;
pub mod probe;
pub mod resolver;
pub mod tls;
pub mod transport;
pub mod tunnel;

pub use balancer::{BalanceOutcome, BalancedRequest, LoadBalanceConfig, LoadBalancer, RequestExecutor, TunnelExecutor};
pub use dialer::{ProxyDialer, ProxyEndpoint};
pub use exchange::{exchange, HttpRequest, HttpResponse};
pub use health::{HealthMonitor, MonitoredSession, ReconnectHook};
pub use probe::{BulkProbeConfig, ProbeOptions, Prober};
pub use resolver::{resolve_hostname, Resolve, SystemResolver};
pub use tls::FakeSniDialer;
pub use transport::{Tunnel, TunnelStream};
pub use tunnel::{connect_proxy, send_request, TunnelRequest};
