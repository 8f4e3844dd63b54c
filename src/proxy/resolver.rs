//! Hostname resolution for proxy and target hosts
//!
//! Lookups are plain A-record queries through hickory; AAAA answers are
//! never requested.

use std::io;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use crate::error::{Result, VeilError};

/// Source of IPv4 addresses for a hostname
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup_ipv4(&self, hostname: &str) -> io::Result<Vec<Ipv4Addr>>;
}

/// Resolver using the host's nameservers, shared across the process
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

static DNS: OnceLock<TokioAsyncResolver> = OnceLock::new();

fn dns() -> &'static TokioAsyncResolver {
    DNS.get_or_init(|| {
        TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!("System DNS config unavailable ({}), using defaults", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        })
    })
}

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup_ipv4(&self, hostname: &str) -> io::Result<Vec<Ipv4Addr>> {
        if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
            return Ok(vec![ip]);
        }

        let lookup = dns()
            .ipv4_lookup(hostname)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(lookup.iter().map(|record| record.0).collect())
    }
}

/// Resolve a hostname to its first IPv4 address using the system resolver.
///
/// No timeout is applied here; callers bound the total time.
pub async fn resolve_hostname(hostname: &str) -> Result<Ipv4Addr> {
    resolve_with(&SystemResolver, hostname).await
}

/// Resolve with one retry: a failed or empty lookup is attempted exactly
/// once more before giving up.
pub async fn resolve_with<R: Resolve + ?Sized>(resolver: &R, hostname: &str) -> Result<Ipv4Addr> {
    match resolver.lookup_ipv4(hostname).await {
        Ok(addrs) if !addrs.is_empty() => return Ok(addrs[0]),
        Ok(_) => debug!("No A records for {}, retrying", hostname),
        Err(e) => debug!("Lookup of {} failed: {}, retrying", hostname, e),
    }

    match resolver.lookup_ipv4(hostname).await {
        Ok(addrs) if !addrs.is_empty() => Ok(addrs[0]),
        outcome => {
            if let Err(e) = outcome {
                warn!("Retry lookup of {} failed: {}", hostname, e);
            }
            Err(VeilError::Resolution {
                hostname: hostname.to_string(),
            })
        }
    }
}
