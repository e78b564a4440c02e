//! Authoritative-nameserver discovery, run once before the measurement: NS
//! records for every input domain, then A records for every distinct
//! nameserver name, producing the (domain, ns name, ns address) triples the
//! controller scans.
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::runtime::Runtime;
use tokio::time::timeout;

use crate::error::{ECSError, ECSResult};
use crate::wire::{self, QType, MAX_DNS_PACKET_SIZE};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct AuthNsResolver {
    resolver: SocketAddr,
    runtime: Runtime,
}

impl AuthNsResolver {
    /// `resolver` is `ip` or `ip:port`; port 53 is assumed when absent.
    pub fn new(resolver: &str) -> ECSResult<AuthNsResolver> {
        let addr = match SocketAddr::from_str(resolver) {
            Ok(addr) => addr,
            Err(_) => SocketAddr::new(IpAddr::from_str(resolver)?, 53),
        };
        Ok(AuthNsResolver {
            resolver: addr,
            runtime: Runtime::new()?,
        })
    }

    /// Resolve the distinct `(domain, ns_name, ns_ip)` triples for all input
    /// domains. Domains whose NS or A lookups come back empty are dropped
    /// with a warning.
    pub fn resolve_authoritative_nameservers(
        &self,
        domains: &[String],
    ) -> ECSResult<Vec<(String, String, IpAddr)>> {
        self.runtime.block_on(self.resolve_all(domains))
    }

    async fn resolve_all(&self, domains: &[String]) -> ECSResult<Vec<(String, String, IpAddr)>> {
        // phase 1: NS records per domain
        let mut domains_to_ns: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for domain in domains {
            match self.lookup_ns(domain).await {
                Ok(nses) if !nses.is_empty() => {
                    debug!("got ({}) for {}", nses.join(","), domain);
                    domains_to_ns.insert(domain.as_str(), nses.into_iter().collect());
                }
                Ok(_) => warn!("no NS records found for '{}'", domain),
                Err(e) => warn!("NS lookup for '{}' failed: {}", domain, e),
            }
        }

        let distinct_ns: BTreeSet<String> =
            domains_to_ns.values().flatten().cloned().collect();
        info!(
            "resolving addresses for {} distinct nameserver(s)",
            distinct_ns.len()
        );

        // phase 2: A records per nameserver name
        let mut ns_to_addrs: BTreeMap<&str, Vec<IpAddr>> = BTreeMap::new();
        for ns in &distinct_ns {
            match self.query(ns, QType::A).await {
                Ok(response) => {
                    ns_to_addrs.insert(ns.as_str(), response.answers);
                }
                Err(e) => warn!("A lookup for '{}' failed: {}", ns, e),
            }
        }

        let mut triples = Vec::new();
        for (domain, nses) in &domains_to_ns {
            for ns in nses {
                match ns_to_addrs.get(ns.as_str()) {
                    Some(addrs) => {
                        for addr in addrs {
                            if usable_address(addr) {
                                triples.push((domain.to_string(), ns.clone(), *addr));
                            }
                        }
                    }
                    None => warn!("could not find '{}' in address resolution results", ns),
                }
            }
        }
        Ok(triples)
    }

    /// NS lookup with a walk-up: a name with no NS records is retried with
    /// its parent until only two labels remain.
    async fn lookup_ns(&self, domain: &str) -> ECSResult<Vec<String>> {
        let mut target = domain.trim_end_matches('.').to_string();
        loop {
            debug!("issuing NS query for {}", target);
            let response = self.query(&target, QType::NS).await?;
            if !response.nameservers.is_empty() {
                return Ok(response.nameservers);
            }

            if target.split('.').count() <= 2 {
                return Ok(Vec::new());
            }
            target = match target.split_once('.') {
                Some((_, parent)) => parent.to_string(),
                None => return Ok(Vec::new()),
            };
        }
    }

    async fn query(&self, name: &str, qtype: QType) -> ECSResult<wire::DNSResponse> {
        let bind_addr = if self.resolver.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr).await?;

        let id: u16 = rand::random();
        let query = wire::build_query(id, name, qtype, true, None, false)?;
        socket.send_to(&query, self.resolver).await?;

        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        let (received, _) = timeout(RESOLVE_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| ECSError::Transport("timed out waiting for response".to_string()))??;

        let parsed = wire::parse_response(&buf[..received])?;
        if parsed.id != id {
            return Err(ECSError::DNS("response id does not match the query".to_string()));
        }
        Ok(parsed)
    }
}

/// Keep only addresses a probe can sensibly target.
fn usable_address(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_multicast()
                || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_multicast() || v6.is_unspecified() || link_local)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_filtering() {
        let usable: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(usable_address(&usable));

        for bad in ["10.1.2.3", "127.0.0.1", "169.254.0.1", "0.0.0.0", "224.0.0.1"] {
            let addr: IpAddr = bad.parse().unwrap();
            assert!(!usable_address(&addr), "{} should be filtered", bad);
        }

        let v6_ll: IpAddr = "fe80::1".parse().unwrap();
        assert!(!usable_address(&v6_ll));
        let v6_ok: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(usable_address(&v6_ok));
    }
}
