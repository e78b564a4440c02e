//! Data model of a measurement run: per-domain state, outbound query
//! parameters, per-vantage-point responses and their aggregate.
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use crate::trie::Root;

/// One domain being explored. Owned and mutated by the controller only; the
/// identifier doubles as the userid tagging outbound queries so responses can
/// be routed back.
#[derive(Debug)]
pub struct DomainState {
    pub domain: String,
    pub nameserver_ip: IpAddr,
    pub identifier: u32,
    pub temp_errors: u32,
    pub perm_error: bool,
    pub state: Option<Root>,
}

impl DomainState {
    pub fn new(domain: &str, nameserver_ip: IpAddr, identifier: u32) -> DomainState {
        DomainState {
            domain: domain.to_string(),
            nameserver_ip,
            identifier,
            temp_errors: 0,
            perm_error: false,
            state: None,
        }
    }
}

/// Parameters of one ECS-annotated query, fanned out to every vantage point.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub identifier: u32,
    pub domain: String,
    pub nameserver_ip: IpAddr,
    pub ip_address_client: IpAddr,
    pub source_prefix_length: u8,
    pub family: u8,
}

impl QueryRequest {
    pub fn client_subnet(&self) -> String {
        format!("{}/{}", self.ip_address_client, self.source_prefix_length)
    }
}

/// A probing host, as described by the vantage-point inventory.
#[derive(Debug, Clone, Deserialize)]
pub struct VantagePoint {
    pub shortname: String,
    #[serde(default)]
    pub cc: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub asn4: u32,
}

/// What one vantage point answered to one [`QueryRequest`].
#[derive(Debug, Clone)]
pub struct InstResponse {
    pub userid: u32,
    pub answers: Vec<String>,
    pub cnames: Vec<String>,
    pub scope_prefix_length: u8,
    pub nsid: String,
    pub error: Option<String>,
    pub vp_name: String,
    pub scan_timestamp: u64,
}

impl InstResponse {
    pub fn new(
        userid: u32,
        vp_name: &str,
        answers: Vec<String>,
        cnames: Vec<String>,
        scope_prefix_length: u8,
        nsid: String,
        error: Option<String>,
    ) -> InstResponse {
        InstResponse {
            userid,
            answers,
            cnames,
            scope_prefix_length,
            nsid,
            error,
            vp_name: vp_name.to_string(),
            scan_timestamp: unix_now(),
        }
    }

    /// A response that never made it: no answers, only the error.
    pub fn errored(userid: u32, vp_name: &str, error: String) -> InstResponse {
        InstResponse::new(userid, vp_name, Vec::new(), Vec::new(), 0, String::new(), Some(error))
    }
}

/// Aggregate of exactly one [`InstResponse`] per active vantage point.
#[derive(Debug)]
pub struct QueryResponse {
    pub request: QueryRequest,
    pub inst_responses: Vec<InstResponse>,
}

fn unix_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(_) => 0,
    }
}
