//! Scan configuration: YAML file loading, validation of every key, the
//! domains list and the optional prefixes-list override.
//!
//! The source address space ends up in two forms the trie needs: a map from
//! half-width network key to the prefix lengths configured at that key, and
//! the sorted list of keys for binary searching subnet coverage.
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use log::info;
use regex::Regex;
use serde::Deserialize;

use crate::error::{ECSError, ECSResult};

// Address-family specific bounds on the ECS source prefix length
const MIN_SOURCE_PREFIX_LENGTH: [u8; 2] = [8, 12]; // IPv4, IPv6
const MAX_SOURCE_PREFIX_LENGTH: [u8; 2] = [32, 64];

// First label must not start with a hyphen
const DOMAIN_NAME_PATTERN: &str =
    r"^[A-Za-z0-9][A-Za-z0-9-]{0,62}(?:\.[A-Za-z0-9-]{1,63})+\.?$";

/// Raw shape of the YAML config file. All keys optional here so that missing
/// ones can be reported with a proper message.
#[derive(Debug, Deserialize)]
struct RawConfig {
    address_family_number: Option<i64>,
    source_prefix_length: Option<i64>,
    source_address_space: Option<Vec<String>>,
    per_prefix_probe_limit: Option<HashMap<i64, i64>>,
    use_ark_vantage_points: Option<Vec<String>>,
    max_parallel_domains: Option<i64>,
}

/// Validated configuration, immutable after load.
#[derive(Debug)]
pub struct Config {
    address_family: u8,
    source_prefix_length: u8,
    vantage_points: Vec<String>,
    max_parallel_domains: usize,
    prefix_limits: HashMap<u8, u64>,
    source_prefixes: BTreeMap<u64, Vec<u8>>,
    source_prefix_list: Vec<u64>,
    domains: Vec<String>,
    ignore_response_scope: bool,
}

impl Config {
    /// Load and validate the YAML config, the domains list and the optional
    /// prefixes-list file (which overrides `source_address_space`).
    pub fn load(
        config_fpath: &str,
        domains_fpath: &str,
        prefixes_fpath: Option<&str>,
        ignore_response_scope: bool,
    ) -> ECSResult<Config> {
        let yaml = fs::read_to_string(config_fpath).map_err(|e| {
            ECSError::Config(format!("the config file '{}' was not found: {}", config_fpath, e))
        })?;

        let prefix_override = match prefixes_fpath {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    ECSError::Config(format!(
                        "the prefixes list file '{}' was not found: {}",
                        path, e
                    ))
                })?;
                Some(text.lines().map(String::from).collect())
            }
            None => None,
        };

        let mut config = Config::from_yaml_str(&yaml, prefix_override, ignore_response_scope)?;

        let domains_text = fs::read_to_string(domains_fpath).map_err(|e| {
            ECSError::Config(format!(
                "the domains list file '{}' was not found: {}",
                domains_fpath, e
            ))
        })?;
        config.domains = parse_domains_list(&domains_text)?;
        info!(
            "read {} domains from file '{}'",
            config.domains.len(),
            domains_fpath
        );

        Ok(config)
    }

    /// Validate a parsed YAML document. `prefix_override` replaces the
    /// `source_address_space` key when a prefixes-list file was given.
    pub fn from_yaml_str(
        yaml: &str,
        prefix_override: Option<Vec<String>>,
        ignore_response_scope: bool,
    ) -> ECSResult<Config> {
        let raw: RawConfig = serde_yaml::from_str(yaml)?;

        let address_family = match raw.address_family_number {
            None => {
                return Err(ECSError::Config(
                    "'address_family_number' not present in config".to_string(),
                ))
            }
            Some(n) if n == 1 || n == 2 => n as u8,
            Some(_) => {
                return Err(ECSError::Config(
                    "invalid 'address_family_number' in config".to_string(),
                ))
            }
        };
        info!("using 'address_family_number' {}", address_family);

        let fam = (address_family - 1) as usize;
        let source_prefix_length = match raw.source_prefix_length {
            None => {
                return Err(ECSError::Config(
                    "'source_prefix_length' not present in config".to_string(),
                ))
            }
            Some(n)
                if n >= MIN_SOURCE_PREFIX_LENGTH[fam] as i64
                    && n <= MAX_SOURCE_PREFIX_LENGTH[fam] as i64 =>
            {
                n as u8
            }
            Some(_) => {
                return Err(ECSError::Config(format!(
                    "invalid 'source_prefix_length': needs to be between {} and {}",
                    MIN_SOURCE_PREFIX_LENGTH[fam], MAX_SOURCE_PREFIX_LENGTH[fam]
                )))
            }
        };
        info!("using 'source_prefix_length' {}", source_prefix_length);

        let prefix_strings = match prefix_override {
            Some(lines) => lines,
            None => match raw.source_address_space {
                Some(list) if !list.is_empty() => list,
                Some(_) => {
                    return Err(ECSError::Config(
                        "invalid 'source_address_space': needs to be a non-empty list".to_string(),
                    ))
                }
                None => {
                    return Err(ECSError::Config(
                        "'source_address_space' not present in config and '--prefixes_list' not specified"
                            .to_string(),
                    ))
                }
            },
        };

        let mut source_prefixes: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        for prefix in &prefix_strings {
            let net = IpNet::from_str(prefix).map_err(|e| {
                ECSError::Config(format!("invalid prefix '{}' configured: {}", prefix, e))
            })?;

            // strict parsing: no host bits allowed
            if net.addr() != net.network() {
                return Err(ECSError::Config(format!(
                    "invalid prefix '{}' configured: host bits set",
                    prefix
                )));
            }

            let matches_family = match net {
                IpNet::V4(_) => address_family == 1,
                IpNet::V6(_) => address_family == 2,
            };
            if !matches_family {
                return Err(ECSError::Config(format!(
                    "invalid prefix in 'source_address_space': {} is not of configured address family",
                    prefix
                )));
            }

            let key = network_key(&net.network());
            source_prefixes
                .entry(key)
                .or_insert_with(Vec::new)
                .push(net.prefix_len());
        }
        let source_prefix_list: Vec<u64> = source_prefixes.keys().copied().collect();

        let prefix_limits = match raw.per_prefix_probe_limit {
            None => {
                return Err(ECSError::Config(
                    "'per_prefix_probe_limit' not present in config".to_string(),
                ))
            }
            Some(map) if map.is_empty() => {
                return Err(ECSError::Config(
                    "invalid 'per_prefix_probe_limit': needs to be a non-empty map of 'length: limit' items"
                        .to_string(),
                ))
            }
            Some(map) => {
                let mut limits = HashMap::new();
                for (len, limit) in map {
                    if !(0..=source_prefix_length as i64).contains(&len) || limit < 0 {
                        return Err(ECSError::Config(format!(
                            "invalid limit in 'per_prefix_probe_limit': '{}: {}' is out of range",
                            len, limit
                        )));
                    }

                    // a /20 with a /24 SPL can take at most 2^(24 - 20) probes
                    let shift = (source_prefix_length - len as u8) as u32;
                    let max_probes = if shift >= 64 { u64::MAX } else { 1u64 << shift };
                    if limit < 1 || limit as u64 > max_probes {
                        return Err(ECSError::Config(format!(
                            "invalid limit in 'per_prefix_probe_limit': a limit of {} probes with /{} SPL per /{} is not within [1, {}]",
                            limit, source_prefix_length, len, max_probes
                        )));
                    }
                    limits.insert(len as u8, limit as u64);
                }
                limits
            }
        };

        let vantage_points = match raw.use_ark_vantage_points {
            None => {
                return Err(ECSError::Config(
                    "'use_ark_vantage_points' not present in config".to_string(),
                ))
            }
            Some(list) if list.is_empty() => {
                return Err(ECSError::Config(
                    "invalid 'use_ark_vantage_points': needs to be a non-empty list".to_string(),
                ))
            }
            Some(list) => list,
        };
        for vp in &vantage_points {
            info!("configured Ark VP '{}'", vp);
        }

        let max_parallel_domains = match raw.max_parallel_domains {
            None => {
                return Err(ECSError::Config(
                    "'max_parallel_domains' not present in config".to_string(),
                ))
            }
            Some(n) if n >= 1 => n as usize,
            Some(_) => {
                return Err(ECSError::Config(
                    "invalid 'max_parallel_domains' in config".to_string(),
                ))
            }
        };
        info!("using 'max_parallel_domains' {}", max_parallel_domains);

        Ok(Config {
            address_family,
            source_prefix_length,
            vantage_points,
            max_parallel_domains,
            prefix_limits,
            source_prefixes,
            source_prefix_list,
            domains: Vec::new(),
            ignore_response_scope,
        })
    }

    pub fn address_family(&self) -> u8 {
        self.address_family
    }

    pub fn is_ipv6(&self) -> bool {
        self.address_family == 2
    }

    pub fn source_prefix_length(&self) -> u8 {
        self.source_prefix_length
    }

    /// Source prefix length as a trie depth.
    pub fn spl(&self) -> usize {
        self.source_prefix_length as usize
    }

    pub fn vantage_points(&self) -> &[String] {
        &self.vantage_points
    }

    pub fn max_parallel_domains(&self) -> usize {
        self.max_parallel_domains
    }

    /// Probe budget at `depth`, 0 when none is configured.
    pub fn prefix_limit(&self, depth: usize) -> u64 {
        if depth > u8::MAX as usize {
            return 0;
        }
        self.prefix_limits.get(&(depth as u8)).copied().unwrap_or(0)
    }

    /// Map from half-width network key to the prefix lengths configured there.
    pub fn source_prefixes(&self) -> &BTreeMap<u64, Vec<u8>> {
        &self.source_prefixes
    }

    /// Sorted half-width keys of all configured source prefixes.
    pub fn source_prefix_list(&self) -> &[u64] {
        &self.source_prefix_list
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn ignore_response_scope(&self) -> bool {
        self.ignore_response_scope
    }
}

/// Half-width key of a network address: the IPv4 address itself, or the top
/// 64 bits of an IPv6 address.
fn network_key(addr: &IpAddr) -> u64 {
    match addr {
        IpAddr::V4(v4) => u32::from(*v4) as u64,
        IpAddr::V6(v6) => (u128::from(*v6) >> 64) as u64,
    }
}

/// Validate the domains list, one FQDN per line.
pub fn parse_domains_list(text: &str) -> ECSResult<Vec<String>> {
    // the pattern cannot fail to compile
    let re = Regex::new(DOMAIN_NAME_PATTERN).map_err(|e| ECSError::Config(e.to_string()))?;

    let mut domains = Vec::new();
    for line in text.lines() {
        if !re.is_match(line) {
            return Err(ECSError::Config(format!(
                "domains list entry '{}' is not a valid domain name",
                line
            )));
        }
        domains.push(line.to_string());
    }
    Ok(domains)
}
