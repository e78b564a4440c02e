//! The measurement controller: keeps up to `max_parallel_domains` domains in
//! flight, aggregates the per-VP responses of each dispatched query, feeds
//! the aggregate back into the exploration state and acts on what the
//! planner says next.
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use log::{debug, error, warn};
use rand::RngCore;

use crate::bitfield::{bits_to_ip, first_bits, ip_to_bits, mask_ip_to_prefix};
use crate::config::Config;
use crate::error::{ECSError, ECSResult};
use crate::probe::ProbeExecutor;
use crate::scan::{DomainState, InstResponse, QueryRequest, QueryResponse};
use crate::trie::{next_parameters, Root};
use crate::writer::{EcsResultWriter, VantagePointWriter};

/// Poll timeout: long enough to not spin, short enough to surface executor
/// exceptions periodically.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// What the planner wants the controller to do next for a domain.
#[derive(Debug)]
pub enum PlanStep {
    /// Drop the domain and pull in the next one.
    Finished,
    /// Responses for the outstanding request are still being aggregated.
    Waiting,
    /// Dispatch this query to all vantage points.
    Query(QueryRequest),
}

/// One exploration step for a domain.
///
/// On the first call (`last_scan` = None) a fresh trie is installed.
/// Otherwise the aggregated response is consumed: per-instance errors are
/// added to the domain's error counter, and if the response is clean (and
/// scope feedback is honored) the trie is fed the maximum scope observed
/// across VPs, clamped to the request's source prefix length.
pub fn plan_next_step(
    domain_state: &mut DomainState,
    last_scan: Option<&QueryResponse>,
    config: &Config,
    rng: &mut dyn RngCore,
) -> PlanStep {
    match last_scan {
        None => {
            debug!("planner: new domain {}, initializing trie", domain_state.domain);
            domain_state.state = Some(Root::new());
        }
        Some(scan) => {
            let errors = scan
                .inst_responses
                .iter()
                .filter(|r| r.error.is_some())
                .count() as u32;
            domain_state.temp_errors += errors;

            if errors == 0 && !config.ignore_response_scope() {
                let mut scope = scan
                    .inst_responses
                    .iter()
                    .map(|r| r.scope_prefix_length)
                    .max()
                    .unwrap_or(0);
                if scan.request.source_prefix_length < scope {
                    scope = scan.request.source_prefix_length;
                }

                let bits = ip_to_bits(&scan.request.ip_address_client);
                let short = first_bits(&bits, scope as usize);

                if let Some(root) = domain_state.state.as_mut() {
                    if root.handle_response(short, config) {
                        return PlanStep::Finished;
                    }
                }
            }
        }
    }

    if domain_state.perm_error || domain_state.temp_errors > 0 {
        debug!(
            "planner: too many errors on domain {}, finishing scanning",
            domain_state.domain
        );
        return PlanStep::Finished;
    }

    let root = match domain_state.state.as_mut() {
        Some(root) => root,
        None => return PlanStep::Finished,
    };

    match next_parameters(root, config, rng) {
        None => PlanStep::Finished,
        Some((path, _announced)) => {
            let source_prefix_length = path.len() as u8;
            let client = mask_ip_to_prefix(
                &bits_to_ip(&path, config.is_ipv6()),
                source_prefix_length,
            );
            PlanStep::Query(QueryRequest {
                identifier: domain_state.identifier,
                domain: domain_state.domain.clone(),
                nameserver_ip: domain_state.nameserver_ip,
                ip_address_client: client,
                source_prefix_length,
                family: config.address_family(),
            })
        }
    }
}

struct PendingScan {
    request: QueryRequest,
    responses: Vec<InstResponse>,
}

pub struct Controller<'a> {
    config: &'a Config,
    executor: Box<dyn ProbeExecutor>,
    ecs_writer: EcsResultWriter,
    domain_ns_pairs: Vec<(String, IpAddr)>,
    domain_index: usize,
    no_more_domains: bool,
    currently_scanned_domains: HashMap<u32, DomainState>,
    currently_cached_responses: HashMap<u32, PendingScan>,
    rng: Box<dyn RngCore>,
}

impl<'a> Controller<'a> {
    /// Set up the writers and de-duplicate the resolved (domain, ns) triples
    /// by domain, keeping first-seen order.
    pub fn new(
        config: &'a Config,
        executor: Box<dyn ProbeExecutor>,
        resolved: &[(String, String, IpAddr)],
        output_basedir: &str,
        rng: Box<dyn RngCore>,
    ) -> ECSResult<Controller<'a>> {
        let mut vp_writer = VantagePointWriter::create(output_basedir)?;
        vp_writer.add_vps(executor.vantage_points())?;
        vp_writer.close()?;

        let ecs_writer = EcsResultWriter::create(output_basedir)?;

        let mut seen = HashSet::new();
        let mut domain_ns_pairs = Vec::new();
        for (domain, _ns_name, ns_ip) in resolved {
            if seen.insert(domain.clone()) {
                domain_ns_pairs.push((domain.clone(), *ns_ip));
            }
        }
        debug!("using the following domain ns pairs: {:?}", domain_ns_pairs);

        Ok(Controller {
            config,
            executor,
            ecs_writer,
            domain_ns_pairs,
            domain_index: 0,
            no_more_domains: false,
            currently_scanned_domains: HashMap::new(),
            currently_cached_responses: HashMap::new(),
            rng,
        })
    }

    /// Run the scan to completion. Returns an error on the first fatal
    /// executor exception.
    pub fn start(&mut self) -> ECSResult<()> {
        while self.currently_scanned_domains.len() < self.config.max_parallel_domains()
            && !self.no_more_domains
        {
            self.initiate_next_domain()?;
        }

        while !self.currently_scanned_domains.is_empty() {
            for response in self.executor.poll(POLL_TIMEOUT) {
                self.handle_new_response(response)?;
            }

            let exceptions = self.executor.poll_exceptions();
            if !exceptions.is_empty() {
                for exc in &exceptions {
                    error!("executor exception: {}", exc);
                }
                return Err(ECSError::Transport(format!(
                    "exiting due to {} executor exception(s)",
                    exceptions.len()
                )));
            }
        }
        Ok(())
    }

    fn next_domain_state(&mut self) -> Option<DomainState> {
        if self.domain_index >= self.domain_ns_pairs.len() {
            return None;
        }
        let (domain, nameserver_ip) = &self.domain_ns_pairs[self.domain_index];
        debug!("next domain: {} {}", domain, nameserver_ip);
        let state = DomainState::new(domain, *nameserver_ip, self.domain_index as u32);
        self.domain_index += 1;
        Some(state)
    }

    fn initiate_next_domain(&mut self) -> ECSResult<()> {
        if self.no_more_domains {
            return Ok(());
        }
        match self.next_domain_state() {
            None => {
                debug!("controller: no more domains available to scan");
                self.no_more_domains = true;
            }
            Some(mut state) => {
                debug!("controller: scanning next domain {}", state.domain);
                let step = plan_next_step(&mut state, None, self.config, self.rng.as_mut());
                let identifier = state.identifier;
                self.currently_scanned_domains.insert(identifier, state);
                self.act_on_plan(identifier, step)?;
            }
        }
        Ok(())
    }

    fn act_on_plan(&mut self, identifier: u32, step: PlanStep) -> ECSResult<()> {
        match step {
            PlanStep::Finished => {
                if let Some(state) = self.currently_scanned_domains.remove(&identifier) {
                    debug!("controller: finished scanning domain {}", state.domain);
                }
                self.initiate_next_domain()?;
            }
            PlanStep::Waiting => {
                debug!("controller: waiting for more results");
            }
            PlanStep::Query(request) => {
                debug!(
                    "controller: dispatching {} for domain {}",
                    request.client_subnet(),
                    request.domain
                );
                self.currently_cached_responses.insert(
                    identifier,
                    PendingScan {
                        request: request.clone(),
                        responses: Vec::new(),
                    },
                );
                self.executor.dispatch(&request)?;
            }
        }
        Ok(())
    }

    fn handle_new_response(&mut self, response: InstResponse) -> ECSResult<()> {
        let identifier = response.userid;

        let complete = match self.currently_cached_responses.get_mut(&identifier) {
            Some(pending) => {
                pending.responses.push(response);
                pending.responses.len() >= self.executor.num_vps()
            }
            None => {
                warn!("controller: dropping response for unknown scan {}", identifier);
                return Ok(());
            }
        };
        if !complete {
            return Ok(());
        }

        if let Some(PendingScan { request, responses }) =
            self.currently_cached_responses.remove(&identifier)
        {
            for inst_response in &responses {
                self.ecs_writer.add_result(&request, inst_response)?;
            }
            let query_response = QueryResponse {
                request,
                inst_responses: responses,
            };

            let step = match self.currently_scanned_domains.get_mut(&identifier) {
                Some(state) => {
                    plan_next_step(state, Some(&query_response), self.config, self.rng.as_mut())
                }
                None => return Ok(()),
            };
            self.act_on_plan(identifier, step)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::VantagePoint;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;

    fn vp(name: &str) -> VantagePoint {
        VantagePoint {
            shortname: name.to_string(),
            cc: "nl".to_string(),
            state: String::new(),
            city: "Enschede".to_string(),
            lat: 52.2,
            lon: 6.9,
            ipv4: "192.0.2.10".to_string(),
            asn4: 64500,
        }
    }

    /// Scripted executor: every dispatch immediately yields one response per
    /// VP, produced by the responder closure.
    struct MockExecutor {
        vps: Vec<VantagePoint>,
        ready: Vec<InstResponse>,
        dispatched: Rc<RefCell<Vec<QueryRequest>>>,
        responder: Box<dyn FnMut(&QueryRequest, &VantagePoint) -> InstResponse>,
    }

    impl MockExecutor {
        fn new(
            vps: Vec<VantagePoint>,
            dispatched: Rc<RefCell<Vec<QueryRequest>>>,
            responder: Box<dyn FnMut(&QueryRequest, &VantagePoint) -> InstResponse>,
        ) -> MockExecutor {
            MockExecutor {
                vps,
                ready: Vec::new(),
                dispatched,
                responder,
            }
        }
    }

    impl ProbeExecutor for MockExecutor {
        fn add_vantage_points(&mut self, _names: &[String]) -> ECSResult<()> {
            Ok(())
        }

        fn num_vps(&self) -> usize {
            self.vps.len()
        }

        fn vantage_points(&self) -> &[VantagePoint] {
            &self.vps
        }

        fn dispatch(&mut self, request: &QueryRequest) -> ECSResult<()> {
            self.dispatched.borrow_mut().push(request.clone());
            for vp in &self.vps {
                self.ready.push((self.responder)(request, vp));
            }
            Ok(())
        }

        fn poll(&mut self, _timeout: Duration) -> Vec<InstResponse> {
            std::mem::take(&mut self.ready)
        }

        fn poll_exceptions(&mut self) -> Vec<String> {
            Vec::new()
        }
    }

    fn temp_dir(tag: &str) -> String {
        let dir = std::env::temp_dir().join(format!("ecsprobe-ctl-{}-{}", tag, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.to_str().unwrap().to_string()
    }

    fn scope_responder(scope: u8) -> Box<dyn FnMut(&QueryRequest, &VantagePoint) -> InstResponse> {
        Box::new(move |request, vp| {
            InstResponse::new(
                request.identifier,
                &vp.shortname,
                vec!["198.51.100.1".to_string()],
                vec![],
                scope,
                "0x6e73".to_string(),
                None,
            )
        })
    }

    fn triples(entries: &[(&str, &str)]) -> Vec<(String, String, IpAddr)> {
        entries
            .iter()
            .map(|(domain, ns_ip)| {
                (
                    domain.to_string(),
                    format!("ns1.{}", domain),
                    ns_ip.parse().unwrap(),
                )
            })
            .collect()
    }

    const SLASH8_CONFIG: &str = r#"
address_family_number: 1
source_prefix_length: 24
source_address_space:
  - 10.0.0.0/8
per_prefix_probe_limit:
  8: 1
use_ark_vantage_points: [vp1]
max_parallel_domains: 2
"#;

    const SLASH16_CONFIG: &str = r#"
address_family_number: 1
source_prefix_length: 24
source_address_space:
  - 10.0.0.0/16
per_prefix_probe_limit:
  16: 4
use_ark_vantage_points: [vp1]
max_parallel_domains: 1
"#;

    fn run_controller(
        config: &Config,
        vps: Vec<VantagePoint>,
        responder: Box<dyn FnMut(&QueryRequest, &VantagePoint) -> InstResponse>,
        resolved: &[(String, String, IpAddr)],
        outdir: &str,
    ) -> Vec<QueryRequest> {
        let dispatched = Rc::new(RefCell::new(Vec::new()));
        let executor = MockExecutor::new(vps, Rc::clone(&dispatched), responder);
        let rng = Box::new(StdRng::seed_from_u64(7));
        let mut controller =
            Controller::new(config, Box::new(executor), resolved, outdir, rng).unwrap();
        controller.start().unwrap();
        let requests = dispatched.borrow().clone();
        requests
    }

    #[test]
    fn trivial_finish_after_scope_covers_space() {
        let config = Config::from_yaml_str(SLASH8_CONFIG, None, false).unwrap();
        let outdir = temp_dir("trivial");

        let requests = run_controller(
            &config,
            vec![vp("vp1")],
            scope_responder(8),
            &triples(&[("x.test", "192.0.2.1")]),
            &outdir,
        );

        // one probe inside 10.0.0.0/8 at the configured SPL, then done
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].source_prefix_length, 24);
        assert!(requests[0].ip_address_client.to_string().starts_with("10."));

        let text = fs::read_to_string(Path::new(&outdir).join("ecsresults.csv")).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows.len(), 2); // header + one row
        assert!(rows[1].starts_with("x.test,192.0.2.1,vp1,"));
        assert!(rows[1].contains(",24,8,false,"));
    }

    #[test]
    fn response_scope_prunes_whole_prefix() {
        let config = Config::from_yaml_str(SLASH16_CONFIG, None, false).unwrap();
        let outdir = temp_dir("prune");

        let requests = run_controller(
            &config,
            vec![vp("vp1")],
            scope_responder(16),
            &triples(&[("x.test", "192.0.2.1")]),
            &outdir,
        );

        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn ignoring_scope_explores_until_budget() {
        let config = Config::from_yaml_str(SLASH16_CONFIG, None, true).unwrap();
        let outdir = temp_dir("ignore");

        let requests = run_controller(
            &config,
            vec![vp("vp1")],
            scope_responder(16),
            &triples(&[("x.test", "192.0.2.1")]),
            &outdir,
        );

        // four sampled /24 probes fill the /16 budget, then the announced /16
        // itself is probed as a whole
        assert_eq!(requests.len(), 5);
        for request in &requests[..4] {
            assert_eq!(request.source_prefix_length, 24);
        }
        assert_eq!(requests[4].source_prefix_length, 16);
        assert_eq!(requests[4].ip_address_client.to_string(), "10.0.0.0");
    }

    #[test]
    fn instance_error_suppresses_feedback_and_finishes() {
        let config = Config::from_yaml_str(SLASH16_CONFIG, None, false).unwrap();
        let outdir = temp_dir("error");

        let responder: Box<dyn FnMut(&QueryRequest, &VantagePoint) -> InstResponse> =
            Box::new(|request, vp| {
                if vp.shortname == "vp2" {
                    InstResponse::errored(request.identifier, &vp.shortname, "timeout".to_string())
                } else {
                    InstResponse::new(
                        request.identifier,
                        &vp.shortname,
                        vec![],
                        vec![],
                        16,
                        String::new(),
                        None,
                    )
                }
            });

        let requests = run_controller(
            &config,
            vec![vp("vp1"), vp("vp2")],
            responder,
            &triples(&[("x.test", "192.0.2.1")]),
            &outdir,
        );

        // the domain stops at its next planning step
        assert_eq!(requests.len(), 1);

        let text = fs::read_to_string(Path::new(&outdir).join("ecsresults.csv")).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows.len(), 3); // header + one row per VP
        assert_eq!(text.matches(",true,").count(), 1);
    }

    #[test]
    fn multi_vp_scope_aggregation_takes_clamped_max() {
        let config = Config::from_yaml_str(SLASH16_CONFIG, None, false).unwrap();
        let mut state = DomainState::new("x.test", "192.0.2.1".parse().unwrap(), 0);
        let mut rng = StdRng::seed_from_u64(7);

        let step = plan_next_step(&mut state, None, &config, &mut rng);
        let request = match step {
            PlanStep::Query(request) => request,
            other => panic!("expected a query, got {:?}", other),
        };

        // one VP claims /20, the other /30 (beyond the request's /24)
        let responses = vec![
            InstResponse::new(0, "vp1", vec![], vec![], 20, String::new(), None),
            InstResponse::new(0, "vp2", vec![], vec![], 30, String::new(), None),
        ];
        let query_response = QueryResponse {
            request: request.clone(),
            inst_responses: responses,
        };
        plan_next_step(&mut state, Some(&query_response), &config, &mut rng);

        // the /24 node (clamped maximum) was marked, not the /20
        let bits = ip_to_bits(&request.ip_address_client);
        let root = state.state.as_ref().unwrap();
        let mut element = root.children[bits[0] as usize].as_deref().unwrap();
        for (depth, bit) in bits[1..24].iter().enumerate() {
            if depth + 1 == 20 {
                match element {
                    crate::trie::TrieElement::Node(node) => {
                        assert_eq!(node.counter_returned_as_scope, 0)
                    }
                    crate::trie::TrieElement::Leaf(_) => panic!("unexpected leaf at /20"),
                }
            }
            element = match element {
                crate::trie::TrieElement::Node(node) => {
                    node.children[*bit as usize].as_deref().unwrap()
                }
                crate::trie::TrieElement::Leaf(_) => panic!("unexpected leaf on path"),
            };
        }
        match element {
            crate::trie::TrieElement::Node(node) => {
                assert_eq!(node.counter_returned_as_scope, 1)
            }
            crate::trie::TrieElement::Leaf(_) => panic!("unexpected leaf at /24"),
        }
    }

    #[test]
    fn domains_are_deduplicated_first_ns_wins() {
        let config = Config::from_yaml_str(SLASH8_CONFIG, None, false).unwrap();
        let outdir = temp_dir("dedup");

        let requests = run_controller(
            &config,
            vec![vp("vp1")],
            scope_responder(8),
            &triples(&[
                ("a.test", "192.0.2.1"),
                ("a.test", "192.0.2.2"),
                ("b.test", "192.0.2.3"),
            ]),
            &outdir,
        );

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].domain, "a.test");
        assert_eq!(requests[0].nameserver_ip.to_string(), "192.0.2.1");
        assert_eq!(requests[1].domain, "b.test");
    }

    #[test]
    fn vps_csv_lists_active_vantage_points() {
        let config = Config::from_yaml_str(SLASH8_CONFIG, None, false).unwrap();
        let outdir = temp_dir("vpcsv");

        run_controller(
            &config,
            vec![vp("vp1"), vp("vp2")],
            scope_responder(8),
            &triples(&[("x.test", "192.0.2.1")]),
            &outdir,
        );

        let text = fs::read_to_string(Path::new(&outdir).join("vps.csv")).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows[0], "shortname,cc,state,city,lat,lon,ipv4,asn4");
        assert_eq!(rows.len(), 3);
        assert!(rows[1].starts_with("vp1,nl,"));
        assert!(rows[2].starts_with("vp2,nl,"));
    }
}
