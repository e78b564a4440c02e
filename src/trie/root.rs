//! The trie root and the two walks that drive exploration: feeding back the
//! scope observed in a response, and picking the next client prefix to probe.
use log::debug;
use rand::{Rng, RngCore};

use crate::config::Config;
use crate::trie::{Branch, Node, ScanningMode, TrieElement};

// scope-zero responses never finish a domain; the threshold is hard-coded to
// zero
const MAX_NUM_SCOPE_ZEROS: u64 = 0;

/// Root of a per-domain trie. Has no value and no probe counters of its own,
/// only the count of scope-zero observations.
#[derive(Debug, Default)]
pub struct Root {
    pub scope_zero_observed: u64,
    pub children: [Option<Box<TrieElement>>; 2],
}

impl Root {
    pub fn new() -> Root {
        Root::default()
    }

    pub fn has_bgp_subnet(&self, config: &Config) -> bool {
        !config.source_prefix_list().is_empty()
    }

    pub fn is_in_announced_space(&self) -> bool {
        false
    }

    /// Record the scope feedback of one aggregated response.
    ///
    /// `short` is the client IP truncated to the observed scope prefix
    /// length. Walks down to the node at that depth (materializing on the
    /// way), marks it as returned-as-scope, and reports whether the domain is
    /// finished: true iff the marked node's scanning mode is now
    /// [`ScanningMode::FinishedScanning`]. A leaf met before the scope depth
    /// means the subtree is already retired and the feedback is dropped.
    pub fn handle_response(&mut self, short: &[u8], config: &Config) -> bool {
        if short.is_empty() {
            self.scope_zero_observed += 1;
            return MAX_NUM_SCOPE_ZEROS > 0 && self.scope_zero_observed >= MAX_NUM_SCOPE_ZEROS;
        }

        let mut current = Branch::get_child(self, &[], short[0], config);
        for depth in 1..short.len() {
            current = match current {
                TrieElement::Leaf(_) => return false,
                TrieElement::Node(node) => node.get_child(&short[..depth], short[depth], config),
            };
        }

        match current {
            TrieElement::Leaf(leaf) => leaf.mark_as_in_response(),
            TrieElement::Node(node) => {
                node.mark_as_in_response()
                    && node.scanning_mode(short, config) == ScanningMode::FinishedScanning
            }
        }
    }
}

impl Branch for Root {
    fn get_child(&mut self, _current_prefix: &[u8], bit: u8, config: &Config) -> &mut TrieElement {
        self.children[bit as usize].get_or_insert_with(|| {
            Box::new(TrieElement::Node(Node::new(&[], bit, false, config)))
        })
    }

    fn child_mut(&mut self, bit: u8) -> Option<&mut TrieElement> {
        self.children[bit as usize].as_deref_mut()
    }

    fn finish_child(&mut self, bit: u8) {
        let slot = &mut self.children[bit as usize];
        if let Some(child) = slot.take() {
            *slot = Some(Box::new(TrieElement::Leaf(child.into_leaf())));
        }
    }

    fn set_child_scanned(&mut self, _announced: bool) {}

    fn is_bgp_prefix(&self) -> bool {
        false
    }
}

/// Pick the next client prefix to probe.
///
/// Returns the prefix bits and whether the probe lies in announced space, or
/// `None` when nothing explorable is left. The walk is depth-first from the
/// root, starting in [`ScanningMode::BgpMode`]; the PRNG decides which child
/// is tried first at every level, so a seeded generator makes runs
/// reproducible.
pub fn next_parameters(
    root: &mut Root,
    config: &Config,
    rng: &mut dyn RngCore,
) -> Option<(Vec<u8>, bool)> {
    if !root.has_bgp_subnet(config) && !root.is_in_announced_space() {
        return None;
    }
    search_children(root, &[], ScanningMode::BgpMode, config, rng)
}

fn next_parameters_in(
    element: &mut TrieElement,
    prefix_up_to_parent: &[u8],
    mode: ScanningMode,
    config: &Config,
    rng: &mut dyn RngCore,
) -> Option<(Vec<u8>, bool)> {
    let node = match element {
        TrieElement::Leaf(_) => {
            debug!("trie: hit leaf");
            return None;
        }
        TrieElement::Node(node) => node,
    };

    let mut current_prefix = prefix_up_to_parent.to_vec();
    current_prefix.push(node.value());

    let node_mode = node.scanning_mode(&current_prefix, config);
    if node_mode == ScanningMode::FinishedScanning {
        return None;
    }
    let mode = mode.max(node_mode);

    // prefix mode: only announced subnets are worth descending into
    if mode == ScanningMode::BgpPrefixMode && !node.is_bgp_prefix() && !node.has_bgp_subnet() {
        return None;
    }
    if mode == ScanningMode::BgpMode && !node.has_bgp_subnet() && !node.is_in_announced_space() {
        return None;
    }

    // probing depth reached
    if current_prefix.len() == config.spl() {
        if node.was_scanned() {
            return None;
        }
        if mode == ScanningMode::SampleMode
            || (mode == ScanningMode::BgpMode && node.is_in_announced_space())
        {
            node.set_scanned();
            let announced = node.is_bgp_prefix();
            return Some((current_prefix, announced));
        }
        return None;
    }

    if let Some(found) = search_children(node, &current_prefix, mode, config, rng) {
        return Some(found);
    }

    // a terminal BGP-announced node collapses into itself: the prefix is
    // probed as a whole even when nothing below it is explorable anymore
    if node.is_bgp_prefix() {
        node.set_scanned();
        return Some((current_prefix, true));
    }

    None
}

enum ChildState {
    AlreadyLeaf,
    FinishNoBgp,
    FinishScanned,
    Live { covered: bool },
}

fn search_children<B: Branch>(
    parent: &mut B,
    current_prefix: &[u8],
    mode: ScanningMode,
    config: &Config,
    rng: &mut dyn RngCore,
) -> Option<(Vec<u8>, bool)> {
    let first: u8 = rng.gen_range(0..2);
    let second = 1 - first;

    let mut order: [Option<u8>; 2] = [None, None];
    let mut only_second_child_has_bgp = true;

    for (slot, bit) in [first, second].into_iter().enumerate() {
        // peek first, then act: finishing a child needs the borrow back
        let state = match parent.get_child(current_prefix, bit, config) {
            TrieElement::Leaf(_) => ChildState::AlreadyLeaf,
            TrieElement::Node(child) => {
                if mode == ScanningMode::BgpPrefixMode
                    && !child.is_bgp_prefix()
                    && !child.has_bgp_subnet()
                {
                    ChildState::FinishNoBgp
                } else if child.was_scanned() {
                    ChildState::FinishScanned
                } else {
                    ChildState::Live {
                        covered: child.has_bgp_subnet() || child.is_in_announced_space(),
                    }
                }
            }
        };

        match state {
            ChildState::AlreadyLeaf => {}
            ChildState::FinishNoBgp => {
                debug!("trie: finishing child without BGP coverage");
                parent.finish_child(bit);
            }
            ChildState::FinishScanned => {
                debug!("trie: finishing child that has already been scanned");
                parent.finish_child(bit);
            }
            ChildState::Live { covered } => {
                if (slot == 0 && covered) || (slot == 1 && !covered) {
                    only_second_child_has_bgp = false;
                }
                order[slot] = Some(bit);
            }
        }
    }

    if order.iter().all(Option::is_none) {
        return None;
    }

    // prefer the child with announced coverage
    if only_second_child_has_bgp {
        order.swap(0, 1);
    }

    for bit in order.into_iter().flatten() {
        let found = match parent.child_mut(bit) {
            Some(child) => next_parameters_in(child, current_prefix, mode, config, rng),
            None => None,
        };
        match found {
            Some((path, announced)) => {
                parent.set_child_scanned(announced);
                return Some((path, announced || parent.is_bgp_prefix()));
            }
            None => {
                debug!("trie: finishing child, no more scans to do below it");
                parent.finish_child(bit);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::{bits_to_ip, ip_to_bits};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::net::IpAddr;

    fn config(yaml: &str) -> Config {
        Config::from_yaml_str(yaml, None, false).unwrap()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    const SLASH8_SPL12: &str = r#"
address_family_number: 1
source_prefix_length: 12
source_address_space:
  - 10.0.0.0/8
per_prefix_probe_limit:
  12: 1
use_ark_vantage_points: [vp1]
max_parallel_domains: 1
"#;

    #[test]
    fn sample_expansion_exhausts_space_without_duplicates() {
        let config = config(SLASH8_SPL12);
        let mut root = Root::new();
        let mut rng = rng();

        // 16 distinct /12 prefixes fit under 10.0.0.0/8
        let mut seen = HashSet::new();
        for _ in 0..16 {
            let (path, _) = next_parameters(&mut root, &config, &mut rng).unwrap();
            assert_eq!(path.len(), 12);
            let ip = bits_to_ip(&path, false);
            assert!(ip.to_string().starts_with("10."), "outside space: {}", ip);
            assert!(seen.insert(path), "duplicate probe emitted");
        }

        // the announced /8 then collapses into itself
        let (path, announced) = next_parameters(&mut root, &config, &mut rng).unwrap();
        assert_eq!(path.len(), 8);
        assert!(announced);

        // and afterwards the tree is exhausted
        assert!(next_parameters(&mut root, &config, &mut rng).is_none());
    }

    const SLASH16_LIMITED: &str = r#"
address_family_number: 1
source_prefix_length: 24
source_address_space:
  - 10.0.0.0/16
per_prefix_probe_limit:
  16: 4
use_ark_vantage_points: [vp1]
max_parallel_domains: 1
"#;

    #[test]
    fn response_scope_finishes_domain() {
        let config = config(SLASH16_LIMITED);
        let mut root = Root::new();
        let mut rng = rng();

        let (path, _) = next_parameters(&mut root, &config, &mut rng).unwrap();
        assert_eq!(path.len(), 24);

        // the authoritative reveals it serves the whole /16 as a unit
        let client = bits_to_ip(&path, false);
        let bits = ip_to_bits(&client);
        assert!(root.handle_response(&bits[..16], &config));
    }

    #[test]
    fn response_feedback_is_idempotent() {
        let config = config(SLASH16_LIMITED);
        let mut root = Root::new();
        let mut rng = rng();

        let (path, _) = next_parameters(&mut root, &config, &mut rng).unwrap();
        let bits = {
            let client = bits_to_ip(&path, false);
            ip_to_bits(&client)
        };
        assert!(root.handle_response(&bits[..16], &config));
        assert!(root.handle_response(&bits[..16], &config));
    }

    #[test]
    fn scope_zero_never_finishes() {
        let config = config(SLASH16_LIMITED);
        let mut root = Root::new();

        for _ in 0..100 {
            assert!(!root.handle_response(&[], &config));
        }
        assert_eq!(root.scope_zero_observed, 100);
    }

    #[test]
    fn budget_forces_bgp_collapse_then_finish() {
        let config = config(SLASH16_LIMITED);
        let mut root = Root::new();
        let mut rng = rng();

        // four sampled probes at /24 depth fill the /16 budget
        for _ in 0..4 {
            let (path, _) = next_parameters(&mut root, &config, &mut rng).unwrap();
            assert_eq!(path.len(), 24);
        }

        // fifth pick: the announced /16 itself, probed as a whole
        let (path, announced) = next_parameters(&mut root, &config, &mut rng).unwrap();
        assert_eq!(path.len(), 16);
        assert!(announced);
        assert_eq!(bits_to_ip(&path, false).to_string(), "10.0.0.0");

        assert!(next_parameters(&mut root, &config, &mut rng).is_none());
    }

    #[test]
    fn probes_stay_inside_announced_space() {
        let config = config(SLASH16_LIMITED);
        let mut root = Root::new();
        let mut rng = rng();

        while let Some((path, _)) = next_parameters(&mut root, &config, &mut rng) {
            let ip: IpAddr = bits_to_ip(&path, false);
            match ip {
                IpAddr::V4(v4) => {
                    assert_eq!(v4.octets()[0], 10);
                    assert_eq!(v4.octets()[1], 0);
                }
                IpAddr::V6(_) => panic!("unexpected family"),
            }
        }
    }
}
