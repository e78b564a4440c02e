//! Interior trie node: one bit of the client prefix, two lazily-created
//! children, probe counters and the attributes derived from the configured
//! source address space.
use log::debug;

use crate::bitfield::{bits_to_ip, bits_to_key, largest_key_in_subnet};
use crate::config::Config;
use crate::trie::{Branch, Leaf, PrefixKind, ScanningMode, TrieElement};

#[derive(Debug)]
pub struct Node {
    value: u8,
    kind: PrefixKind,
    has_bgp_below: bool,
    is_announced: bool,
    pub children: [Option<Box<TrieElement>>; 2],
    pub node_scans: u64,
    pub scans_announced: u64,
    pub scans_unannounced: u64,
    pub counter_returned_as_scope: u64,
}

impl Node {
    /// Build the node for `prefix_up_to_parent` + `value`. The derived
    /// attributes are fixed here: `kind` is BgpAnnounced iff the full path is
    /// an exact configured source prefix, `has_bgp_below` iff any configured
    /// prefix falls inside the subnet the path denotes, and announced-ness is
    /// inherited downwards.
    pub fn new(prefix_up_to_parent: &[u8], value: u8, parent_announced: bool, config: &Config) -> Node {
        let mut path = prefix_up_to_parent.to_vec();
        path.push(value);

        let kind = if is_bgp_announced(&path, config) {
            PrefixKind::BgpAnnounced
        } else {
            PrefixKind::Unannounced
        };

        Node {
            value,
            kind,
            has_bgp_below: has_bgp_subnet(&path, config),
            is_announced: parent_announced || kind == PrefixKind::BgpAnnounced,
            children: [None, None],
            node_scans: 0,
            scans_announced: 0,
            scans_unannounced: 0,
            counter_returned_as_scope: 0,
        }
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn was_scanned(&self) -> bool {
        self.node_scans >= 1
    }

    /// A probe was issued for this node's own prefix.
    pub fn set_scanned(&mut self) {
        self.node_scans += 1;
        if self.kind == PrefixKind::BgpAnnounced {
            self.scans_announced += 1;
        } else {
            self.scans_unannounced += 1;
        }
    }

    /// A probe landed somewhere below this node; aggregate it into our
    /// counters so budget checks can see descendant activity.
    pub fn set_child_scanned(&mut self, child_announced: bool) {
        if child_announced || self.kind == PrefixKind::BgpAnnounced {
            self.scans_announced += 1;
        } else {
            self.scans_unannounced += 1;
        }
    }

    pub fn has_bgp_subnet(&self) -> bool {
        self.has_bgp_below
    }

    pub fn is_bgp_prefix(&self) -> bool {
        self.kind == PrefixKind::BgpAnnounced
    }

    pub fn is_in_announced_space(&self) -> bool {
        self.is_announced
    }

    pub fn mark_as_in_response(&mut self) -> bool {
        self.counter_returned_as_scope += 1;
        self.counter_returned_as_scope >= 1
    }

    pub fn is_marked_in_response(&self) -> bool {
        self.counter_returned_as_scope >= 1
    }

    /// Snapshot the counters into a leaf, dropping the subtree.
    pub fn into_leaf(self) -> Leaf {
        Leaf::new(
            self.value,
            self.kind,
            self.has_bgp_below,
            self.is_announced,
            self.node_scans,
            self.scans_announced,
            self.scans_unannounced,
        )
    }

    /// True iff this node or some materialized descendant is a BGP-announced
    /// prefix that has not been probed yet.
    pub fn any_unfinished_bgp_subnets_left(&self, path: &[u8], config: &Config) -> bool {
        if self.kind == PrefixKind::BgpAnnounced && !self.was_scanned() {
            return true;
        }
        if !self.has_bgp_below {
            return false;
        }
        if path.len() == config.spl() {
            return false;
        }
        for (bit, child) in self.children.iter().enumerate() {
            if let Some(child) = child {
                let mut child_path = path.to_vec();
                child_path.push(bit as u8);
                if child.any_unfinished_bgp_subnets_left(&child_path, config) {
                    return true;
                }
            }
        }
        false
    }

    /// Decide how this node may still be explored, given the budget at its
    /// depth and the feedback received so far.
    pub fn scanning_mode(&self, current_prefix: &[u8], config: &Config) -> ScanningMode {
        let depth = current_prefix.len();
        let limit = config.prefix_limit(depth);
        if limit == 0 {
            return ScanningMode::SampleMode;
        }

        if self.is_marked_in_response() {
            debug!(
                "trie: finish scanning as marked in response {}/{}",
                bits_to_ip(current_prefix, config.is_ipv6()),
                depth
            );
            return ScanningMode::FinishedScanning;
        }

        if self.scans_announced >= limit {
            if self.any_unfinished_bgp_subnets_left(current_prefix, config) {
                ScanningMode::BgpPrefixMode
            } else {
                debug!(
                    "trie: finish scanning, limit hit at {}/{}",
                    bits_to_ip(current_prefix, config.is_ipv6()),
                    depth
                );
                ScanningMode::FinishedScanning
            }
        } else {
            ScanningMode::SampleMode
        }
    }
}

impl Branch for Node {
    fn get_child(&mut self, current_prefix: &[u8], bit: u8, config: &Config) -> &mut TrieElement {
        let announced = self.is_announced;
        self.children[bit as usize].get_or_insert_with(|| {
            Box::new(TrieElement::Node(Node::new(current_prefix, bit, announced, config)))
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

    fn set_child_scanned(&mut self, announced: bool) {
        Node::set_child_scanned(self, announced);
    }

    fn is_bgp_prefix(&self) -> bool {
        Node::is_bgp_prefix(self)
    }
}

/// Exact-match lookup of a path in the configured source prefixes.
pub(crate) fn is_bgp_announced(path: &[u8], config: &Config) -> bool {
    let key = bits_to_key(path, config.is_ipv6());
    match config.source_prefixes().get(&key) {
        Some(lengths) => lengths.contains(&(path.len() as u8)),
        None => false,
    }
}

/// True iff some configured source prefix key falls within the key range the
/// path denotes (binary search over the sorted key list).
pub(crate) fn has_bgp_subnet(path: &[u8], config: &Config) -> bool {
    let start_key = bits_to_key(path, config.is_ipv6());
    let end_key = largest_key_in_subnet(path, config.is_ipv6());

    let list = config.source_prefix_list();
    let index = list.partition_point(|k| *k < start_key);
    if index == list.len() {
        return false;
    }
    start_key <= list[index] && list[index] <= end_key
}
