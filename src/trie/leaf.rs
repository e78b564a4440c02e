//! Terminal marker for a fully-explored subtree.
use crate::trie::{PrefixKind, ScanningMode};

/// Replaces a [`crate::trie::Node`] once its subtree is exhausted: keeps the
/// final counters for accounting, refuses further exploration.
#[derive(Debug)]
pub struct Leaf {
    value: u8,
    kind: PrefixKind,
    has_bgp_below: bool,
    is_announced: bool,
    pub leaf_scanned: u64,
    pub scans_announced: u64,
    pub scans_unannounced: u64,
}

impl Leaf {
    pub(crate) fn new(
        value: u8,
        kind: PrefixKind,
        has_bgp_below: bool,
        is_announced: bool,
        leaf_scanned: u64,
        scans_announced: u64,
        scans_unannounced: u64,
    ) -> Leaf {
        Leaf {
            value,
            kind,
            has_bgp_below,
            is_announced,
            leaf_scanned,
            scans_announced,
            scans_unannounced,
        }
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn was_scanned(&self) -> bool {
        self.leaf_scanned >= 1
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

    /// A leaf no longer cares about results below it.
    pub fn mark_as_in_response(&mut self) -> bool {
        true
    }

    pub fn scanning_mode(&self) -> ScanningMode {
        ScanningMode::FinishedScanning
    }

    /// How many probes landed inside this prefix before it was finished.
    pub fn scans_inside(&self) -> (u64, u64) {
        (self.scans_unannounced, self.scans_announced)
    }
}
