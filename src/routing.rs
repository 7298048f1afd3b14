//! Bounded routing table (§4.D): a capacity-limited ordered set of
//! `NodeInfo` entries used to pick forwarding next-hops, plus the wrap-
//! around distance metric that `forward` (in `dispatcher.rs`) uses to pick
//! among them.

use tracing::debug;

use crate::ring::NodeInfo;

/// Modulus `forward`'s distance metric actually uses. §9 flags this as a
/// likely source bug — it should be `2^31`, the ring size, but the
/// reference implementation uses `Integer.MAX_VALUE` (`2^31 - 1`) instead.
/// Reproduced verbatim for interop with existing peers.
pub const DISTANCE_MODULUS: u32 = u32::MAX >> 1;

/// Bounded, duplicate-free, ordered collection of `NodeInfo` (§4.D).
#[derive(Debug)]
pub struct RoutingTable {
    capacity: usize,
    entries: Vec<NodeInfo>,
    my_info: NodeInfo,
}

impl RoutingTable {
    pub fn new(capacity: usize, my_info: NodeInfo) -> Self {
        Self {
            capacity,
            entries: Vec::new(),
            my_info,
        }
    }

    pub fn entries(&self) -> &[NodeInfo] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry (§4.E "Leave", step 6: "Clear store, cache, rteTbl").
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, n: &NodeInfo) -> bool {
        self.entries.contains(n)
    }

    /// §4.D "Insertion": ignores self and duplicates; appends under
    /// capacity; otherwise evicts the first non-`succ_info` entry.
    /// Reproduces the `size <= capacity` check (rather than `<`) noted in
    /// §9 as a likely off-by-one in the source.
    pub fn add_route(&mut self, n: NodeInfo, succ_info: NodeInfo, debug_enabled: bool) {
        if n == self.my_info {
            return;
        }
        if self.entries.contains(&n) {
            return;
        }

        if self.entries.len() <= self.capacity {
            self.entries.push(n);
        } else {
            match self.entries.iter().position(|e| *e != succ_info) {
                Some(idx) => {
                    self.entries.remove(idx);
                    self.entries.push(n);
                }
                None => return,
            }
        }

        if debug_enabled {
            debug!(table = ?self.entries, "routing table changed");
        }
    }

    /// §4.D "Removal": deletes every entry whose address matches, iterating
    /// back-to-front so in-place removal doesn't skip entries.
    pub fn remove_route(&mut self, address: std::net::SocketAddr, debug_enabled: bool) {
        let before = self.entries.len();
        for i in (0..self.entries.len()).rev() {
            if self.entries[i].address == address {
                self.entries.remove(i);
            }
        }
        if debug_enabled && self.entries.len() != before {
            debug!(table = ?self.entries, "routing table changed");
        }
    }

    /// Clockwise ring distance from `node` to `target`, using the modulus
    /// §9 notes the reference implementation actually applies.
    fn distance(node: NodeInfo, target: u32) -> u32 {
        target.wrapping_sub(node.first_hash) % DISTANCE_MODULUS
    }

    /// Picks the entry minimizing [`distance`] to `target`. Ties keep the
    /// last-scanned minimum (§4.F "equivalent to `≤` comparison during
    /// scan"). Returns `None` only if the table is empty, which shouldn't
    /// happen under Invariant 1 once the ring has ≥ 2 nodes.
    pub fn closest_to(&self, target: u32) -> Option<NodeInfo> {
        let mut best: Option<(NodeInfo, u32)> = None;
        for &entry in &self.entries {
            let d = Self::distance(entry, target);
            match best {
                Some((_, best_d)) if d > best_d => {}
                _ => best = Some((entry, d)),
            }
        }
        best.map(|(n, _)| n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> std::net::SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn info(port: u16, first_hash: u32) -> NodeInfo {
        NodeInfo::new(addr(port), first_hash)
    }

    #[test]
    fn ignores_self() {
        let me = info(9000, 0);
        let mut t = RoutingTable::new(4, me);
        t.add_route(me, me, false);
        assert!(t.is_empty());
    }

    #[test]
    fn ignores_duplicates() {
        let me = info(9000, 0);
        let other = info(9001, 10);
        let mut t = RoutingTable::new(4, me);
        t.add_route(other, other, false);
        t.add_route(other, other, false);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn appends_under_capacity() {
        let me = info(9000, 0);
        let succ = info(9001, 10);
        let mut t = RoutingTable::new(4, me);
        t.add_route(succ, succ, false);
        t.add_route(info(9002, 20), succ, false);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn evicts_first_non_successor_when_over_capacity() {
        let me = info(9000, 0);
        let succ = info(9001, 10);
        let mut t = RoutingTable::new(1, me);
        t.add_route(succ, succ, false);
        t.add_route(info(9002, 20), succ, false);
        // capacity 1, size 1 <= 1 so this still appends (reproducing the
        // `<=` quirk), leaving both until a third insert forces eviction.
        assert_eq!(t.len(), 2);
        t.add_route(info(9003, 30), succ, false);
        assert_eq!(t.len(), 2);
        assert!(t.contains(&succ));
        assert!(t.contains(&info(9003, 30)));
        assert!(!t.contains(&info(9002, 20)));
    }

    #[test]
    fn remove_route_deletes_by_address() {
        let me = info(9000, 0);
        let other = info(9001, 10);
        let mut t = RoutingTable::new(4, me);
        t.add_route(other, other, false);
        t.remove_route(addr(9001), false);
        assert!(t.is_empty());
    }

    #[test]
    fn clear_empties_the_table() {
        let me = info(9000, 0);
        let mut t = RoutingTable::new(4, me);
        t.add_route(info(9001, 10), info(9001, 10), false);
        t.add_route(info(9002, 20), info(9001, 10), false);
        t.clear();
        assert!(t.is_empty());
    }

    /// §8 scenario 6: routing selection under wrap.
    #[test]
    fn forward_distance_wraps_modulo_2_31() {
        let me = info(9000, 0);
        let x = info(9100, 100);
        let y = info(9200, 2_000_000_000);
        let mut t = RoutingTable::new(4, me);
        t.add_route(x, x, false);
        t.add_route(y, y, false);

        let chosen = t.closest_to(50).unwrap();
        assert_eq!(chosen, y);
    }
}
