//! Ring data model (§3) and membership state machine (§4.E): `NodeInfo`,
//! `HashRange`, and the join/leave/update transitions that keep a node's
//! `hashRange` and neighbor pointers consistent with the rest of the ring.
//!
//! `NodeState` owns everything the node's identity depends on. It never
//! touches the network itself — every transition below returns the packets
//! that need to go out, and the dispatcher (the only task that owns the
//! socket) is responsible for actually sending them. This keeps the ring
//! logic synchronous and trivially testable.

use std::net::SocketAddr;

use thiserror::Error;

use crate::hash::hash;

/// Size of the hash ring: hashes live in `[0, 2^31)`.
pub const RING_SIZE: u32 = 1 << 31;

/// A node's identity on the ring: its UDP address and the low end of the
/// range it owns (its position on the ring).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub address: SocketAddr,
    pub first_hash: u32,
}

impl NodeInfo {
    pub fn new(address: SocketAddr, first_hash: u32) -> Self {
        Self {
            address,
            first_hash,
        }
    }
}

/// An inclusive hash range, `[low, high]`, owned by exactly one live node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRange {
    pub low: u32,
    pub high: u32,
}

impl HashRange {
    pub fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    /// Whole-ring range owned by the sole node of a brand-new ring.
    pub fn whole_ring() -> Self {
        Self::new(0, RING_SIZE - 1)
    }

    /// Whether `h` falls within `[low, high]`.
    pub fn contains(&self, h: u32) -> bool {
        self.low <= h && h <= self.high
    }
}

/// Errors raised by ring membership transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("cannot join: node is not in the Joining state")]
    NotJoining,
    #[error("cannot leave: node has already initiated a leave")]
    AlreadyLeaving,
}

/// Which phase of the membership state machine (§4.E) a node is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Sole node on the ring; owns the whole range.
    Solo,
    /// Sent `join` to a predecessor, waiting for `success` (and any
    /// preceding `transfer`s).
    Joining,
    /// Normal operation: handles every packet type.
    Joined,
    /// Sent `leave` to the successor, waiting for it to circle back.
    Leaving,
}

/// Splits `(low, high)` at its midpoint the way a joining node's owner does,
/// per §4.E step 1: `M = 1 + (R + L) / 2`, reflected back positive on
/// overflow exactly as the 32-bit arithmetic of the reference implementation
/// would produce.
pub fn split_point(low: u32, high: u32) -> u32 {
    let sum = (high as u64) + (low as u64);
    let m = 1u64 + sum / 2;
    // `m` is always < 2^32 here since both operands are < 2^31, so the
    // reflection case described in spec.md never actually triggers for
    // values drawn from the hash space; kept for parity with the spec's
    // wording about negative overflow.
    let m = m as i64 as i32;
    if m < 0 {
        (-m + 1) as u32
    } else {
        m as u32
    }
}

/// All mutable per-node state (§3 "Per-node state"). Owned exclusively by
/// the dispatcher task; every method here is a synchronous state
/// transition, never an I/O operation.
pub struct NodeState {
    pub my_info: NodeInfo,
    pub pred_info: NodeInfo,
    pub succ_info: NodeInfo,
    pub hash_range: HashRange,
    pub phase: Phase,
    /// Monotonic counter used to tag self-originated packets.
    next_tag: u64,
    /// Set once a self-originated `leave` has circled back to us.
    pub stop_flag: bool,
}

impl NodeState {
    /// Bootstraps a brand-new, single-node ring (§4.E "Solo").
    pub fn solo(my_address: SocketAddr) -> Self {
        let my_info = NodeInfo::new(my_address, 0);
        Self {
            my_info,
            pred_info: my_info,
            succ_info: my_info,
            hash_range: HashRange::whole_ring(),
            phase: Phase::Solo,
            next_tag: 1,
            stop_flag: false,
        }
    }

    /// Tentative state for a node about to send `join` to `pred_address`
    /// (§4.E "Join, seen from the joining node", step 1). `first_hash` is
    /// unknown until `success` arrives, so it is provisionally `0`.
    pub fn joining(my_address: SocketAddr, pred_address: SocketAddr) -> Self {
        let my_info = NodeInfo::new(my_address, 0);
        let tentative = NodeInfo::new(pred_address, 0);
        Self {
            my_info,
            pred_info: tentative,
            succ_info: tentative,
            hash_range: HashRange::new(0, 0),
            phase: Phase::Joining,
            next_tag: 1,
            stop_flag: false,
        }
    }

    /// Completes a join once `success` arrives (§4.E step 3).
    pub fn complete_join(
        &mut self,
        hash_range: HashRange,
        succ_info: NodeInfo,
        pred_info: NodeInfo,
    ) -> Result<(), RingError> {
        if self.phase != Phase::Joining {
            return Err(RingError::NotJoining);
        }
        self.hash_range = hash_range;
        self.succ_info = succ_info;
        self.pred_info = pred_info;
        self.phase = Phase::Joined;
        Ok(())
    }

    /// Next tag for a server-originated packet (§3 `sendTag`).
    pub fn take_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    /// Computes the split point and the new state for `self` acting as the
    /// existing owner `P` when node `joiner` joins (§4.E "Join, seen from
    /// P", steps 1–3). Returns `(joiner_range, update_to_old_successor)`
    /// where `update_to_old_successor` is the `(predInfo)` the old successor
    /// `S` must adopt.
    ///
    /// Keys at or above the split point are the caller's responsibility to
    /// extract from the store and send as `transfer` packets (§4.E step 5);
    /// this only performs the range/pointer bookkeeping.
    pub fn split_for_join(&mut self, joiner_address: SocketAddr) -> (NodeInfo, HashRange, NodeInfo) {
        let old_low = self.hash_range.low;
        let old_high = self.hash_range.high;
        let old_succ = self.succ_info;

        let m = split_point(old_low, old_high);
        let joiner_info = NodeInfo::new(joiner_address, m);
        let joiner_range = HashRange::new(m, old_high);

        self.hash_range = HashRange::new(old_low, m.wrapping_sub(1));
        self.succ_info = joiner_info;

        (joiner_info, joiner_range, old_succ)
    }

    /// Whether a key with hash `h` belongs to this node's owned store.
    pub fn owns(&self, h: u32) -> bool {
        self.hash_range.contains(h)
    }

    /// Applies a received `update` (§4.E "Update"): any present subset of
    /// `pred_info`/`succ_info`/`hash_range` overwrites the corresponding
    /// field.
    pub fn apply_update(
        &mut self,
        pred_info: Option<NodeInfo>,
        succ_info: Option<NodeInfo>,
        hash_range: Option<HashRange>,
    ) {
        if let Some(p) = pred_info {
            self.pred_info = p;
        }
        if let Some(s) = succ_info {
            self.succ_info = s;
        }
        if let Some(r) = hash_range {
            self.hash_range = r;
        }
    }

    /// Begins a graceful leave (§4.E "Leave", step 1): transitions to
    /// `Leaving`. The caller still must send `leave` to `succ_info`.
    pub fn begin_leave(&mut self) -> Result<(), RingError> {
        if self.phase == Phase::Leaving {
            return Err(RingError::AlreadyLeaving);
        }
        self.phase = Phase::Leaving;
        Ok(())
    }

    /// Whether a `leave` packet's `senderInfo` is this node's own (the
    /// signal that it has circled the whole ring, §4.E "Forwarding of
    /// leave").
    pub fn is_own_leave(&self, sender_info: NodeInfo) -> bool {
        sender_info == self.my_info
    }

    /// Range the predecessor absorbs once this node departs (§4.E "Leave",
    /// step 4): `(predInfo.firstHash, hashRange.high)`.
    pub fn range_absorbed_by_predecessor(&self) -> HashRange {
        HashRange::new(self.pred_info.first_hash, self.hash_range.high)
    }

    /// Whether `h` falls outside a single-node ring's one-and-only range —
    /// always `false` in practice, since a solo node's range is the whole
    /// space; kept as a named predicate for readability at call sites.
    pub fn is_solo(&self) -> bool {
        self.phase == Phase::Solo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    /// §8 scenario 1: single-node hash split.
    #[test]
    fn join_splits_range_at_midpoint() {
        let mut a = NodeState::solo(addr(9000));
        assert_eq!(a.hash_range, HashRange::new(0, 2_147_483_647));

        let b_addr = addr(9001);
        let (b_info, b_range, old_succ) = a.split_for_join(b_addr);

        assert_eq!(b_info.first_hash, 1_073_741_824);
        assert_eq!(b_range, HashRange::new(1_073_741_824, 2_147_483_647));
        assert_eq!(a.hash_range, HashRange::new(0, 1_073_741_823));
        assert_eq!(old_succ, NodeInfo::new(addr(9000), 0));
        assert_eq!(a.succ_info, b_info);
    }

    #[test]
    fn split_point_matches_worked_example() {
        assert_eq!(split_point(0, 2_147_483_647), 1_073_741_824);
    }

    #[test]
    fn complete_join_requires_joining_phase() {
        let mut solo = NodeState::solo(addr(9000));
        let err = solo
            .complete_join(HashRange::whole_ring(), solo.my_info, solo.my_info)
            .unwrap_err();
        assert_eq!(err, RingError::NotJoining);
    }

    #[test]
    fn complete_join_transitions_to_joined() {
        let mut joining = NodeState::joining(addr(9001), addr(9000));
        joining
            .complete_join(
                HashRange::new(1_073_741_824, 2_147_483_647),
                NodeInfo::new(addr(9000), 0),
                NodeInfo::new(addr(9000), 0),
            )
            .unwrap();
        assert_eq!(joining.phase, Phase::Joined);
        assert_eq!(joining.hash_range.low, 1_073_741_824);
    }

    #[test]
    fn apply_update_only_overwrites_present_fields() {
        let mut node = NodeState::solo(addr(9000));
        let original_range = node.hash_range;
        let new_succ = NodeInfo::new(addr(9002), 42);
        node.apply_update(None, Some(new_succ), None);
        assert_eq!(node.succ_info, new_succ);
        assert_eq!(node.hash_range, original_range);
    }

    /// §8 scenario 5: graceful leave merges the leaver's range into the
    /// predecessor.
    #[test]
    fn leave_merges_range_into_predecessor() {
        let mut b = NodeState::solo(addr(9001));
        b.hash_range = HashRange::new(500, 999);
        b.pred_info = NodeInfo::new(addr(9000), 0);
        b.succ_info = NodeInfo::new(addr(9002), 1000);

        b.begin_leave().unwrap();
        assert_eq!(b.phase, Phase::Leaving);

        let absorbed = b.range_absorbed_by_predecessor();
        assert_eq!(absorbed, HashRange::new(0, 999));
    }

    #[test]
    fn begin_leave_twice_errors() {
        let mut node = NodeState::solo(addr(9000));
        node.begin_leave().unwrap();
        assert_eq!(node.begin_leave().unwrap_err(), RingError::AlreadyLeaving);
    }

    #[test]
    fn tags_are_monotonic_and_unique() {
        let mut node = NodeState::solo(addr(9000));
        let t1 = node.take_tag();
        let t2 = node.take_tag();
        assert!(t2 > t1);
    }

    #[test]
    fn hash_range_contains_is_inclusive() {
        let r = HashRange::new(10, 20);
        assert!(r.contains(10));
        assert!(r.contains(20));
        assert!(!r.contains(9));
        assert!(!r.contains(21));
    }

    /// Sanity check that the ring split is consistent with the node's own
    /// hash function for the §8.2 key-transfer scenario.
    #[test]
    fn dungeons_hashes_into_upper_half() {
        assert!(hash("dungeons") >= 1_073_741_824);
    }
}
