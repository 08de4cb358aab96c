//! Virtual link table.
//!
//! Four fixed slots with a `usage` bitmap. Slot 0 is reserved for the
//! upstream parent; slots 1..3 hold downstream children. A populated slot
//! carries the peer's MAC, node id and the handle of its liveness timer
//! (upstream probe for slot 0, decay for downstream slots).
//!
//! Invariants: a set usage bit means a non-zero node id (the root's
//! sentinel uplink is the one exception), at most one slot per peer id,
//! and at most one upstream.

use treelink_core::id::{Mac, NodeId};
use treelink_core::{NetError, NetResult};

use crate::timer::TimerHandle;

/// Total slots, upstream included.
pub const LINK_TABLE_SIZE: usize = 4;

/// Index of the upstream slot.
pub const LINK_UP: usize = 0;

/// One virtual link.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkEntry {
    pub mac: Mac,
    pub id: NodeId,
    pub timer: Option<TimerHandle>,
}

/// Fixed-size table of virtual links plus usage bitmap.
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    entries: [LinkEntry; LINK_TABLE_SIZE],
    usage: u32,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_used(&self, slot: usize) -> bool {
        self.usage & (1 << slot) != 0
    }

    /// Populated entry at `slot`, if any.
    pub fn entry(&self, slot: usize) -> Option<&LinkEntry> {
        self.is_used(slot).then(|| &self.entries[slot])
    }

    pub fn entry_mut(&mut self, slot: usize) -> Option<&mut LinkEntry> {
        self.is_used(slot).then(|| &mut self.entries[slot])
    }

    /// Mark the upstream slot present without a peer. The root is "linked"
    /// from birth; its sentinel uplink never names a node.
    pub fn mark_root_uplink(&mut self) {
        self.usage |= 1 << LINK_UP;
    }

    #[inline]
    pub fn has_uplink(&self) -> bool {
        self.is_used(LINK_UP)
    }

    /// Lowest free downstream slot, if any.
    pub fn available_downlink_slot(&self) -> Option<usize> {
        (0..LINK_TABLE_SIZE).find(|&i| i != LINK_UP && !self.is_used(i))
    }

    /// Install the upstream link. Fails if one is already present.
    /// The caller arms the slot's probe timer.
    pub fn set_uplink(&mut self, mac: Mac, id: NodeId) -> NetResult<()> {
        debug_assert!(id != 0);
        if self.has_uplink() {
            return Err(NetError::LinkExists);
        }
        self.usage |= 1 << LINK_UP;
        self.entries[LINK_UP] = LinkEntry {
            mac,
            id,
            timer: None,
        };
        Ok(())
    }

    /// Install a downstream link in the lowest free slot and return its
    /// index. Fails when the table is full or the peer is already linked.
    /// The caller arms the slot's decay timer.
    pub fn set_downlink(&mut self, mac: Mac, id: NodeId) -> NetResult<usize> {
        debug_assert!(id != 0);
        if self.is_linked(id) {
            return Err(NetError::LinkExists);
        }
        let slot = self.available_downlink_slot().ok_or(NetError::TableFull)?;
        self.usage |= 1 << slot;
        self.entries[slot] = LinkEntry {
            mac,
            id,
            timer: None,
        };
        Ok(slot)
    }

    /// Clear a slot and return its previous entry.
    pub fn clear_slot(&mut self, slot: usize) -> Option<LinkEntry> {
        if !self.is_used(slot) {
            return None;
        }
        self.usage &= !(1 << slot);
        let old = self.entries[slot];
        self.entries[slot] = LinkEntry::default();
        Some(old)
    }

    pub fn is_upstream(&self, id: NodeId) -> bool {
        debug_assert!(id != 0);
        self.is_used(LINK_UP) && self.entries[LINK_UP].id == id
    }

    pub fn is_downstream(&self, id: NodeId) -> bool {
        debug_assert!(id != 0);
        (0..LINK_TABLE_SIZE)
            .any(|i| i != LINK_UP && self.is_used(i) && self.entries[i].id == id)
    }

    pub fn is_linked(&self, id: NodeId) -> bool {
        self.is_upstream(id) || self.is_downstream(id)
    }

    /// Slot index and entry for a peer id.
    pub fn find_entry(&self, id: NodeId) -> Option<(usize, &LinkEntry)> {
        (0..LINK_TABLE_SIZE)
            .find(|&i| self.is_used(i) && self.entries[i].id == id)
            .map(|i| (i, &self.entries[i]))
    }

    /// MAC for a linked peer id. Broadcast and the pending-proposal peer
    /// are resolved by the node, which owns that extra state.
    pub fn find_mac(&self, id: NodeId) -> Option<Mac> {
        self.find_entry(id).map(|(_, e)| e.mac)
    }

    /// Node id for a linked peer MAC.
    pub fn find_id(&self, mac: &Mac) -> Option<NodeId> {
        (0..LINK_TABLE_SIZE)
            .find(|&i| self.is_used(i) && self.entries[i].mac == *mac)
            .map(|i| self.entries[i].id)
    }

    /// Upstream peer id, when a real (non-sentinel) uplink exists.
    pub fn upstream_id(&self) -> Option<NodeId> {
        if self.has_uplink() && self.entries[LINK_UP].id != 0 {
            Some(self.entries[LINK_UP].id)
        } else {
            None
        }
    }

    /// Populated downstream slots as `(slot, id)`.
    pub fn downstream(&self) -> Vec<(usize, NodeId)> {
        (0..LINK_TABLE_SIZE)
            .filter(|&i| i != LINK_UP && self.is_used(i))
            .map(|i| (i, self.entries[i].id))
            .collect()
    }

    /// All populated slots as `(slot, id, mac)`, for diagnostics.
    pub fn dump(&self) -> Vec<(usize, NodeId, Mac)> {
        (0..LINK_TABLE_SIZE)
            .filter(|&i| self.is_used(i))
            .map(|i| (i, self.entries[i].id, self.entries[i].mac))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> Mac {
        Mac([b; 6])
    }

    /// Every usage bit set must mean a non-zero id (root sentinel aside).
    fn assert_invariants(t: &LinkTable) {
        for i in 0..LINK_TABLE_SIZE {
            if t.is_used(i) {
                if i != LINK_UP {
                    assert_ne!(t.entries[i].id, 0);
                }
            } else {
                assert_eq!(t.entries[i].id, 0);
                assert!(t.entries[i].mac.is_zero());
            }
        }
        // No duplicate ids among populated slots.
        let mut ids: Vec<NodeId> = (0..LINK_TABLE_SIZE)
            .filter(|&i| t.is_used(i) && t.entries[i].id != 0)
            .map(|i| t.entries[i].id)
            .collect();
        ids.sort();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[test]
    fn test_uplink_single() {
        let mut t = LinkTable::new();
        assert!(!t.has_uplink());
        t.set_uplink(mac(1), 0x16).unwrap();
        assert!(t.has_uplink());
        assert_eq!(t.set_uplink(mac(2), 0x18), Err(NetError::LinkExists));
        assert!(t.is_upstream(0x16));
        assert!(!t.is_downstream(0x16));
        assert_invariants(&t);
    }

    #[test]
    fn test_downlinks_fill_lowest_first() {
        let mut t = LinkTable::new();
        assert_eq!(t.set_downlink(mac(1), 0x11).unwrap(), 1);
        assert_eq!(t.set_downlink(mac(2), 0x12).unwrap(), 2);
        assert_eq!(t.set_downlink(mac(3), 0x13).unwrap(), 3);
        assert_eq!(t.set_downlink(mac(4), 0x14), Err(NetError::TableFull));
        assert_invariants(&t);

        // Freeing the middle slot makes it the next pick.
        t.clear_slot(2);
        assert_eq!(t.available_downlink_slot(), Some(2));
        assert_eq!(t.set_downlink(mac(5), 0x15).unwrap(), 2);
        assert_invariants(&t);
    }

    #[test]
    fn test_no_duplicate_peer() {
        let mut t = LinkTable::new();
        t.set_downlink(mac(1), 0x11).unwrap();
        assert_eq!(t.set_downlink(mac(9), 0x11), Err(NetError::LinkExists));
        assert_invariants(&t);
    }

    #[test]
    fn test_queries() {
        let mut t = LinkTable::new();
        t.set_uplink(mac(1), 0x16).unwrap();
        t.set_downlink(mac(2), 0x17).unwrap();

        assert!(t.is_linked(0x16));
        assert!(t.is_linked(0x17));
        assert!(!t.is_linked(0x20));
        assert_eq!(t.find_mac(0x17), Some(mac(2)));
        assert_eq!(t.find_id(&mac(1)), Some(0x16));
        assert_eq!(t.find_id(&mac(7)), None);
        assert_eq!(t.upstream_id(), Some(0x16));
        assert_eq!(t.downstream(), vec![(1, 0x17)]);
        assert_eq!(t.dump().len(), 2);
    }

    #[test]
    fn test_clear_slot_resets_entry() {
        let mut t = LinkTable::new();
        let slot = t.set_downlink(mac(2), 0x17).unwrap();
        let old = t.clear_slot(slot).unwrap();
        assert_eq!(old.id, 0x17);
        assert!(t.clear_slot(slot).is_none());
        assert!(!t.is_linked(0x17));
        assert_invariants(&t);
    }

    #[test]
    fn test_root_sentinel() {
        let mut t = LinkTable::new();
        t.mark_root_uplink();
        assert!(t.has_uplink());
        assert_eq!(t.upstream_id(), None);
        // A sentinel uplink never matches a real peer id.
        assert!(!t.is_upstream(0x16));
    }

    #[test]
    fn test_random_op_sequences_keep_invariants() {
        let mut t = LinkTable::new();
        let ops: [(u8, NodeId); 12] = [
            (0, 0x11),
            (0, 0x12),
            (1, 0x11),
            (0, 0x13),
            (0, 0x14),
            (0, 0x15),
            (1, 0x13),
            (1, 0x13),
            (0, 0x16),
            (1, 0x12),
            (0, 0x17),
            (0, 0x12),
        ];
        for (op, id) in ops {
            match op {
                0 => {
                    let _ = t.set_downlink(mac(id), id);
                }
                _ => {
                    if let Some((slot, _)) = t.find_entry(id) {
                        t.clear_slot(slot);
                    }
                }
            }
            assert_invariants(&t);
        }
    }
}
