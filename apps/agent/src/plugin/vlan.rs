//! Global VLAN tag allocator.
//!
//! One allocator per agent, because every lab shares one OVS bridge: two labs
//! holding the same tag value would L2-bridge into each other, and VXLAN
//! trunks carry tags through the underlay. The allocator therefore skips both
//! tags it has handed out and tags observed live on any bridge port.

pub const VLAN_RANGE_START: u16 = 100;
pub const VLAN_RANGE_END: u16 = 4000;

use std::collections::HashSet;

#[derive(Debug)]
pub struct VlanAllocator {
    next: u16,
    allocated: HashSet<u16>,
}

impl Default for VlanAllocator {
    fn default() -> Self {
        Self::new(VLAN_RANGE_START)
    }
}

impl VlanAllocator {
    pub fn new(next: u16) -> Self {
        let next = if (VLAN_RANGE_START..=VLAN_RANGE_END).contains(&next) {
            next
        } else {
            VLAN_RANGE_START
        };
        Self {
            next,
            allocated: HashSet::new(),
        }
    }

    pub fn next_pointer(&self) -> u16 {
        self.next
    }

    /// Record a tag recovered from persisted or discovered state so it is
    /// never handed out again while in use.
    pub fn mark_allocated(&mut self, tag: u16) {
        self.allocated.insert(tag);
    }

    pub fn release(&mut self, tag: u16) {
        self.allocated.remove(&tag);
    }

    /// Allocate the next tag not in our allocated set and not in `in_use`
    /// (the live set of tags on the bridge). Wraps at the range end. Returns
    /// None only when the whole range is exhausted.
    pub fn allocate(&mut self, in_use: &HashSet<u16>) -> Option<u16> {
        let range_len = (VLAN_RANGE_END - VLAN_RANGE_START + 1) as usize;
        for _ in 0..range_len {
            let candidate = self.next;
            self.next = if self.next >= VLAN_RANGE_END {
                VLAN_RANGE_START
            } else {
                self.next + 1
            };
            if self.allocated.contains(&candidate) || in_use.contains(&candidate) {
                continue;
            }
            self.allocated.insert(candidate);
            return Some(candidate);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_sequentially() {
        let mut alloc = VlanAllocator::default();
        let in_use = HashSet::new();
        assert_eq!(alloc.allocate(&in_use), Some(100));
        assert_eq!(alloc.allocate(&in_use), Some(101));
        assert_eq!(alloc.allocate(&in_use), Some(102));
    }

    #[test]
    fn skips_tags_in_use_on_bridge() {
        let mut alloc = VlanAllocator::default();
        let in_use: HashSet<u16> = [100, 101, 103].into_iter().collect();
        assert_eq!(alloc.allocate(&in_use), Some(102));
        assert_eq!(alloc.allocate(&in_use), Some(104));
    }

    #[test]
    fn wraps_at_range_end_and_still_skips() {
        let mut alloc = VlanAllocator::new(3999);
        let in_use: HashSet<u16> = [4000, 100].into_iter().collect();
        assert_eq!(alloc.allocate(&in_use), Some(3999));
        // 4000 and 100 are live on the bridge; wraparound lands on 101.
        assert_eq!(alloc.allocate(&in_use), Some(101));
    }

    #[test]
    fn release_returns_tag_to_pool() {
        let mut alloc = VlanAllocator::default();
        let in_use = HashSet::new();
        let tag = alloc.allocate(&in_use).unwrap();
        alloc.release(tag);
        // Pointer advanced, but after a full wrap the tag is available again.
        let mut seen = HashSet::new();
        for _ in 0..(VLAN_RANGE_END - VLAN_RANGE_START + 1) {
            if let Some(t) = alloc.allocate(&in_use) {
                seen.insert(t);
            }
        }
        assert!(seen.contains(&tag));
    }

    #[test]
    fn never_duplicates_outstanding_allocations() {
        let mut alloc = VlanAllocator::default();
        let in_use = HashSet::new();
        let mut handed_out = HashSet::new();
        for _ in 0..500 {
            let tag = alloc.allocate(&in_use).unwrap();
            assert!(handed_out.insert(tag), "tag {tag} allocated twice");
        }
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut alloc = VlanAllocator::default();
        let in_use: HashSet<u16> = (VLAN_RANGE_START..=VLAN_RANGE_END).collect();
        assert_eq!(alloc.allocate(&in_use), None);
    }

    #[test]
    fn out_of_range_pointer_resets() {
        let alloc = VlanAllocator::new(5000);
        assert_eq!(alloc.next_pointer(), VLAN_RANGE_START);
    }
}
