// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Address blocks and the sparse per-address state they carry.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::{Duration, SystemTime},
};

use ipnet::IpNet;
use thiserror::Error;

use crate::key::{WorkloadKey, WorkloadMetadata};

/// Address family selector for assignment and statistics queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    pub(crate) fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => IpFamily::V4,
            IpNet::V6(_) => IpFamily::V6,
        }
    }
}

/// Block registration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    /// The delegated prefix spans the entire address space.
    #[error("prefix {0} spans the whole address space")]
    PrefixTooLarge(IpNet),
}

/// State of an address that has left the implicit-Free default.
///
/// Untouched addresses of a block are free and carry no record at all. An
/// address re-enters the assignable set once its cooling window has elapsed;
/// expiry is evaluated lazily against "now", never by a timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AddressState {
    Assigned {
        key: WorkloadKey,
        metadata: WorkloadMetadata,
        assigned_at: SystemTime,
    },
    Cooling {
        unassigned_at: SystemTime,
    },
}

impl AddressState {
    pub(crate) fn is_assigned(&self) -> bool {
        matches!(self, AddressState::Assigned { .. })
    }

    /// Whether the address may be handed out again.
    pub(crate) fn reusable(&self, now: SystemTime, window: Duration) -> bool {
        match self {
            AddressState::Assigned { .. } => false,
            AddressState::Cooling { unassigned_at } => now
                .duration_since(*unassigned_at)
                .is_ok_and(|since| since >= window),
        }
    }

    /// Still inside the cooldown window as of `now`.
    pub(crate) fn is_cooling(&self, now: SystemTime, window: Duration) -> bool {
        matches!(self, AddressState::Cooling { .. }) && !self.reusable(now, window)
    }
}

/// A registered CIDR on an interface: one routable host address, or a
/// delegated prefix of addresses.
///
/// Delegated prefixes can be astronomically large (a /80 over the 128-bit
/// space holds 2^48 addresses), so the block records only the addresses that
/// have ever been assigned, keyed by their offset from the network address.
/// `cursor` is the lowest never-touched offset and only moves forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AddressBlock {
    pub(crate) cidr: IpNet,
    pub(crate) is_prefix: bool,
    pub(crate) cursor: u128,
    pub(crate) touched: BTreeMap<u128, AddressState>,
}

impl AddressBlock {
    pub(crate) fn new(cidr: IpNet, is_prefix: bool) -> Result<Self, BlockError> {
        if is_prefix && host_bits(&cidr) >= 128 {
            return Err(BlockError::PrefixTooLarge(cidr));
        }
        Ok(Self {
            cidr,
            is_prefix,
            cursor: 0,
            touched: BTreeMap::new(),
        })
    }

    /// Number of allocatable addresses in this block.
    pub(crate) fn capacity(&self) -> u128 {
        if self.is_prefix {
            1u128 << host_bits(&self.cidr)
        } else {
            1
        }
    }

    /// The address at the given offset from the start of the block.
    pub(crate) fn addr_at(&self, offset: u128) -> IpAddr {
        if !self.is_prefix {
            return self.cidr.addr();
        }
        bits_to_addr(addr_bits(self.cidr.network()) + offset, &self.cidr)
    }

    /// The offset of the given address inside this block, if it is covered.
    pub(crate) fn offset_of(&self, addr: &IpAddr) -> Option<u128> {
        if !self.is_prefix {
            return (*addr == self.cidr.addr()).then_some(0);
        }
        if !self.cidr.contains(addr) {
            return None;
        }
        Some(addr_bits(*addr) - addr_bits(self.cidr.network()))
    }

    pub(crate) fn state_at(&self, offset: u128) -> Option<&AddressState> {
        self.touched.get(&offset)
    }

    /// Lowest offset eligible for a new assignment.
    ///
    /// Expired cooling entries are reused before the untouched cursor
    /// advances; this keeps the sparse record from growing on churn.
    pub(crate) fn next_candidate(&self, now: SystemTime, window: Duration) -> Option<u128> {
        if let Some((&offset, _)) = self
            .touched
            .iter()
            .find(|(_, state)| state.reusable(now, window))
        {
            return Some(offset);
        }
        (self.cursor < self.capacity()).then_some(self.cursor)
    }

    pub(crate) fn mark_assigned(
        &mut self,
        offset: u128,
        key: WorkloadKey,
        metadata: WorkloadMetadata,
        assigned_at: SystemTime,
    ) {
        self.touched.insert(
            offset,
            AddressState::Assigned {
                key,
                metadata,
                assigned_at,
            },
        );
        while self.touched.contains_key(&self.cursor) {
            self.cursor += 1;
        }
    }

    pub(crate) fn mark_cooling(&mut self, offset: u128, unassigned_at: SystemTime) {
        self.touched
            .insert(offset, AddressState::Cooling { unassigned_at });
    }

    /// Reverts a mutation at `offset` to a previously captured state.
    pub(crate) fn revert(&mut self, offset: u128, prior: Option<AddressState>, cursor: u128) {
        match prior {
            Some(state) => {
                self.touched.insert(offset, state);
            }
            None => {
                self.touched.remove(&offset);
            }
        }
        self.cursor = cursor;
    }

    pub(crate) fn assigned_count(&self) -> usize {
        self.touched
            .values()
            .filter(|state| state.is_assigned())
            .count()
    }

    pub(crate) fn cooling_count(&self, now: SystemTime, window: Duration) -> usize {
        self.touched
            .values()
            .filter(|state| state.is_cooling(now, window))
            .count()
    }
}

fn host_bits(cidr: &IpNet) -> u32 {
    u32::from(cidr.max_prefix_len()) - u32::from(cidr.prefix_len())
}

fn addr_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn bits_to_addr(bits: u128, family_of: &IpNet) -> IpAddr {
    match family_of {
        IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn key(sandbox: &str) -> WorkloadKey {
        WorkloadKey::new("net0", sandbox, "eth0")
    }

    fn block(cidr: &str, is_prefix: bool) -> AddressBlock {
        AddressBlock::new(IpNet::from_str(cidr).unwrap(), is_prefix).unwrap()
    }

    #[test]
    fn test_capacity() {
        assert_eq!(block("1.1.1.1/32", false).capacity(), 1);
        assert_eq!(block("10.0.0.0/28", true).capacity(), 16);
        assert_eq!(block("2001:db8::/80", true).capacity(), 1u128 << 48);
    }

    #[test]
    fn test_whole_space_prefix_is_rejected() {
        let err = AddressBlock::new(IpNet::from_str("::/0").unwrap(), true)
            .expect_err("should be rejected");
        assert_eq!(
            err,
            BlockError::PrefixTooLarge(IpNet::from_str("::/0").unwrap())
        );
    }

    #[test]
    fn test_addresses_are_handed_out_in_order() {
        let mut block = block("10.0.0.0/28", true);
        let now = SystemTime::now();
        let window = Duration::from_secs(30);

        for expected in ["10.0.0.0", "10.0.0.1", "10.0.0.2"] {
            let offset = block.next_candidate(now, window).unwrap();
            assert_eq!(block.addr_at(offset), IpAddr::from_str(expected).unwrap());
            block.mark_assigned(offset, key(expected), WorkloadMetadata::default(), now);
        }
        assert_eq!(block.cursor, 3);
    }

    #[test]
    fn test_expired_cooling_is_reused_before_cursor() {
        let mut block = block("10.0.0.0/28", true);
        let window = Duration::from_secs(30);
        let start = SystemTime::now();

        for n in 0..3 {
            let offset = block.next_candidate(start, window).unwrap();
            block.mark_assigned(offset, key(&n.to_string()), WorkloadMetadata::default(), start);
        }
        block.mark_cooling(1, start);

        // Still inside the window: the cursor position wins.
        assert_eq!(block.next_candidate(start, window), Some(3));

        // At the window boundary the cooled offset becomes preferred.
        let later = start + window;
        assert_eq!(block.next_candidate(later, window), Some(1));
    }

    #[test]
    fn test_host_address_block() {
        let block = block("1.1.1.1/32", false);
        assert_eq!(block.addr_at(0), IpAddr::from_str("1.1.1.1").unwrap());
        assert_eq!(block.offset_of(&IpAddr::from_str("1.1.1.1").unwrap()), Some(0));
        assert_eq!(block.offset_of(&IpAddr::from_str("1.1.1.2").unwrap()), None);
    }

    #[test]
    fn test_offset_of_prefix_boundaries() {
        let block = block("10.0.0.0/28", true);
        assert_eq!(block.offset_of(&IpAddr::from_str("10.0.0.0").unwrap()), Some(0));
        assert_eq!(
            block.offset_of(&IpAddr::from_str("10.0.0.15").unwrap()),
            Some(15)
        );
        assert_eq!(block.offset_of(&IpAddr::from_str("10.0.0.16").unwrap()), None);
        assert_eq!(block.offset_of(&IpAddr::from_str("9.255.255.255").unwrap()), None);
    }

    #[test]
    fn test_revert_restores_cursor_and_state() {
        let mut block = block("10.0.0.0/28", true);
        let now = SystemTime::now();

        block.mark_assigned(0, key("a"), WorkloadMetadata::default(), now);
        let prior = block.state_at(1).cloned();
        let cursor = block.cursor;
        block.mark_assigned(1, key("b"), WorkloadMetadata::default(), now);
        assert_eq!(block.cursor, 2);

        block.revert(1, prior, cursor);
        assert_eq!(block.cursor, 1);
        assert!(block.state_at(1).is_none());
        assert_eq!(block.assigned_count(), 1);
    }
}
