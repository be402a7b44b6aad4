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
//! Network interface records.

use std::{collections::BTreeMap, time::SystemTime};

use ipnet::IpNet;

use crate::block::{AddressBlock, IpFamily};

/// Role flags of a registered interface.
///
/// Any true flag shields the interface from eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceFlags {
    /// The node's primary interface.
    pub is_primary: bool,
    /// Trunk interface carrying branch interfaces.
    pub is_trunk: bool,
    /// Interface backing an Elastic Fabric Adapter.
    pub is_efa: bool,
}

impl InterfaceFlags {
    pub fn primary() -> Self {
        Self {
            is_primary: true,
            ..Self::default()
        }
    }

    pub(crate) fn any(self) -> bool {
        self.is_primary || self.is_trunk || self.is_efa
    }
}

/// A virtual network interface and the address blocks registered on it.
#[derive(Debug, Clone)]
pub(crate) struct Interface {
    pub(crate) id: String,
    pub(crate) device_number: u32,
    pub(crate) flags: InterfaceFlags,
    pub(crate) created_at: SystemTime,
    v4_blocks: BTreeMap<IpNet, AddressBlock>,
    v6_blocks: BTreeMap<IpNet, AddressBlock>,
}

impl Interface {
    pub(crate) fn new(id: &str, device_number: u32, flags: InterfaceFlags) -> Self {
        Self {
            id: id.to_string(),
            device_number,
            flags,
            created_at: SystemTime::now(),
            v4_blocks: BTreeMap::new(),
            v6_blocks: BTreeMap::new(),
        }
    }

    pub(crate) fn blocks(&self, family: IpFamily) -> &BTreeMap<IpNet, AddressBlock> {
        match family {
            IpFamily::V4 => &self.v4_blocks,
            IpFamily::V6 => &self.v6_blocks,
        }
    }

    pub(crate) fn blocks_mut(&mut self, family: IpFamily) -> &mut BTreeMap<IpNet, AddressBlock> {
        match family {
            IpFamily::V4 => &mut self.v4_blocks,
            IpFamily::V6 => &mut self.v6_blocks,
        }
    }

    pub(crate) fn all_blocks(&self) -> impl Iterator<Item = &AddressBlock> {
        self.v4_blocks.values().chain(self.v6_blocks.values())
    }

    pub(crate) fn has_block(&self, cidr: &IpNet) -> bool {
        self.blocks(IpFamily::of_net(cidr)).contains_key(cidr)
    }

    pub(crate) fn block_mut(&mut self, cidr: &IpNet) -> Option<&mut AddressBlock> {
        self.blocks_mut(IpFamily::of_net(cidr)).get_mut(cidr)
    }

    /// Sum of the capacities of all registered blocks.
    pub(crate) fn capacity(&self) -> u128 {
        self.all_blocks().map(|block| block.capacity()).sum()
    }

    pub(crate) fn assigned_count(&self) -> usize {
        self.all_blocks().map(|block| block.assigned_count()).sum()
    }

    /// Number of delegated prefixes without a single assigned address.
    pub(crate) fn free_prefix_count(&self) -> usize {
        self.all_blocks()
            .filter(|block| block.is_prefix && block.assigned_count() == 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::key::{WorkloadKey, WorkloadMetadata};

    fn add_block(iface: &mut Interface, cidr: &str, is_prefix: bool) {
        let cidr = IpNet::from_str(cidr).unwrap();
        let block = AddressBlock::new(cidr, is_prefix).unwrap();
        iface.blocks_mut(IpFamily::of_net(&cidr)).insert(cidr, block);
    }

    #[test]
    fn test_capacity_sums_both_families() {
        let mut iface = Interface::new("if-1", 1, InterfaceFlags::default());
        add_block(&mut iface, "1.1.1.1/32", false);
        add_block(&mut iface, "10.0.0.0/28", true);
        add_block(&mut iface, "2001:db8::/80", true);

        assert_eq!(iface.capacity(), 1 + 16 + (1u128 << 48));
        assert_eq!(iface.blocks(IpFamily::V4).len(), 2);
        assert_eq!(iface.blocks(IpFamily::V6).len(), 1);
    }

    #[test]
    fn test_free_prefix_count_excludes_used_prefixes() {
        let mut iface = Interface::new("if-1", 1, InterfaceFlags::default());
        add_block(&mut iface, "10.0.0.0/28", true);
        add_block(&mut iface, "20.0.0.0/28", true);
        assert_eq!(iface.free_prefix_count(), 2);

        let cidr = IpNet::from_str("10.0.0.0/28").unwrap();
        iface.block_mut(&cidr).unwrap().mark_assigned(
            0,
            WorkloadKey::new("net0", "sandbox-1", "eth0"),
            WorkloadMetadata::default(),
            SystemTime::now(),
        );
        assert_eq!(iface.free_prefix_count(), 1);
        assert_eq!(iface.assigned_count(), 1);
    }
}
