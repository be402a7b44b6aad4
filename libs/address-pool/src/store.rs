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
//! The allocation engine: interface and block registration, the idempotent
//! assign/unassign protocol, interface eviction, and observability queries.

use std::{
    collections::BTreeMap,
    net::IpAddr,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use ipnet::IpNet;
use thiserror::Error;

use crate::{
    block::{AddressBlock, AddressState, BlockError, IpFamily},
    checkpoint::{
        CHECKPOINT_FORMAT_VERSION, CheckpointData, CheckpointEntry, CheckpointError,
        CheckpointSink,
    },
    interface::{Interface, InterfaceFlags},
    key::{WorkloadKey, WorkloadMetadata},
};

/// Delay after unassignment during which an address must not be handed out
/// again: neighbor caches in the fabric may still map it to the torn-down
/// workload.
pub const DEFAULT_COOLDOWN_WINDOW: Duration = Duration::from_secs(30);

/// Pool operation errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Unknown interface identifier.
    #[error("interface {0} not registered")]
    InterfaceNotFound(String),
    /// Duplicate interface registration.
    #[error("interface {0} already registered")]
    InterfaceExists(String),
    /// The CIDR is already registered, on this or another interface.
    #[error("cidr {0} already registered")]
    BlockExists(IpNet),
    /// The CIDR is not registered on the named interface.
    #[error("cidr {cidr} not registered on interface {interface_id}")]
    BlockNotFound { interface_id: String, cidr: IpNet },
    /// Removal blocked by a live assignment.
    #[error("interface {0} still has assigned addresses")]
    InterfaceInUse(String),
    /// Removal blocked by a live assignment.
    #[error("cidr {0} still has assigned addresses")]
    BlockInUse(IpNet),
    /// The workload key has no current assignment.
    #[error("workload {0} has no assigned address")]
    WorkloadNotFound(WorkloadKey),
    /// No eligible address anywhere in the pool.
    #[error("no free address available")]
    InsufficientFreeAddresses,
    /// The checkpoint sink failed; the triggering mutation was rolled back.
    #[error("checkpoint update failed")]
    Persistence(#[source] CheckpointError),
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// Result of a successful assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAssignment {
    pub address: IpAddr,
    pub device_number: u32,
}

/// Result of a successful unassignment. The address is cooling from here on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnassignedAddress {
    pub address: IpAddr,
    pub interface_id: String,
    pub device_number: u32,
}

/// Snapshot of one assigned address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedAddress {
    pub key: WorkloadKey,
    pub metadata: WorkloadMetadata,
    pub address: IpAddr,
    pub interface_id: String,
}

/// Point-in-time counters for one address family.
///
/// `cooling_addresses` counts addresses whose cooldown window has not yet
/// elapsed as of the moment of the call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_addresses: u128,
    pub total_prefixes: usize,
    pub assigned_addresses: usize,
    pub cooling_addresses: usize,
}

/// Immutable snapshot of one registered interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub id: String,
    pub device_number: u32,
    pub flags: InterfaceFlags,
    pub created_at: SystemTime,
    pub blocks: Vec<BlockInfo>,
}

/// Summary of one registered block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub cidr: IpNet,
    pub is_prefix: bool,
    pub capacity: u128,
    pub assigned: usize,
}

/// CIDRs registered on one interface, split by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceBlocks {
    pub addresses: Vec<IpNet>,
    pub prefixes: Vec<IpNet>,
}

/// The pool of addresses available on this node's interfaces.
///
/// A single lock serializes every operation. Checkpoint writes happen inside
/// the critical section of the mutation they record; if the write fails the
/// mutation is rolled back in full, so the in-memory view never diverges
/// from the last successfully persisted checkpoint.
pub struct AddressPool {
    state: Mutex<PoolState>,
    checkpointer: Box<dyn CheckpointSink>,
    prefix_delegation: bool,
    cooldown_window: Duration,
}

struct PoolState {
    interfaces: BTreeMap<String, Interface>,
    /// Sum of capacities of all registered blocks.
    total: u128,
    /// Count of currently assigned addresses.
    assigned: usize,
}

/// Location of one concrete address inside the pool.
struct Slot {
    interface_id: String,
    device_number: u32,
    cidr: IpNet,
    offset: u128,
    address: IpAddr,
}

impl AddressPool {
    pub fn new(checkpointer: Box<dyn CheckpointSink>, prefix_delegation: bool) -> Self {
        Self {
            state: Mutex::new(PoolState {
                interfaces: BTreeMap::new(),
                total: 0,
                assigned: 0,
            }),
            checkpointer,
            prefix_delegation,
            cooldown_window: DEFAULT_COOLDOWN_WINDOW,
        }
    }

    /// Overrides the reuse cooldown window (default 30 seconds).
    pub fn with_cooldown_window(mut self, window: Duration) -> Self {
        self.cooldown_window = window;
        self
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new interface with an empty block set.
    pub fn add_interface(
        &self,
        id: &str,
        device_number: u32,
        flags: InterfaceFlags,
    ) -> Result<(), PoolError> {
        let mut state = self.lock();
        if state.interfaces.contains_key(id) {
            return Err(PoolError::InterfaceExists(id.to_string()));
        }
        tracing::debug!(interface = id, device_number, "registering interface");
        state
            .interfaces
            .insert(id.to_string(), Interface::new(id, device_number, flags));
        Ok(())
    }

    /// Removes an interface and every block on it.
    ///
    /// Fails with [PoolError::InterfaceInUse] if any address is assigned,
    /// unless `force` is set.
    pub fn remove_interface(&self, id: &str, force: bool) -> Result<(), PoolError> {
        let mut state = self.lock();
        let iface = state
            .interfaces
            .get(id)
            .ok_or_else(|| PoolError::InterfaceNotFound(id.to_string()))?;
        let assigned = iface.assigned_count();
        if assigned > 0 {
            if !force {
                return Err(PoolError::InterfaceInUse(id.to_string()));
            }
            tracing::warn!(
                interface = id,
                assigned,
                "force-removing interface with live assignments"
            );
        }
        if let Some(iface) = state.interfaces.remove(id) {
            state.total -= iface.capacity();
            state.assigned -= assigned;
        }
        tracing::debug!(interface = id, "removed interface");
        Ok(())
    }

    /// Registers a CIDR on an interface: a host address or, with
    /// `is_prefix`, a delegated prefix.
    pub fn add_block(
        &self,
        interface_id: &str,
        cidr: IpNet,
        is_prefix: bool,
    ) -> Result<(), PoolError> {
        let mut state = self.lock();
        if !state.interfaces.contains_key(interface_id) {
            return Err(PoolError::InterfaceNotFound(interface_id.to_string()));
        }
        if state.interfaces.values().any(|iface| iface.has_block(&cidr)) {
            return Err(PoolError::BlockExists(cidr));
        }
        let block = AddressBlock::new(cidr, is_prefix)?;
        let capacity = block.capacity();
        tracing::debug!(
            interface = interface_id,
            %cidr,
            is_prefix,
            capacity,
            "registering address block"
        );
        if let Some(iface) = state.interfaces.get_mut(interface_id) {
            iface.blocks_mut(IpFamily::of_net(&cidr)).insert(cidr, block);
        }
        state.total += capacity;
        Ok(())
    }

    /// Removes a block from an interface.
    ///
    /// Fails with [PoolError::BlockInUse] if any contained address is
    /// assigned, unless `force` is set.
    pub fn remove_block(
        &self,
        interface_id: &str,
        cidr: IpNet,
        force: bool,
    ) -> Result<(), PoolError> {
        let mut state = self.lock();
        let family = IpFamily::of_net(&cidr);
        let (capacity, assigned) = {
            let iface = state
                .interfaces
                .get_mut(interface_id)
                .ok_or_else(|| PoolError::InterfaceNotFound(interface_id.to_string()))?;
            let block = iface
                .blocks(family)
                .get(&cidr)
                .ok_or(PoolError::BlockNotFound {
                    interface_id: interface_id.to_string(),
                    cidr,
                })?;
            let assigned = block.assigned_count();
            if assigned > 0 {
                if !force {
                    return Err(PoolError::BlockInUse(cidr));
                }
                tracing::warn!(
                    interface = interface_id,
                    %cidr,
                    assigned,
                    "force-removing block with live assignments"
                );
            }
            let capacity = block.capacity();
            iface.blocks_mut(family).remove(&cidr);
            (capacity, assigned)
        };
        state.total -= capacity;
        state.assigned -= assigned;
        tracing::debug!(interface = interface_id, %cidr, "removed address block");
        Ok(())
    }

    /// Assigns an address of the given family to the workload.
    ///
    /// Idempotent per key: a repeated call returns the already-assigned
    /// address without touching any state. Addresses still inside their
    /// cooldown window are never selected.
    pub fn assign(
        &self,
        key: WorkloadKey,
        metadata: WorkloadMetadata,
        family: IpFamily,
    ) -> Result<AddressAssignment, PoolError> {
        let now = SystemTime::now();
        let mut state = self.lock();

        if let Some(existing) = state.locate(&key) {
            tracing::debug!(%key, address = %existing.address, "repeated assign, returning existing address");
            return Ok(AddressAssignment {
                address: existing.address,
                device_number: existing.device_number,
            });
        }

        let slot = state
            .find_candidate(family, now, self.cooldown_window)
            .ok_or(PoolError::InsufficientFreeAddresses)?;

        let (prior, prior_cursor) = {
            let block = state
                .block_mut(&slot.interface_id, &slot.cidr)
                .ok_or(PoolError::InsufficientFreeAddresses)?;
            let prior = block.state_at(slot.offset).cloned();
            let cursor = block.cursor;
            block.mark_assigned(slot.offset, key.clone(), metadata, now);
            (prior, cursor)
        };
        state.assigned += 1;

        if let Err(err) = self.checkpointer.persist(&state.checkpoint_data()) {
            tracing::warn!(%key, error = %err, "checkpoint write failed, rolling back assignment");
            if let Some(block) = state.block_mut(&slot.interface_id, &slot.cidr) {
                block.revert(slot.offset, prior, prior_cursor);
            }
            state.assigned -= 1;
            return Err(PoolError::Persistence(err));
        }

        tracing::info!(
            %key,
            address = %slot.address,
            interface = %slot.interface_id,
            "assigned address"
        );
        Ok(AddressAssignment {
            address: slot.address,
            device_number: slot.device_number,
        })
    }

    /// Releases the workload's address into the cooldown window.
    pub fn unassign(&self, key: &WorkloadKey) -> Result<UnassignedAddress, PoolError> {
        let now = SystemTime::now();
        let mut state = self.lock();
        let slot = state
            .locate(key)
            .ok_or_else(|| PoolError::WorkloadNotFound(key.clone()))?;

        let (prior, prior_cursor) = {
            let block = state
                .block_mut(&slot.interface_id, &slot.cidr)
                .ok_or_else(|| PoolError::WorkloadNotFound(key.clone()))?;
            let prior = block.state_at(slot.offset).cloned();
            let cursor = block.cursor;
            block.mark_cooling(slot.offset, now);
            (prior, cursor)
        };
        state.assigned -= 1;

        if let Err(err) = self.checkpointer.persist(&state.checkpoint_data()) {
            tracing::warn!(%key, error = %err, "checkpoint write failed, rolling back unassignment");
            if let Some(block) = state.block_mut(&slot.interface_id, &slot.cidr) {
                block.revert(slot.offset, prior, prior_cursor);
            }
            state.assigned += 1;
            return Err(PoolError::Persistence(err));
        }

        tracing::info!(
            %key,
            address = %slot.address,
            interface = %slot.interface_id,
            "unassigned address, cooling"
        );
        Ok(UnassignedAddress {
            address: slot.address,
            interface_id: slot.interface_id,
            device_number: slot.device_number,
        })
    }

    /// Removes and returns one interface the pool can do without.
    ///
    /// Only interfaces with all role flags false and zero assigned addresses
    /// are considered. A candidate is removable if the capacity retained
    /// after its removal keeps at least `warm_target` addresses free and at
    /// least `minimum_warm_target` addresses registered. With prefix
    /// delegation and a nonzero `warm_prefix_target`, the floor is instead
    /// expressed in fully-free delegated prefixes.
    ///
    /// No checkpoint write occurs; each call re-evaluates from current
    /// state.
    pub fn reclaim_interface(
        &self,
        warm_target: usize,
        minimum_warm_target: usize,
        warm_prefix_target: usize,
    ) -> Option<String> {
        let mut state = self.lock();
        let total = state.total;
        let assigned = state.assigned as u128;
        let free_prefixes: usize = state
            .interfaces
            .values()
            .map(|iface| iface.free_prefix_count())
            .sum();

        let candidate_id = state.interfaces.values().find_map(|iface| {
            if iface.flags.any() || iface.assigned_count() > 0 {
                return None;
            }
            let eligible = if self.prefix_delegation && warm_prefix_target > 0 {
                // The candidate has no assignments, so all of its prefixes
                // count as free.
                free_prefixes - iface.free_prefix_count() >= warm_prefix_target
            } else {
                let retained_total = total - iface.capacity();
                let retained_free = retained_total.saturating_sub(assigned);
                retained_free >= warm_target as u128
                    && retained_total >= minimum_warm_target as u128
            };
            eligible.then(|| iface.id.clone())
        })?;

        if let Some(iface) = state.interfaces.remove(&candidate_id) {
            state.total -= iface.capacity();
        }
        tracing::info!(interface = %candidate_id, "reclaimed idle interface");
        Some(candidate_id)
    }

    /// Re-applies the last persisted allocation set.
    ///
    /// Entries whose address is no longer covered by a registered block are
    /// skipped with a warning. Returns the number of restored allocations;
    /// a missing checkpoint (first run) restores nothing.
    pub fn restore_from_checkpoint(&self) -> Result<usize, PoolError> {
        let data = match self.checkpointer.restore() {
            Ok(data) => data,
            Err(CheckpointError::NotFound) => {
                tracing::debug!("no checkpoint to restore");
                return Ok(0);
            }
            Err(err) => return Err(PoolError::Persistence(err)),
        };
        if data.version != CHECKPOINT_FORMAT_VERSION {
            return Err(PoolError::Persistence(CheckpointError::Invalid(
                anyhow::anyhow!("unsupported checkpoint version {:?}", data.version),
            )));
        }

        let mut state = self.lock();
        let mut restored = 0;
        for entry in &data.allocations {
            let address = entry
                .parse_address()
                .map_err(|err| PoolError::Persistence(CheckpointError::Invalid(err)))?;
            if state.restore_allocation(&entry.key, &entry.metadata, address, entry.assigned_at) {
                restored += 1;
            } else {
                tracing::warn!(
                    key = %entry.key,
                    %address,
                    "checkpointed address is not registered or already taken, skipping"
                );
            }
        }
        tracing::info!(restored, "restored allocations from checkpoint");
        Ok(restored)
    }

    /// Immutable snapshot of every registered interface.
    pub fn list_interfaces(&self) -> Vec<InterfaceInfo> {
        let state = self.lock();
        state
            .interfaces
            .values()
            .map(|iface| {
                InterfaceInfo {
                    id: iface.id.clone(),
                    device_number: iface.device_number,
                    flags: iface.flags,
                    created_at: iface.created_at,
                    blocks: iface
                        .all_blocks()
                        .map(|block| {
                            BlockInfo {
                                cidr: block.cidr,
                                is_prefix: block.is_prefix,
                                capacity: block.capacity(),
                                assigned: block.assigned_count(),
                            }
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// The host-address CIDRs and prefix CIDRs registered on an interface.
    pub fn blocks_of(&self, interface_id: &str) -> Result<InterfaceBlocks, PoolError> {
        let state = self.lock();
        let iface = state
            .interfaces
            .get(interface_id)
            .ok_or_else(|| PoolError::InterfaceNotFound(interface_id.to_string()))?;
        let mut blocks = InterfaceBlocks::default();
        for block in iface.all_blocks() {
            if block.is_prefix {
                blocks.prefixes.push(block.cidr);
            } else {
                blocks.addresses.push(block.cidr);
            }
        }
        Ok(blocks)
    }

    /// Counters for one address family, computed from current state.
    pub fn stats(&self, family: IpFamily) -> PoolStats {
        let now = SystemTime::now();
        let state = self.lock();
        let mut stats = PoolStats::default();
        for iface in state.interfaces.values() {
            for block in iface.blocks(family).values() {
                stats.total_addresses += block.capacity();
                if block.is_prefix {
                    stats.total_prefixes += 1;
                }
                stats.assigned_addresses += block.assigned_count();
                stats.cooling_addresses += block.cooling_count(now, self.cooldown_window);
            }
        }
        stats
    }

    /// Snapshot of every assigned address.
    pub fn allocated_addresses(&self) -> Vec<AllocatedAddress> {
        let state = self.lock();
        let mut out = Vec::with_capacity(state.assigned);
        for iface in state.interfaces.values() {
            for block in iface.all_blocks() {
                for (&offset, addr_state) in &block.touched {
                    if let AddressState::Assigned { key, metadata, .. } = addr_state {
                        out.push(AllocatedAddress {
                            key: key.clone(),
                            metadata: metadata.clone(),
                            address: block.addr_at(offset),
                            interface_id: iface.id.clone(),
                        });
                    }
                }
            }
        }
        out
    }

    /// Number of currently registered interfaces.
    pub fn interface_count(&self) -> usize {
        self.lock().interfaces.len()
    }

    /// Sum of capacities of all registered blocks, both families.
    pub fn total_capacity(&self) -> u128 {
        self.lock().total
    }

    /// Count of currently assigned addresses, both families.
    pub fn assigned_count(&self) -> usize {
        self.lock().assigned
    }
}

impl PoolState {
    fn block_mut(&mut self, interface_id: &str, cidr: &IpNet) -> Option<&mut AddressBlock> {
        self.interfaces.get_mut(interface_id)?.block_mut(cidr)
    }

    /// Where the key's address lives, if it has one.
    fn locate(&self, key: &WorkloadKey) -> Option<Slot> {
        for iface in self.interfaces.values() {
            for block in iface.all_blocks() {
                for (&offset, state) in &block.touched {
                    if let AddressState::Assigned { key: owner, .. } = state {
                        if owner == key {
                            return Some(Slot {
                                interface_id: iface.id.clone(),
                                device_number: iface.device_number,
                                cidr: block.cidr,
                                offset,
                                address: block.addr_at(offset),
                            });
                        }
                    }
                }
            }
        }
        None
    }

    /// First assignable address in interface-id order.
    fn find_candidate(&self, family: IpFamily, now: SystemTime, window: Duration) -> Option<Slot> {
        for iface in self.interfaces.values() {
            for block in iface.blocks(family).values() {
                if let Some(offset) = block.next_candidate(now, window) {
                    return Some(Slot {
                        interface_id: iface.id.clone(),
                        device_number: iface.device_number,
                        cidr: block.cidr,
                        offset,
                        address: block.addr_at(offset),
                    });
                }
            }
        }
        None
    }

    /// The full allocation set as a checkpoint payload.
    fn checkpoint_data(&self) -> CheckpointData {
        let mut allocations = Vec::with_capacity(self.assigned);
        for iface in self.interfaces.values() {
            for block in iface.all_blocks() {
                for (&offset, state) in &block.touched {
                    if let AddressState::Assigned {
                        key,
                        metadata,
                        assigned_at,
                    } = state
                    {
                        allocations.push(CheckpointEntry {
                            key: key.clone(),
                            address: block.addr_at(offset).to_string(),
                            metadata: metadata.clone(),
                            assigned_at: *assigned_at,
                        });
                    }
                }
            }
        }
        CheckpointData::new(allocations)
    }

    /// Re-marks one checkpointed allocation as assigned. Returns false if
    /// the address is not covered by any block or is already taken.
    fn restore_allocation(
        &mut self,
        key: &WorkloadKey,
        metadata: &WorkloadMetadata,
        address: IpAddr,
        assigned_at: SystemTime,
    ) -> bool {
        let family = IpFamily::of(&address);
        for iface in self.interfaces.values_mut() {
            for block in iface.blocks_mut(family).values_mut() {
                if let Some(offset) = block.offset_of(&address) {
                    if block.state_at(offset).is_some_and(AddressState::is_assigned) {
                        return false;
                    }
                    block.mark_assigned(offset, key.clone(), metadata.clone(), assigned_at);
                    self.assigned += 1;
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
impl AddressPool {
    /// Rewinds the unassignment timestamp of a cooling address, so tests can
    /// cross the cooldown boundary without sleeping.
    fn backdate_cooling(&self, address: IpAddr, by: Duration) {
        let mut state = self.lock();
        for iface in state.interfaces.values_mut() {
            for block in iface.blocks_mut(IpFamily::of(&address)).values_mut() {
                if let Some(offset) = block.offset_of(&address) {
                    if let Some(AddressState::Cooling { unassigned_at }) =
                        block.touched.get_mut(&offset)
                    {
                        *unassigned_at -= by;
                    }
                }
            }
        }
    }
}
