// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use alloc::sync::Arc;

use axerrno::{AxResult, ax_err};
use spin::Mutex;

use crate::{
    addr::{GuestPhysAddr, is_aligned_4k},
    coordinator::{El2Registry, VmidLease},
    hal::{El2Hal, GuestAddrSpace},
    id_alloc::IdAllocator,
    trap::{PacketPort, Trap, TrapKind, TrapMap},
};

/// Where the legacy virtual CPU interface is exposed to guests.
pub const GICV_GUEST_PADDR: usize = 0x0800_1000;
/// Size of the legacy virtual CPU interface window.
pub const GICV_SIZE: usize = 0x2000;

/// Lowest and highest VPID handed out within a guest.
///
/// Capped so every vCPU has a bit in a [`GuestPacket::VcpuInterrupt`] mask.
///
/// [`GuestPacket::VcpuInterrupt`]: crate::GuestPacket::VcpuInterrupt
pub const VPID_RANGE: (u8, u8) = (1, u64::BITS as u8);

/// A hardware-assisted virtual machine.
///
/// Owns the guest-physical address space and the trap map, and hands out
/// VPIDs to its vCPUs. The VMID goes back to the registry when the guest is
/// dropped, which deactivates EL2 if this was the last guest.
pub struct Guest<H: El2Hal> {
    registry: Arc<El2Registry<H>>,
    vmid: u8,
    aspace: H::AddrSpace,
    traps: TrapMap,
    vpids: Mutex<IdAllocator>,
}

impl<H: El2Hal> Guest<H> {
    /// Creates a guest, turning on EL2 if it is the first one.
    pub fn create(registry: &Arc<El2Registry<H>>) -> AxResult<Arc<Self>> {
        if !H::el2_supported() {
            return ax_err!(Unsupported, "hardware virtualization is unavailable");
        }
        let vmid = VmidLease::acquire(registry)?;
        let aspace = H::new_addr_space(vmid.vmid())?;

        if let Some(gicv) = H::gicv_paddr() {
            aspace.map_host_range(GuestPhysAddr::from_usize(GICV_GUEST_PADDR), gicv, GICV_SIZE)?;
        }

        let guest = Arc::new(Self {
            registry: registry.clone(),
            vmid: vmid.into_inner(),
            aspace,
            traps: TrapMap::new(),
            vpids: Mutex::new(IdAllocator::new(VPID_RANGE.0, VPID_RANGE.1)),
        });
        info!("guest: created VMID {}", guest.vmid);
        Ok(guest)
    }

    pub fn vmid(&self) -> u8 {
        self.vmid
    }

    pub fn aspace(&self) -> &H::AddrSpace {
        &self.aspace
    }

    pub fn traps(&self) -> &TrapMap {
        &self.traps
    }

    /// Installs a trap over `[addr, addr + len)`.
    ///
    /// Bell traps need a port to queue on; memory traps are reported through
    /// `resume` and must not have one. Any existing stage-2 mapping of the
    /// range is removed first so every access faults.
    pub fn set_trap(
        &self,
        kind: TrapKind,
        addr: GuestPhysAddr,
        len: usize,
        port: Option<Arc<dyn PacketPort>>,
        key: u64,
    ) -> AxResult {
        match (kind, port.is_some()) {
            (TrapKind::Io, _) => return ax_err!(Unsupported, "I/O traps are not supported"),
            (TrapKind::Mem, true) => return ax_err!(InvalidInput, "memory traps take no port"),
            (TrapKind::Bell, false) => return ax_err!(InvalidInput, "bell traps need a port"),
            _ => {}
        }
        if len == 0 || !is_aligned_4k(addr.as_usize()) || !is_aligned_4k(len) {
            return ax_err!(InvalidInput, "trap range must be page aligned");
        }
        match addr.as_usize().checked_add(len) {
            Some(end) if end <= self.aspace.size() => {}
            _ => return ax_err!(InvalidInput, "trap range exceeds the address space"),
        }

        self.aspace.unmap_range(addr, len)?;
        self.traps.insert(Trap::new(kind, addr, len, port, key))?;
        debug!(
            "guest {}: {:?} trap at {:?} len {:#x} key {:#x}",
            self.vmid, kind, addr, len, key
        );
        Ok(())
    }

    /// Allocates a VPID for a new vCPU.
    pub fn alloc_vpid(&self) -> AxResult<u8> {
        self.vpids.lock().alloc()
    }

    /// Returns a VPID.
    pub fn free_vpid(&self, vpid: u8) -> AxResult {
        self.vpids.lock().free(vpid)
    }
}

impl<H: El2Hal> Drop for Guest<H> {
    fn drop(&mut self) {
        if let Err(err) = self.registry.free_vmid(self.vmid) {
            error!("guest: failed to free VMID {}: {:?}", self.vmid, err);
        }
        info!("guest: destroyed VMID {}", self.vmid);
    }
}
