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

//! The process-wide EL2 coordinator.
//!
//! EL2 is only switched on while at least one guest exists. The
//! [`El2Registry`] is an explicit object: whoever creates the first guest
//! passes it in, the first VMID allocation builds the coordinator (EL2
//! translation table, per-CPU stacks, activation on every online CPU) and
//! the last VMID release tears it down again.

use alloc::{sync::Arc, vec::Vec};

use axerrno::{AxResult, ax_err, ax_err_type};
use spin::Mutex;

use crate::{
    el2::TranslationTable,
    hal::{CpuMask, El2Hal},
    id_alloc::IdAllocator,
    percpu::{El2PerCpu, cpu_bit, cpus_in},
};

/// Lowest and highest VMID handed out.
pub const VMID_RANGE: (u8, u8) = (0, u8::MAX);

/// Live EL2 state, existing only while guests exist.
struct El2Coordinator<H: El2Hal> {
    table: TranslationTable<H>,
    cpus: Vec<El2PerCpu<H>>,
    vmids: IdAllocator,
}

impl<H: El2Hal> El2Coordinator<H> {
    fn create() -> AxResult<Self> {
        let mut table = TranslationTable::new()?;
        table.map_identity()?;

        let cpus = (0..H::max_cpus())
            .map(El2PerCpu::new)
            .collect::<AxResult<Vec<_>>>()?;

        let mut coordinator = Self {
            table,
            cpus,
            vmids: IdAllocator::new(VMID_RANGE.0, VMID_RANGE.1),
        };
        coordinator.activate()?;
        Ok(coordinator)
    }

    /// Turns on EL2 on every online CPU, all or nothing.
    fn activate(&mut self) -> AxResult {
        let ttbr0 = self
            .table
            .root_paddr()
            .ok_or_else(|| ax_err_type!(BadState, "EL2 translation table missing"))?;
        let online = H::online_cpus();
        let stacks = self.cpus.iter().map(|cpu| cpu.stack_top()).collect::<Vec<_>>();

        let activated = H::sync_exec(online, &|cpu| match stacks.get(cpu) {
            Some(&stack_top) => H::el2_on(ttbr0, stack_top),
            None => ax_err!(InvalidInput, "CPU has no EL2 stack"),
        });
        for cpu in cpus_in(activated) {
            if let Some(state) = self.cpus.get_mut(cpu) {
                state.set_enabled(true);
            }
        }

        if activated & online != online {
            warn!(
                "el2: activation failed on CPUs {:#x}, rolling back",
                online & !activated
            );
            self.deactivate();
            return ax_err!(Unsupported, "EL2 could not be enabled on every online CPU");
        }
        info!("el2: activated on CPUs {:#x}", online);
        Ok(())
    }

    /// Turns off EL2 on every CPU it is enabled on.
    fn deactivate(&mut self) {
        let enabled = self
            .cpus
            .iter()
            .filter(|cpu| cpu.is_enabled())
            .fold(0 as CpuMask, |mask, cpu| mask | cpu_bit(cpu.cpu_id()));
        if enabled == 0 {
            return;
        }
        let deactivated = H::sync_exec(enabled, &|_| H::el2_off());
        if deactivated != enabled {
            error!(
                "el2: failed to deactivate on CPUs {:#x}",
                enabled & !deactivated
            );
        }
        for cpu in cpus_in(deactivated) {
            if let Some(state) = self.cpus.get_mut(cpu) {
                state.set_enabled(false);
            }
        }
        info!("el2: deactivated on CPUs {:#x}", deactivated);
    }

    fn enabled_cpus(&self) -> CpuMask {
        self.cpus
            .iter()
            .filter(|cpu| cpu.is_enabled())
            .fold(0, |mask, cpu| mask | cpu_bit(cpu.cpu_id()))
    }
}

impl<H: El2Hal> Drop for El2Coordinator<H> {
    fn drop(&mut self) {
        self.deactivate();
        self.table.reset();
    }
}

/// Owner of the global VMID namespace and of EL2 activation.
pub struct El2Registry<H: El2Hal> {
    coordinator: Mutex<Option<El2Coordinator<H>>>,
}

impl<H: El2Hal> El2Registry<H> {
    pub const fn new() -> Self {
        Self {
            coordinator: Mutex::new(None),
        }
    }

    /// Allocates a VMID, activating EL2 first if no guest exists yet.
    pub fn alloc_vmid(&self) -> AxResult<u8> {
        let mut coordinator = self.coordinator.lock();
        if coordinator.is_none() {
            *coordinator = Some(El2Coordinator::create()?);
        }
        let Some(live) = coordinator.as_mut() else {
            return ax_err!(BadState, "EL2 coordinator missing");
        };
        match live.vmids.alloc() {
            Ok(vmid) => {
                debug!("el2: allocated VMID {}", vmid);
                Ok(vmid)
            }
            Err(err) => {
                if live.vmids.allocated() == 0 {
                    coordinator.take();
                }
                Err(err)
            }
        }
    }

    /// Releases a VMID, deactivating EL2 when it was the last one.
    pub fn free_vmid(&self, vmid: u8) -> AxResult {
        let mut coordinator = self.coordinator.lock();
        let Some(live) = coordinator.as_mut() else {
            return ax_err!(BadState, "no VMID is allocated");
        };
        live.vmids.free(vmid)?;
        debug!("el2: freed VMID {}", vmid);
        if live.vmids.allocated() == 0 {
            coordinator.take();
        }
        Ok(())
    }

    /// Whether EL2 is currently active.
    pub fn is_active(&self) -> bool {
        self.coordinator.lock().is_some()
    }

    /// Number of live guests, i.e. outstanding VMIDs.
    pub fn num_guests(&self) -> usize {
        self.coordinator
            .lock()
            .as_ref()
            .map_or(0, |live| live.vmids.allocated())
    }

    /// CPUs with EL2 currently enabled.
    pub fn enabled_cpus(&self) -> CpuMask {
        self.coordinator
            .lock()
            .as_ref()
            .map_or(0, |live| live.enabled_cpus())
    }
}

impl<H: El2Hal> Default for El2Registry<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// A VMID that is returned to the registry when dropped, unless it was
/// handed over to a guest with [`VmidLease::into_inner`].
pub(crate) struct VmidLease<'a, H: El2Hal> {
    registry: &'a Arc<El2Registry<H>>,
    vmid: u8,
    armed: bool,
}

impl<'a, H: El2Hal> VmidLease<'a, H> {
    pub fn acquire(registry: &'a Arc<El2Registry<H>>) -> AxResult<Self> {
        Ok(Self {
            registry,
            vmid: registry.alloc_vmid()?,
            armed: true,
        })
    }

    pub fn vmid(&self) -> u8 {
        self.vmid
    }

    pub fn into_inner(mut self) -> u8 {
        self.armed = false;
        self.vmid
    }
}

impl<H: El2Hal> Drop for VmidLease<'_, H> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.registry.free_vmid(self.vmid);
        }
    }
}
