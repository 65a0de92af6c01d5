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

use alloc::{sync::Weak, vec::Vec};

use axerrno::AxResult;

use crate::{
    addr::{GuestPhysAddr, HostPhysAddr, HostVirtAddr},
    regs::El2State,
    vgic::GichRegs,
};

/// A set of host CPUs, one bit per CPU number.
pub type CpuMask = u64;

/// Opaque identifier of a host kernel thread. Zero is never a valid thread.
pub type ThreadId = usize;

/// The thread id stored when no host thread is bound.
pub const NO_THREAD: ThreadId = 0;

/// How a single guest entry through [`El2Hal::resume_guest`] came back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestEntry {
    /// The guest raised a synchronous exception; ESR/FAR/HPFAR were saved
    /// into the register block.
    Trapped,
    /// A physical interrupt was taken while the guest was running. This is
    /// not a guest exit and carries no syndrome.
    Interrupted,
}

/// What a physical memory region holds, which decides its EL2 permissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemRegionKind {
    /// Kernel code, mapped read + execute.
    Code,
    /// RAM, mapped read + write, never executable.
    Data,
}

/// A physical memory region to be identity mapped at EL2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRegion {
    pub base: HostPhysAddr,
    pub size: usize,
    pub kind: MemRegionKind,
}

/// Receives lifecycle notifications for a host thread that a vCPU is bound to.
///
/// The thread subsystem holds the observer weakly, so a dropped vCPU simply
/// stops receiving callbacks.
pub trait ThreadObserver: Send + Sync {
    /// The thread has been migrated to host CPU `cpu`.
    fn migrated(&self, cpu: usize);
    /// The thread is exiting and must no longer be referenced.
    fn exited(&self);
}

/// An auto-reset event the host can block a thread on.
pub trait HostEvent: Send + Sync {
    /// Creates an unsignaled event.
    fn new() -> Self;
    /// Signals the event, waking one waiter (or the next one to wait).
    fn signal(&self);
    /// Blocks until the event is signaled or the virtual counter reaches
    /// `deadline`. `None` waits forever. Returns `true` if the event was
    /// signaled, consuming the signal.
    fn wait_until(&self, deadline: Option<u64>) -> bool;
}

/// The guest-physical address space of one VM, including its stage-2
/// translation table. Implementations must be internally synchronized since
/// every vCPU of a guest uses it concurrently.
pub trait GuestAddrSpace: Send + Sync {
    /// Size of the guest-physical address space in bytes.
    fn size(&self) -> usize;
    /// Physical address of the root stage-2 translation table.
    fn root_paddr(&self) -> HostPhysAddr;
    /// Resolves a stage-2 fault at `addr`, mapping backing memory.
    fn resolve_fault(&self, addr: GuestPhysAddr) -> AxResult;
    /// Removes any stage-2 mapping over `[addr, addr + len)`.
    fn unmap_range(&self, addr: GuestPhysAddr, len: usize) -> AxResult;
    /// Maps the host physical range `[host, host + len)` at `addr`.
    fn map_host_range(&self, addr: GuestPhysAddr, host: HostPhysAddr, len: usize) -> AxResult;
    /// Cleans and invalidates the data cache for every page mapped by the
    /// stage-2 translation table.
    fn clean_invalidate_cache(&self);
}

/// The interfaces which the underlying kernel must implement.
///
/// Everything outside the engine itself is reached through this trait: the
/// scheduler and thread subsystem, the page allocator, the physical interrupt
/// controller driver and the assembly trampolines that switch exception levels.
pub trait El2Hal: Sized + 'static {
    /// The guest-physical address space implementation.
    type AddrSpace: GuestAddrSpace;
    /// The blocking primitive used to park a vCPU thread on WFI.
    type Event: HostEvent;

    /// Whether the kernel runs at a privilege level that can use EL2.
    fn el2_supported() -> bool;

    /// Number of possible host CPUs.
    fn max_cpus() -> usize;

    /// The CPUs currently online.
    fn online_cpus() -> CpuMask;

    /// The CPU the caller is running on.
    fn current_cpu() -> usize;

    /// Runs `task` on every CPU in `mask` and waits for all of them.
    ///
    /// # Returns
    ///
    /// * `CpuMask` - The CPUs on which `task` ran and returned `Ok`.
    fn sync_exec(mask: CpuMask, task: &(dyn Fn(usize) -> AxResult + Sync)) -> CpuMask;

    /// Sends a reschedule inter-processor interrupt to every CPU in `mask`.
    fn send_ipi(mask: CpuMask);

    /// The id of the calling thread.
    fn current_thread() -> ThreadId;

    /// Whether the calling thread has a pending kill signal.
    fn thread_killed() -> bool;

    /// Registers `observer` for migration and exit of `thread`.
    fn watch_thread(thread: ThreadId, observer: Weak<dyn ThreadObserver>);

    /// Disables interrupts on the current CPU, returning the previous state.
    fn irq_save() -> usize;

    /// Restores an interrupt state returned by [`El2Hal::irq_save`].
    fn irq_restore(state: usize);

    /// Allocates `num_pages` contiguous 4K pages.
    fn alloc_pages(num_pages: usize) -> Option<HostPhysAddr>;

    /// Frees pages returned by [`El2Hal::alloc_pages`].
    fn dealloc_pages(paddr: HostPhysAddr, num_pages: usize);

    /// Converts a host physical address to a host virtual address.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;

    /// The physical memory to identity map at EL2. Regions never overlap.
    fn memory_regions() -> Vec<MemRegion>;

    /// Turns on EL2 on the current CPU with the given translation table and
    /// stack.
    fn el2_on(ttbr0: HostPhysAddr, stack_top: HostPhysAddr) -> AxResult;

    /// Turns off EL2 on the current CPU.
    fn el2_off() -> AxResult;

    /// Enters the guest described by `state` until it traps or a physical
    /// interrupt arrives.
    ///
    /// `vttbr` carries the stage-2 table base and the VMID, `hcr` the value to
    /// load into HCR_EL2. Implementations translate `state` to its physical
    /// address before handing it to the trampoline.
    fn resume_guest(vttbr: u64, state: &mut El2State, hcr: u64) -> GuestEntry;

    /// Number of list registers implemented by the interrupt controller.
    fn gich_num_lrs() -> usize;

    /// Number of priority bits implemented by the virtual CPU interface.
    fn gich_priority_bits() -> u8;

    /// Loads the virtual interface control state from the controller.
    fn gich_read(regs: &mut GichRegs);

    /// Stores the virtual interface control state into the controller.
    fn gich_write(regs: &GichRegs);

    /// Physical address of the legacy virtual CPU interface window, only
    /// present on controllers that expose one.
    fn gicv_paddr() -> Option<HostPhysAddr> {
        None
    }

    /// Current value of the virtual counter.
    fn current_ticks() -> u64;

    /// Creates the guest-physical address space tagged with `vmid`.
    fn new_addr_space(vmid: u8) -> AxResult<Self::AddrSpace>;
}

/// Keeps interrupts disabled on the current CPU while alive.
pub(crate) struct IrqGuard<H: El2Hal> {
    state: usize,
    _hal: core::marker::PhantomData<H>,
}

impl<H: El2Hal> IrqGuard<H> {
    pub fn new() -> Self {
        Self {
            state: H::irq_save(),
            _hal: core::marker::PhantomData,
        }
    }
}

impl<H: El2Hal> Drop for IrqGuard<H> {
    fn drop(&mut self) {
        H::irq_restore(self.state);
    }
}
