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

//! El2hv - an ARMv8 EL2 hypervisor engine.
//!
//! This crate runs hardware-assisted guests on an aarch64 host kernel. It
//! switches EL2 on and off with the lifetime of the guests, allocates VMIDs
//! and VPIDs, keeps the per-vCPU virtual interrupt controller state and
//! emulates the guest exits that do not need the host.
//!
//! Everything the engine needs from the kernel (scheduler, page allocator,
//! interrupt controller driver and the EL2 trampolines) is reached through
//! the [`El2Hal`] trait.
//!
//! # Features
//!
//! - EL2 activation on the first guest and teardown after the last one
//! - Guest address spaces with memory and doorbell traps
//! - A thread-bound vCPU with a blocking resume loop
//! - Virtual interrupt injection through the GIC list registers
//! - PSCI, system register and stage-2 fault emulation

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

// Core modules
mod addr; // Guest and host address types
mod coordinator; // EL2 activation and VMID allocation
mod decode; // Exception syndrome decoding
mod dispatch; // VM-exit dispatcher
mod el2; // EL2 translation table and stacks
mod exit; // Packets and resume results
mod guest; // Guest address space, traps and VPIDs
mod hal; // Hardware abstraction layer interfaces
mod id_alloc; // VMID and VPID allocation
mod percpu; // Per-CPU EL2 state
mod regs; // Guest register block
mod trap; // Guest-physical traps
mod vcpu; // vCPU and its resume loop
mod vgic; // Virtual interrupt controller state

#[cfg(test)]
mod test; // Unit tests with a mock kernel

// Public API exports
pub use addr::{GuestPhysAddr, HostPhysAddr, HostVirtAddr};
pub use coordinator::{El2Registry, VMID_RANGE};
pub use decode::{
    DataAbort, ExceptionSyndrome, SgiRegister, SgiTarget, SmcInstruction, SystemInstruction,
    SystemRegister, WaitInstruction, ec, make_esr, sys_reg,
};
pub use dispatch::{ExitAction, ExitContext, handle_exit, psci};
pub use el2::{DescriptorFlags, EL2_STACK_PAGES, Mapping, Stack, TranslationTable};
pub use exit::{GuestPacket, StartupAck, VcpuExit};
pub use guest::{GICV_GUEST_PADDR, GICV_SIZE, Guest, VPID_RANGE};
pub use hal::{
    CpuMask, El2Hal, GuestAddrSpace, GuestEntry, HostEvent, MemRegion, MemRegionKind, NO_THREAD,
    ThreadId, ThreadObserver,
};
pub use id_alloc::IdAllocator;
pub use percpu::El2PerCpu;
pub use regs::{
    El2State, GuestState, HcrFlags, HostState, SctlrFlags, SystemState, TimerCtl, VcpuRegs,
};
pub use trap::{PacketPort, Trap, TrapKind, TrapMap};
pub use vcpu::{VcpuState, Vcpu, VcpuInterrupter};
pub use vgic::{
    GichRegs, GichState, InterruptQueue, InterruptType, LrState, QueuedInterrupt, TIMER_VECTOR,
    encode_lr, lr_priority, lr_vector, vector_priority,
};
