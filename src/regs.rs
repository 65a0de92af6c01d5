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

//! The register block shared with the entry/exit trampoline, plus the bit
//! definitions of the EL2 control registers the engine manipulates.

use bitflags::bitflags;

use crate::addr::{GuestPhysAddr, PAGE_OFFSET_MASK};

/// Number of general purpose registers (x0 - x30).
pub const NUM_GPRS: usize = 31;

/// Register index that names the zero register in trapped instructions.
pub const XZR: u8 = 31;

/// Width of an aarch64 instruction.
pub const INSN_SIZE: u64 = 4;

/// SPSR value for a guest starting in EL1h with DAIF masked.
pub const SPSR_EL1H_DAIF: u64 = 0b0101 | (0b1111 << 6);

/// Condition flag bits (NZCV) of a saved program status register.
pub const SPSR_NZCV: u64 = 0xf << 28;

/// HPFAR_EL2.FIPA, bits [43:4], holding IPA bits [47:12].
const HPFAR_FIPA_MASK: u64 = 0x0fff_ffff_fff0;

bitflags! {
    /// Hypervisor Configuration Register (HCR_EL2).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HcrFlags: u64 {
        /// Stage-2 translation enable.
        const VM = 1 << 0;
        const SWIO = 1 << 1;
        /// Protected table walk.
        const PTW = 1 << 2;
        const FMO = 1 << 3;
        const IMO = 1 << 4;
        const AMO = 1 << 5;
        /// Default cacheability: treat guest memory as cacheable while the
        /// guest MMU is off.
        const DC = 1 << 12;
        const TWI = 1 << 13;
        const TWE = 1 << 14;
        /// Trap SMC.
        const TSC = 1 << 19;
        /// Trap data cache maintenance by set/way.
        const TSW = 1 << 22;
        /// Trap writes to the virtual memory control registers.
        const TVM = 1 << 26;
        /// EL1 is aarch64.
        const RW = 1 << 31;
    }
}

impl HcrFlags {
    /// Traps every guest starts with.
    pub const GUEST_DEFAULT: Self = Self::VM
        .union(Self::PTW)
        .union(Self::FMO)
        .union(Self::IMO)
        .union(Self::AMO)
        .union(Self::TWI)
        .union(Self::TWE)
        .union(Self::TSC)
        .union(Self::TVM)
        .union(Self::RW);
}

bitflags! {
    /// System Control Register (SCTLR_EL1) bits the engine inspects.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SctlrFlags: u64 {
        /// Stage-1 MMU enable.
        const M = 1 << 0;
        /// Data cache enable.
        const C = 1 << 2;
        /// Instruction cache enable.
        const I = 1 << 12;
    }
}

bitflags! {
    /// Virtual timer control (CNTV_CTL_EL0).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TimerCtl: u64 {
        const ENABLE = 1 << 0;
        const IMASK = 1 << 1;
        const ISTATUS = 1 << 2;
    }
}

/// EL1 system registers owned by the guest. The trampoline loads these on
/// entry and saves them on exit.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemState {
    pub sp_el0: u64,
    pub sp_el1: u64,
    /// Guest program counter.
    pub elr_el2: u64,
    /// Guest program status.
    pub spsr_el2: u64,
    pub vmpidr_el2: u64,

    pub cntv_ctl_el0: u64,
    pub cntv_cval_el0: u64,

    pub sctlr_el1: u64,
    pub ttbr0_el1: u64,
    pub ttbr1_el1: u64,
    pub tcr_el1: u64,
    pub mair_el1: u64,
    pub amair_el1: u64,
    pub contextidr_el1: u64,
    pub esr_el1: u64,
    pub far_el1: u64,
    pub afsr0_el1: u64,
    pub afsr1_el1: u64,
}

/// Guest general purpose and system state, plus the syndrome of the last exit.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestState {
    pub x: [u64; NUM_GPRS],
    pub system_state: SystemState,

    pub esr_el2: u64,
    pub far_el2: u64,
    pub hpfar_el2: u64,
}

impl GuestState {
    /// Reads general purpose register `n`, where 31 is the zero register.
    pub fn reg(&self, n: u8) -> u64 {
        if n >= XZR { 0 } else { self.x[n as usize] }
    }

    /// Writes general purpose register `n`. Writes to the zero register are
    /// discarded.
    pub fn set_reg(&mut self, n: u8, value: u64) {
        if n < XZR {
            self.x[n as usize] = value;
        }
    }

    /// Moves the guest program counter past the trapped instruction.
    pub fn advance_pc(&mut self) {
        self.system_state.elr_el2 += INSN_SIZE;
    }

    pub fn pc(&self) -> u64 {
        self.system_state.elr_el2
    }

    /// Page-granular faulting IPA from HPFAR_EL2.
    pub fn fault_page(&self) -> GuestPhysAddr {
        GuestPhysAddr::from_usize(((self.hpfar_el2 & HPFAR_FIPA_MASK) << 8) as usize)
    }

    /// Exact faulting IPA: the HPFAR_EL2 page combined with the page offset
    /// held in FAR_EL2.
    pub fn fault_addr(&self) -> GuestPhysAddr {
        let offset = self.far_el2 as usize & PAGE_OFFSET_MASK;
        GuestPhysAddr::from_usize(self.fault_page().as_usize() | offset)
    }

    /// Deadline of the virtual timer in counter ticks, if it can fire.
    pub fn timer_deadline(&self) -> Option<u64> {
        let ctl = TimerCtl::from_bits_retain(self.system_state.cntv_ctl_el0);
        if ctl.contains(TimerCtl::ENABLE) && !ctl.contains(TimerCtl::IMASK) {
            Some(self.system_state.cntv_cval_el0)
        } else {
            None
        }
    }

    /// Whether the virtual timer is armed and its comparator has elapsed.
    pub fn timer_expired(&self, now: u64) -> bool {
        self.timer_deadline().is_some_and(|deadline| deadline <= now)
    }
}

/// Host callee-saved state, preserved by the trampoline across a guest entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HostState {
    /// x18 - x30.
    pub x: [u64; 13],
    pub sp: u64,
}

/// The register block handed to the trampoline by address.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct El2State {
    pub host_state: HostState,
    pub guest_state: GuestState,
}

/// The externally visible general register state of a vCPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VcpuRegs {
    pub x: [u64; NUM_GPRS],
    pub sp: u64,
    /// Only the NZCV condition flags are meaningful.
    pub cpsr: u32,
}

impl VcpuRegs {
    pub(crate) fn read_from(state: &GuestState) -> Self {
        Self {
            x: state.x,
            sp: state.system_state.sp_el1,
            cpsr: (state.system_state.spsr_el2 & SPSR_NZCV) as u32,
        }
    }

    pub(crate) fn write_to(&self, state: &mut GuestState) {
        state.x = self.x;
        state.system_state.sp_el1 = self.sp;
        let spsr = state.system_state.spsr_el2 & !SPSR_NZCV;
        state.system_state.spsr_el2 = spsr | (self.cpsr as u64 & SPSR_NZCV);
    }
}
