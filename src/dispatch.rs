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

//! The VM-exit dispatcher.
//!
//! Maps one decoded exit to what the resume loop does next. Nothing here
//! touches hardware directly; everything it needs is handed in through an
//! [`ExitContext`].

use axerrno::{AxResult, ax_err};

use crate::{
    addr::GuestPhysAddr,
    decode::{
        DataAbort, ExceptionSyndrome, SgiRegister, SgiTarget, SmcInstruction, SystemInstruction,
        SystemRegister, WaitInstruction,
    },
    exit::GuestPacket,
    hal::{El2Hal, GuestAddrSpace, HostEvent},
    regs::{GuestState, HcrFlags, SctlrFlags, SystemState},
    trap::{TrapKind, TrapMap},
    vgic::{GichState, InterruptQueue},
};

/// SMC immediate used for PSCI calls.
pub const PSCI_IMM: u16 = 0;

/// SMCCC return value for an unknown function.
pub const SMCCC_UNKNOWN: u64 = u64::MAX;

/// PSCI function ids and return codes.
pub mod psci {
    pub const VERSION: u32 = 0x8400_0000;
    pub const CPU_OFF: u32 = 0x8400_0002;
    pub const CPU_ON_32: u32 = 0x8400_0003;
    pub const CPU_ON_64: u32 = 0xc400_0003;

    pub const MAJOR_VERSION: u64 = 0;
    pub const MINOR_VERSION: u64 = 2;

    pub const SUCCESS: i64 = 0;
    pub const NOT_SUPPORTED: i64 = -1;
    pub const INVALID_PARAMETERS: i64 = -2;
    pub const ALREADY_ON: i64 = -4;
}

/// What the resume loop does after an exit was handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitAction {
    /// Re-enter the guest.
    Continue,
    /// Return the packet to the caller before re-entering.
    Next(GuestPacket),
    /// Leave the resume loop; the vCPU was turned off.
    Stop,
}

/// Everything an exit handler may read or modify.
pub struct ExitContext<'a, H: El2Hal> {
    pub hcr: &'a mut HcrFlags,
    pub guest_state: &'a mut GuestState,
    pub gich: &'a GichState,
    pub queue: &'a InterruptQueue,
    pub event: &'a H::Event,
    pub aspace: &'a H::AddrSpace,
    pub traps: &'a TrapMap,
    pub vpid: u8,
}

/// Handles one guest exit.
pub fn handle_exit<H: El2Hal>(
    syndrome: ExceptionSyndrome,
    ctx: &mut ExitContext<'_, H>,
) -> AxResult<ExitAction> {
    trace!("exit: {:?} at pc {:#x}", syndrome, ctx.guest_state.pc());
    let result = match syndrome {
        ExceptionSyndrome::Wait(wait) => handle_wait::<H>(wait, ctx),
        ExceptionSyndrome::Smc(smc) => handle_smc(smc, ctx),
        ExceptionSyndrome::System(si) => handle_system_instruction(si, ctx),
        ExceptionSyndrome::InstructionAbort => handle_instruction_abort(ctx),
        ExceptionSyndrome::DataAbort(abort) => handle_data_abort(abort, ctx),
        ExceptionSyndrome::Unknown { class } => {
            ax_err!(Unsupported, format!("unhandled exception class {:#x}", class))
        }
    };
    if let Err(err) = &result {
        let state = &ctx.guest_state;
        warn!(
            "exit: {:?} failed with {:?}: esr {:#x} elr {:#x} far {:#x} hpfar {:#x}",
            syndrome,
            err,
            state.esr_el2,
            state.system_state.elr_el2,
            state.far_el2,
            state.hpfar_el2
        );
    }
    result
}

fn handle_wait<H: El2Hal>(
    wait: WaitInstruction,
    ctx: &mut ExitContext<'_, H>,
) -> AxResult<ExitAction> {
    ctx.guest_state.advance_pc();
    if wait.is_wfe || ctx.gich.any_lr_in_use() || !ctx.queue.is_empty() {
        return Ok(ExitAction::Continue);
    }
    let deadline = ctx.guest_state.timer_deadline();
    if deadline.is_some_and(|deadline| deadline <= H::current_ticks()) {
        return Ok(ExitAction::Continue);
    }
    ctx.event.wait_until(deadline);
    Ok(ExitAction::Continue)
}

fn handle_smc<H: El2Hal>(
    smc: SmcInstruction,
    ctx: &mut ExitContext<'_, H>,
) -> AxResult<ExitAction> {
    let state = &mut *ctx.guest_state;
    if smc.imm != PSCI_IMM {
        state.set_reg(0, SMCCC_UNKNOWN);
        state.advance_pc();
        return Ok(ExitAction::Continue);
    }

    match state.reg(0) as u32 {
        psci::VERSION => {
            state.set_reg(0, psci::MAJOR_VERSION << 16 | psci::MINOR_VERSION);
            state.advance_pc();
            Ok(ExitAction::Continue)
        }
        psci::CPU_ON_32 | psci::CPU_ON_64 => {
            let packet = GuestPacket::VcpuStartup {
                id: state.reg(1),
                entry: GuestPhysAddr::from_usize(state.reg(2) as usize),
            };
            state.set_reg(0, psci::SUCCESS as u64);
            state.advance_pc();
            Ok(ExitAction::Next(packet))
        }
        psci::CPU_OFF => Ok(ExitAction::Stop),
        function => {
            debug!("psci: function {:#x} is not supported", function);
            state.set_reg(0, psci::NOT_SUPPORTED as u64);
            state.advance_pc();
            Ok(ExitAction::Continue)
        }
    }
}

/// Storage for a system register kept in the register block.
fn passthrough_reg(state: &mut SystemState, reg: SystemRegister) -> Option<&mut u64> {
    Some(match reg {
        SystemRegister::Ttbr0El1 => &mut state.ttbr0_el1,
        SystemRegister::Ttbr1El1 => &mut state.ttbr1_el1,
        SystemRegister::TcrEl1 => &mut state.tcr_el1,
        SystemRegister::Afsr0El1 => &mut state.afsr0_el1,
        SystemRegister::Afsr1El1 => &mut state.afsr1_el1,
        SystemRegister::EsrEl1 => &mut state.esr_el1,
        SystemRegister::FarEl1 => &mut state.far_el1,
        SystemRegister::MairEl1 => &mut state.mair_el1,
        SystemRegister::AmairEl1 => &mut state.amair_el1,
        SystemRegister::ContextidrEl1 => &mut state.contextidr_el1,
        _ => return None,
    })
}

fn handle_system_instruction<H: El2Hal>(
    si: SystemInstruction,
    ctx: &mut ExitContext<'_, H>,
) -> AxResult<ExitAction> {
    let Some(reg) = si.register() else {
        return ax_err!(
            Unsupported,
            format!("no emulation for system register {:#x}", si.encoding)
        );
    };

    let state = &mut *ctx.guest_state;
    let xt_value = state.reg(si.xt);
    if let Some(storage) = passthrough_reg(&mut state.system_state, reg) {
        if si.read {
            let value = *storage;
            state.set_reg(si.xt, value);
        } else {
            *storage = xt_value;
        }
        state.advance_pc();
        return Ok(ExitAction::Continue);
    }

    match reg {
        SystemRegister::SctlrEl1 => {
            if si.read {
                let value = state.system_state.sctlr_el1;
                state.set_reg(si.xt, value);
            } else {
                let value = xt_value & u32::MAX as u64;
                write_sctlr(ctx.hcr, state, ctx.aspace, value);
            }
            state.advance_pc();
            Ok(ExitAction::Continue)
        }
        SystemRegister::OslarEl1
        | SystemRegister::OslsrEl1
        | SystemRegister::OsdlrEl1
        | SystemRegister::DbgprcrEl1
        | SystemRegister::MdscrEl1 => {
            if si.read {
                state.set_reg(si.xt, 0);
            }
            state.advance_pc();
            Ok(ExitAction::Continue)
        }
        SystemRegister::IccSgi1rEl1 => {
            if si.read {
                return ax_err!(Unsupported, "ICC_SGI1R_EL1 is write-only");
            }
            let sgi = SgiRegister::decode(xt_value)?;
            let mask = match sgi.target {
                SgiTarget::List(list) => list as u64,
                SgiTarget::AllButLocal => !vpid_bit(ctx.vpid),
            };
            state.advance_pc();
            Ok(ExitAction::Next(GuestPacket::VcpuInterrupt {
                mask,
                vector: sgi.vector as u32,
            }))
        }
        _ => ax_err!(Unsupported, format!("no emulation for {:?}", reg)),
    }
}

/// The bit of `vpid` in a [`GuestPacket::VcpuInterrupt`] mask, or zero if
/// it has none.
fn vpid_bit(vpid: u8) -> u64 {
    vpid.checked_sub(1)
        .and_then(|n| 1u64.checked_shl(n as u32))
        .unwrap_or(0)
}

/// Stores a guest write to SCTLR_EL1.
///
/// When the write turns the guest's stage-1 MMU on, memory the guest wrote
/// with caches off is made coherent: stop forcing cacheability, stop
/// trapping VM register writes once the data cache is on too, and clean and
/// invalidate everything mapped at stage 2. This happens once per off→on
/// transition.
fn write_sctlr<A: GuestAddrSpace>(
    hcr: &mut HcrFlags,
    state: &mut GuestState,
    aspace: &A,
    value: u64,
) {
    let old = SctlrFlags::from_bits_retain(state.system_state.sctlr_el1);
    let new = SctlrFlags::from_bits_retain(value);
    if new.contains(SctlrFlags::M) && !old.contains(SctlrFlags::M) {
        hcr.remove(HcrFlags::DC);
        if new.contains(SctlrFlags::C) {
            hcr.remove(HcrFlags::TVM);
        }
        debug!("exit: guest enabled its MMU, cleaning stage-2 caches");
        aspace.clean_invalidate_cache();
    }
    state.system_state.sctlr_el1 = value;
}

fn handle_instruction_abort<H: El2Hal>(ctx: &mut ExitContext<'_, H>) -> AxResult<ExitAction> {
    let addr = ctx.guest_state.fault_page();
    ctx.aspace.resolve_fault(addr)?;
    Ok(ExitAction::Continue)
}

fn handle_data_abort<H: El2Hal>(
    abort: DataAbort,
    ctx: &mut ExitContext<'_, H>,
) -> AxResult<ExitAction> {
    let addr = ctx.guest_state.fault_addr();
    let Some(trap) = ctx.traps.find(addr) else {
        ctx.aspace.resolve_fault(ctx.guest_state.fault_page())?;
        return Ok(ExitAction::Continue);
    };

    let state = &mut *ctx.guest_state;
    match trap.kind() {
        TrapKind::Bell => {
            state.advance_pc();
            trap.queue(GuestPacket::Bell {
                key: trap.key(),
                addr,
            })?;
            Ok(ExitAction::Continue)
        }
        TrapKind::Mem => {
            if !abort.valid {
                return ax_err!(
                    InvalidData,
                    format!("data abort at {:?} carries no access syndrome", addr)
                );
            }
            let data = if abort.read {
                0
            } else {
                truncate(state.reg(abort.xt), abort.access_size)
            };
            state.advance_pc();
            Ok(ExitAction::Next(GuestPacket::Mem {
                key: trap.key(),
                addr,
                access_size: abort.access_size,
                sign_extend: abort.sign_extend,
                reg: abort.xt,
                read: abort.read,
                data,
            }))
        }
        TrapKind::Io => ax_err!(Unsupported, "I/O trap in the memory space"),
    }
}

fn truncate(value: u64, access_size: u8) -> u64 {
    match access_size {
        8 => value,
        size => value & ((1u64 << (size as u32 * 8)) - 1),
    }
}
