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

//! Decoding of the exception syndrome register into per-class exit records.
//!
//! Every exit is decoded exactly once into an [`ExceptionSyndrome`], whose
//! variants carry only the fields meaningful for their exception class.

use axerrno::{AxResult, ax_err};
use tock_registers::register_bitfields;

register_bitfields! {u64,
    /// ESR_EL2.
    pub ESR [
        EC OFFSET(26) NUMBITS(6) [],
        IL OFFSET(25) NUMBITS(1) [],
        ISS OFFSET(0) NUMBITS(25) []
    ],

    /// ISS encoding for an exception from a data abort.
    pub DABT_ISS [
        ISV OFFSET(24) NUMBITS(1) [],
        SAS OFFSET(22) NUMBITS(2) [],
        SSE OFFSET(21) NUMBITS(1) [],
        SRT OFFSET(16) NUMBITS(5) [],
        SF OFFSET(15) NUMBITS(1) [],
        WNR OFFSET(6) NUMBITS(1) []
    ],

    /// ISS encoding for an MSR/MRS or system instruction.
    pub SYS_ISS [
        OP0 OFFSET(20) NUMBITS(2) [],
        OP2 OFFSET(17) NUMBITS(3) [],
        OP1 OFFSET(14) NUMBITS(3) [],
        CRN OFFSET(10) NUMBITS(4) [],
        RT OFFSET(5) NUMBITS(5) [],
        CRM OFFSET(1) NUMBITS(4) [],
        DIRECTION OFFSET(0) NUMBITS(1) []
    ],

    /// ISS encoding for WFI/WFE.
    pub WFX_ISS [
        TI OFFSET(0) NUMBITS(1) []
    ],

    /// ISS encoding for SMC.
    pub SMC_ISS [
        IMM16 OFFSET(0) NUMBITS(16) []
    ],

    /// ICC_SGI1R_EL1.
    pub SGI1R [
        AFF3 OFFSET(48) NUMBITS(8) [],
        RS OFFSET(44) NUMBITS(4) [],
        IRM OFFSET(40) NUMBITS(1) [],
        AFF2 OFFSET(32) NUMBITS(8) [],
        INTID OFFSET(24) NUMBITS(4) [],
        AFF1 OFFSET(16) NUMBITS(8) [],
        TARGET_LIST OFFSET(0) NUMBITS(16) []
    ]
}

/// Exception classes the engine emulates.
pub mod ec {
    pub const WFX: u8 = 0b00_0001;
    pub const SMC64: u8 = 0b01_0111;
    pub const SYSTEM: u8 = 0b01_1000;
    pub const IABT_LOWER: u8 = 0b10_0000;
    pub const DABT_LOWER: u8 = 0b10_0100;
}

/// Packs a system register encoding the way the Arm ARM writes it.
pub const fn sys_reg(op0: u8, op1: u8, crn: u8, crm: u8, op2: u8) -> u32 {
    (op0 as u32) << 14 | (op1 as u32) << 11 | (crn as u32) << 7 | (crm as u32) << 3 | op2 as u32
}

/// System registers with a trap emulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemRegister {
    SctlrEl1,
    Ttbr0El1,
    Ttbr1El1,
    TcrEl1,
    Afsr0El1,
    Afsr1El1,
    EsrEl1,
    FarEl1,
    MairEl1,
    AmairEl1,
    ContextidrEl1,

    OslarEl1,
    OslsrEl1,
    OsdlrEl1,
    DbgprcrEl1,
    MdscrEl1,

    IccSgi1rEl1,
}

impl SystemRegister {
    pub const SCTLR_EL1: u32 = sys_reg(3, 0, 1, 0, 0);
    pub const TTBR0_EL1: u32 = sys_reg(3, 0, 2, 0, 0);
    pub const TTBR1_EL1: u32 = sys_reg(3, 0, 2, 0, 1);
    pub const TCR_EL1: u32 = sys_reg(3, 0, 2, 0, 2);
    pub const AFSR0_EL1: u32 = sys_reg(3, 0, 5, 1, 0);
    pub const AFSR1_EL1: u32 = sys_reg(3, 0, 5, 1, 1);
    pub const ESR_EL1: u32 = sys_reg(3, 0, 5, 2, 0);
    pub const FAR_EL1: u32 = sys_reg(3, 0, 6, 0, 0);
    pub const MAIR_EL1: u32 = sys_reg(3, 0, 10, 2, 0);
    pub const AMAIR_EL1: u32 = sys_reg(3, 0, 10, 3, 0);
    pub const CONTEXTIDR_EL1: u32 = sys_reg(3, 0, 13, 0, 1);
    pub const OSLAR_EL1: u32 = sys_reg(2, 0, 1, 0, 4);
    pub const OSLSR_EL1: u32 = sys_reg(2, 0, 1, 1, 4);
    pub const OSDLR_EL1: u32 = sys_reg(2, 0, 1, 3, 4);
    pub const DBGPRCR_EL1: u32 = sys_reg(2, 0, 1, 4, 4);
    pub const MDSCR_EL1: u32 = sys_reg(2, 0, 0, 2, 2);
    pub const ICC_SGI1R_EL1: u32 = sys_reg(3, 0, 12, 11, 5);

    /// Looks up a packed encoding.
    pub fn from_encoding(encoding: u32) -> Option<Self> {
        Some(match encoding {
            Self::SCTLR_EL1 => Self::SctlrEl1,
            Self::TTBR0_EL1 => Self::Ttbr0El1,
            Self::TTBR1_EL1 => Self::Ttbr1El1,
            Self::TCR_EL1 => Self::TcrEl1,
            Self::AFSR0_EL1 => Self::Afsr0El1,
            Self::AFSR1_EL1 => Self::Afsr1El1,
            Self::ESR_EL1 => Self::EsrEl1,
            Self::FAR_EL1 => Self::FarEl1,
            Self::MAIR_EL1 => Self::MairEl1,
            Self::AMAIR_EL1 => Self::AmairEl1,
            Self::CONTEXTIDR_EL1 => Self::ContextidrEl1,
            Self::OSLAR_EL1 => Self::OslarEl1,
            Self::OSLSR_EL1 => Self::OslsrEl1,
            Self::OSDLR_EL1 => Self::OsdlrEl1,
            Self::DBGPRCR_EL1 => Self::DbgprcrEl1,
            Self::MDSCR_EL1 => Self::MdscrEl1,
            Self::ICC_SGI1R_EL1 => Self::IccSgi1rEl1,
            _ => return None,
        })
    }
}

/// A trapped WFI or WFE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitInstruction {
    pub is_wfe: bool,
}

/// A trapped SMC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SmcInstruction {
    pub imm: u16,
}

/// A trapped MSR/MRS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SystemInstruction {
    /// Packed `op0:op1:CRn:CRm:op2` encoding.
    pub encoding: u32,
    /// Register operand, 31 being the zero register.
    pub xt: u8,
    /// MRS (read) when set, MSR (write) otherwise.
    pub read: bool,
}

impl SystemInstruction {
    pub fn register(&self) -> Option<SystemRegister> {
        SystemRegister::from_encoding(self.encoding)
    }
}

/// A stage-2 data abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataAbort {
    /// Whether the syndrome carries the access size and register (ISV).
    pub valid: bool,
    /// Access size in bytes.
    pub access_size: u8,
    pub sign_extend: bool,
    pub xt: u8,
    pub read: bool,
}

/// A decoded exception syndrome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionSyndrome {
    Wait(WaitInstruction),
    Smc(SmcInstruction),
    System(SystemInstruction),
    InstructionAbort,
    DataAbort(DataAbort),
    /// Any exception class without an emulation.
    Unknown { class: u8 },
}

impl ExceptionSyndrome {
    pub fn decode(esr: u64) -> Self {
        let class = ESR::EC.read(esr) as u8;
        let iss = ESR::ISS.read(esr);
        match class {
            ec::WFX => Self::Wait(WaitInstruction {
                is_wfe: WFX_ISS::TI.read(iss) != 0,
            }),
            ec::SMC64 => Self::Smc(SmcInstruction {
                imm: SMC_ISS::IMM16.read(iss) as u16,
            }),
            ec::SYSTEM => Self::System(SystemInstruction {
                encoding: sys_reg(
                    SYS_ISS::OP0.read(iss) as u8,
                    SYS_ISS::OP1.read(iss) as u8,
                    SYS_ISS::CRN.read(iss) as u8,
                    SYS_ISS::CRM.read(iss) as u8,
                    SYS_ISS::OP2.read(iss) as u8,
                ),
                xt: SYS_ISS::RT.read(iss) as u8,
                read: SYS_ISS::DIRECTION.read(iss) != 0,
            }),
            ec::IABT_LOWER => Self::InstructionAbort,
            ec::DABT_LOWER => Self::DataAbort(DataAbort {
                valid: DABT_ISS::ISV.read(iss) != 0,
                access_size: 1 << DABT_ISS::SAS.read(iss),
                sign_extend: DABT_ISS::SSE.read(iss) != 0,
                xt: DABT_ISS::SRT.read(iss) as u8,
                read: DABT_ISS::WNR.read(iss) == 0,
            }),
            class => Self::Unknown { class },
        }
    }
}

/// Who an SGI written to ICC_SGI1R_EL1 is aimed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SgiTarget {
    /// The vCPUs whose bits are set in the list.
    List(u16),
    /// Every vCPU except the writer.
    AllButLocal,
}

/// A decoded write to ICC_SGI1R_EL1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgiRegister {
    pub target: SgiTarget,
    pub vector: u8,
}

impl SgiRegister {
    /// Decodes an SGI request. Only affinity 0 targets are addressable.
    pub fn decode(value: u64) -> AxResult<Self> {
        let vector = SGI1R::INTID.read(value) as u8;
        if SGI1R::IRM.read(value) != 0 {
            return Ok(Self {
                target: SgiTarget::AllButLocal,
                vector,
            });
        }
        if SGI1R::AFF1.read(value) != 0
            || SGI1R::AFF2.read(value) != 0
            || SGI1R::AFF3.read(value) != 0
            || SGI1R::RS.read(value) != 0
        {
            return ax_err!(InvalidInput, "SGI targets outside affinity 0");
        }
        Ok(Self {
            target: SgiTarget::List(SGI1R::TARGET_LIST.read(value) as u16),
            vector,
        })
    }
}

/// Builds an ESR_EL2 value from an exception class and syndrome.
pub fn make_esr(class: u8, iss: u64) -> u64 {
    (ESR::EC.val(class as u64) + ESR::IL.val(1) + ESR::ISS.val(iss)).value
}
