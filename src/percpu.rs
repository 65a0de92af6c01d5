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

use axerrno::AxResult;

use crate::{
    addr::HostPhysAddr,
    el2::Stack,
    hal::{CpuMask, El2Hal},
};

/// Host per-CPU state for running guests: the CPU's EL2 stack and whether
/// EL2 is currently turned on there.
///
/// One of these exists for every possible CPU while the coordinator is
/// alive, whether or not the CPU is online.
pub struct El2PerCpu<H: El2Hal> {
    /// The id of the CPU.
    cpu_id: usize,
    /// The stack used by the CPU while executing at EL2.
    stack: Stack<H>,
    /// Whether EL2 was activated on this CPU.
    enabled: bool,
}

impl<H: El2Hal> El2PerCpu<H> {
    /// Create the per-CPU state, allocating its EL2 stack.
    pub fn new(cpu_id: usize) -> AxResult<Self> {
        Ok(Self {
            cpu_id,
            stack: Stack::alloc()?,
            enabled: false,
        })
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    /// Whether EL2 is enabled on this CPU.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The initial EL2 stack pointer for this CPU.
    pub fn stack_top(&self) -> HostPhysAddr {
        self.stack.top()
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Iterates the CPU numbers set in `mask`.
pub fn cpus_in(mask: CpuMask) -> impl Iterator<Item = usize> {
    (0..CpuMask::BITS as usize).filter(move |cpu| mask & (1 << cpu) != 0)
}

/// The mask holding only `cpu`.
pub const fn cpu_bit(cpu: usize) -> CpuMask {
    1 << cpu
}
