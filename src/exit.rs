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

use crate::addr::GuestPhysAddr;

/// A structured event surfaced to host user space.
///
/// Bell packets are queued on a trap's port; every other kind is returned
/// from [`Vcpu::resume`](crate::Vcpu::resume) and must be handled before the
/// vCPU is resumed again.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuestPacket {
    /// The guest touched a bell trap.
    Bell {
        /// The key the trap was registered with.
        key: u64,
        /// The exact guest-physical address accessed.
        addr: GuestPhysAddr,
    },
    /// The guest accessed a memory trap; the host emulates the access.
    ///
    /// For a read the host completes the access by writing the result into
    /// register `reg` before resuming.
    Mem {
        /// The key the trap was registered with.
        key: u64,
        /// The exact guest-physical address accessed.
        addr: GuestPhysAddr,
        /// Access size in bytes: 1, 2, 4 or 8.
        access_size: u8,
        /// Whether a read must be sign-extended into the register.
        sign_extend: bool,
        /// The destination (read) or source (write) register, 31 being the
        /// zero register.
        reg: u8,
        /// Whether the access is a read.
        read: bool,
        /// The value written, truncated to the access size. Zero for reads.
        data: u64,
    },
    /// The guest asked, via PSCI CPU_ON, for a secondary vCPU to start.
    ///
    /// The host creates the vCPU and answers with
    /// [`Vcpu::acknowledge_startup`](crate::Vcpu::acknowledge_startup)
    /// before resuming the requesting vCPU.
    VcpuStartup {
        /// Target affinity (MPIDR) requested by the guest.
        id: u64,
        /// Where the new vCPU starts executing.
        entry: GuestPhysAddr,
    },
    /// The guest sent a software-generated interrupt to other vCPUs.
    VcpuInterrupt {
        /// Target vCPUs, bit `n` being the vCPU with VPID `n + 1`.
        mask: u64,
        /// The SGI number.
        vector: u32,
    },
}

/// How a call to [`Vcpu::resume`](crate::Vcpu::resume) ended without error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VcpuExit {
    /// A packet needs a host-side response before the next resume.
    Packet(GuestPacket),
    /// The guest turned the vCPU off (PSCI CPU_OFF).
    Stopped,
    /// The host thread was asked to die; observed at a guest exit.
    Canceled,
}

/// The host's answer to a [`GuestPacket::VcpuStartup`] request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartupAck {
    /// The secondary vCPU was created.
    Started,
    /// A vCPU with the requested id already runs.
    AlreadyOn,
    /// The requested id does not name a vCPU of this guest.
    InvalidTarget,
}
