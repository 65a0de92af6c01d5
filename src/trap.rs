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

//! Guest-physical traps: ranges whose accesses are reported to the host.

use alloc::{collections::BTreeMap, sync::Arc};
use core::fmt;

use axerrno::{AxResult, ax_err};
use spin::Mutex;

use crate::{addr::GuestPhysAddr, exit::GuestPacket};

/// Kind of a guest-physical trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    /// Accesses are handed to the host for emulation, one packet per access,
    /// surfaced through `resume`.
    Mem,
    /// Accesses ring a doorbell: a packet is queued on the trap's port and
    /// the guest continues.
    Bell,
    /// Port I/O, which does not exist on aarch64.
    Io,
}

/// A destination for packets queued by bell traps.
pub trait PacketPort: Send + Sync {
    fn queue(&self, packet: GuestPacket) -> AxResult;
}

/// A registered trap.
#[derive(Clone)]
pub struct Trap {
    kind: TrapKind,
    addr: GuestPhysAddr,
    len: usize,
    port: Option<Arc<dyn PacketPort>>,
    key: u64,
}

impl Trap {
    pub fn new(
        kind: TrapKind,
        addr: GuestPhysAddr,
        len: usize,
        port: Option<Arc<dyn PacketPort>>,
        key: u64,
    ) -> Self {
        Self {
            kind,
            addr,
            len,
            port,
            key,
        }
    }

    pub fn kind(&self) -> TrapKind {
        self.kind
    }

    pub fn addr(&self) -> GuestPhysAddr {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn contains(&self, addr: GuestPhysAddr) -> bool {
        let base = self.addr.as_usize();
        (base..base + self.len).contains(&addr.as_usize())
    }

    /// Queues `packet` on the trap's port.
    pub fn queue(&self, packet: GuestPacket) -> AxResult {
        match &self.port {
            Some(port) => port.queue(packet),
            None => ax_err!(BadState, "trap has no port"),
        }
    }
}

impl fmt::Debug for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trap")
            .field("kind", &self.kind)
            .field("addr", &self.addr)
            .field("len", &format_args!("{:#x}", self.len))
            .field("key", &self.key)
            .field("has_port", &self.port.is_some())
            .finish()
    }
}

/// The traps of one guest, keyed by base address. Traps never overlap.
#[derive(Default)]
pub struct TrapMap {
    traps: Mutex<BTreeMap<usize, Trap>>,
}

impl TrapMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `trap`, rejecting any overlap with an existing one.
    pub fn insert(&self, trap: Trap) -> AxResult {
        let base = trap.addr.as_usize();
        let end = base + trap.len;
        let mut traps = self.traps.lock();
        let prev_overlaps = traps
            .range(..end)
            .next_back()
            .is_some_and(|(&prev_base, prev)| prev_base + prev.len > base);
        if prev_overlaps {
            return ax_err!(AlreadyExists, "trap overlaps an existing trap");
        }
        traps.insert(base, trap);
        Ok(())
    }

    /// Finds the trap covering `addr`.
    pub fn find(&self, addr: GuestPhysAddr) -> Option<Trap> {
        let traps = self.traps.lock();
        traps
            .range(..=addr.as_usize())
            .next_back()
            .map(|(_, trap)| trap)
            .filter(|trap| trap.contains(addr))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.traps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
