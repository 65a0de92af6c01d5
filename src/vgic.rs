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

//! Software model of the virtual interrupt controller interface (GICH).
//!
//! Two structures cooperate here:
//!
//! - [`InterruptQueue`]: raised interrupts that have not yet been given a
//!   list register. Any thread may raise into it, so it is lock-guarded.
//! - [`GichState`]: the mirror of the hardware list registers, owned by the
//!   vCPU and only touched by its thread while it is outside the guest.
//!
//! Before each guest entry [`GichState::refill`] drains the queue into free
//! list registers; after each exit [`GichState::track_all_list_registers`]
//! resynchronizes the occupancy bitmap with what the guest left behind.

use alloc::collections::VecDeque;

use arrayvec::ArrayVec;
use axerrno::{AxResult, ax_err};
use spin::Mutex;
use tock_registers::register_bitfields;

/// Architectural maximum number of list registers.
pub const MAX_LIST_REGS: usize = 16;

/// Number of interrupt ids tracked.
pub const NUM_VECTORS: usize = 1024;

/// Vectors below this are SGIs and PPIs, local to a CPU.
pub const NUM_LOCAL_VECTORS: u32 = 32;

/// PPI of the EL1 virtual timer.
pub const TIMER_VECTOR: u32 = 27;

/// ICH_HCR_EL2.En
pub const GICH_HCR_EN: u64 = 1 << 0;
/// ICH_HCR_EL2.UIE: maintenance interrupt when at most one LR is valid.
pub const GICH_HCR_UIE: u64 = 1 << 1;

const NUM_BUCKETS: usize = 2;

register_bitfields! {u64,
    /// ICH_LR<n>_EL2.
    pub ICH_LR [
        STATE OFFSET(62) NUMBITS(2) [],
        HW OFFSET(61) NUMBITS(1) [],
        GROUP OFFSET(60) NUMBITS(1) [],
        PRIORITY OFFSET(48) NUMBITS(8) [],
        PINTID OFFSET(32) NUMBITS(10) [],
        VINTID OFFSET(0) NUMBITS(32) []
    ]
}

/// Whether a virtual interrupt is backed by a physical one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptType {
    /// Purely virtual; the guest's EOI only affects the list register.
    Virtual,
    /// Mapped onto the physical interrupt with the same id; the guest's EOI
    /// deactivates the physical interrupt as well.
    Physical,
}

/// State field of a list register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrState {
    Invalid = 0,
    Pending = 1,
    Active = 2,
    PendingActive = 3,
}

impl LrState {
    pub fn of(lr: u64) -> Self {
        match ICH_LR::STATE.read(lr) {
            0 => Self::Invalid,
            1 => Self::Pending,
            2 => Self::Active,
            _ => Self::PendingActive,
        }
    }
}

/// Encodes a list register in the ICH_LR<n>_EL2 layout.
pub fn encode_lr(vector: u32, priority: u8, kind: InterruptType, state: LrState) -> u64 {
    let lr = ICH_LR::STATE.val(state as u64)
        + ICH_LR::GROUP.val(1)
        + ICH_LR::PRIORITY.val(priority as u64)
        + ICH_LR::VINTID.val(vector as u64);
    match kind {
        InterruptType::Virtual => lr.value,
        InterruptType::Physical => (lr + ICH_LR::HW.val(1) + ICH_LR::PINTID.val(vector as u64)).value,
    }
}

/// Virtual interrupt id held by a list register.
pub fn lr_vector(lr: u64) -> u32 {
    ICH_LR::VINTID.read(lr) as u32
}

/// Priority field of a list register.
pub fn lr_priority(lr: u64) -> u8 {
    ICH_LR::PRIORITY.read(lr) as u8
}

/// Priority given to `vector`: local interrupts get the highest priority,
/// everything else the next implemented step down.
pub fn vector_priority(vector: u32, priority_bits: u8) -> u8 {
    let bucket = if vector < NUM_LOCAL_VECTORS { 0 } else { 1 };
    bucket << (8 - priority_bits.clamp(1, 8))
}

#[derive(Clone)]
struct VectorSet([u64; NUM_VECTORS / 64]);

impl VectorSet {
    const fn new() -> Self {
        Self([0; NUM_VECTORS / 64])
    }

    fn contains(&self, vector: u32) -> bool {
        self.0[vector as usize / 64] & (1 << (vector % 64)) != 0
    }

    fn insert(&mut self, vector: u32) {
        self.0[vector as usize / 64] |= 1 << (vector % 64);
    }

    fn remove(&mut self, vector: u32) {
        self.0[vector as usize / 64] &= !(1 << (vector % 64));
    }

    fn clear(&mut self) {
        self.0 = [0; NUM_VECTORS / 64];
    }
}

/// A raised interrupt waiting for a list register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuedInterrupt {
    pub vector: u32,
    pub kind: InterruptType,
}

impl QueuedInterrupt {
    fn bucket(&self) -> usize {
        if self.vector < NUM_LOCAL_VECTORS { 0 } else { 1 }
    }
}

struct QueueInner {
    queued: VectorSet,
    buckets: [VecDeque<QueuedInterrupt>; NUM_BUCKETS],
}

/// Priority queue of raised interrupts that have no list register yet.
///
/// Local interrupts (SGI/PPI) always leave before peripheral ones; inside a
/// priority bucket interrupts leave in the order they were raised. A vector
/// raised again while still queued keeps its original place.
pub struct InterruptQueue {
    inner: Mutex<QueueInner>,
}

impl InterruptQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queued: VectorSet::new(),
                buckets: [VecDeque::new(), VecDeque::new()],
            }),
        }
    }

    /// Raises `vector`.
    ///
    /// # Returns
    ///
    /// * `bool` - Whether the vector was newly queued.
    pub fn push(&self, vector: u32, kind: InterruptType) -> AxResult<bool> {
        if vector as usize >= NUM_VECTORS {
            return ax_err!(InvalidInput, format!("vector {} out of range", vector));
        }
        let mut inner = self.inner.lock();
        if inner.queued.contains(vector) {
            return Ok(false);
        }
        let irq = QueuedInterrupt { vector, kind };
        inner.queued.insert(vector);
        inner.buckets[irq.bucket()].push_back(irq);
        Ok(true)
    }

    /// Removes the highest priority interrupt.
    pub fn pop(&self) -> Option<QueuedInterrupt> {
        let mut inner = self.inner.lock();
        let irq = inner.buckets.iter_mut().find_map(|bucket| bucket.pop_front())?;
        inner.queued.remove(irq.vector);
        Some(irq)
    }

    /// Puts back an interrupt that could not be placed, ahead of its bucket.
    fn unpop(&self, irq: QueuedInterrupt) {
        let mut inner = self.inner.lock();
        if inner.queued.contains(irq.vector) {
            return;
        }
        inner.queued.insert(irq.vector);
        inner.buckets[irq.bucket()].push_front(irq);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buckets.iter().all(|bucket| bucket.is_empty())
    }

    pub fn contains(&self, vector: u32) -> bool {
        (vector as usize) < NUM_VECTORS && self.inner.lock().queued.contains(vector)
    }
}

impl Default for InterruptQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Virtual interface control registers, in the layout exchanged with the
/// controller driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GichRegs {
    pub hcr: u64,
    pub vmcr: u64,
    pub apr: [u64; 4],
    /// One entry per implemented list register.
    pub lr: ArrayVec<u64, MAX_LIST_REGS>,
}

/// Per-vCPU virtual interface state.
pub struct GichState {
    regs: GichRegs,
    /// Vectors that currently occupy a list register.
    in_lr: VectorSet,
    priority_bits: u8,
}

impl GichState {
    /// Creates the state for a controller with `num_lrs` list registers.
    pub fn new(num_lrs: usize, priority_bits: u8) -> AxResult<Self> {
        if num_lrs == 0 || num_lrs > MAX_LIST_REGS {
            return ax_err!(
                Unsupported,
                format!("{} list registers is not supported", num_lrs)
            );
        }
        let mut regs = GichRegs {
            hcr: GICH_HCR_EN,
            ..Default::default()
        };
        regs.lr.extend(core::iter::repeat(0).take(num_lrs));
        Ok(Self {
            regs,
            in_lr: VectorSet::new(),
            priority_bits,
        })
    }

    pub fn regs(&self) -> &GichRegs {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut GichRegs {
        &mut self.regs
    }

    pub fn num_lrs(&self) -> usize {
        self.regs.lr.len()
    }

    /// Number of list registers holding an interrupt.
    pub fn lrs_in_use(&self) -> usize {
        self.regs
            .lr
            .iter()
            .filter(|&&lr| LrState::of(lr) != LrState::Invalid)
            .count()
    }

    pub fn any_lr_in_use(&self) -> bool {
        self.lrs_in_use() > 0
    }

    /// Whether `vector` currently occupies a list register.
    pub fn has_list_register(&self, vector: u32) -> bool {
        (vector as usize) < NUM_VECTORS && self.in_lr.contains(vector)
    }

    /// Whether an underflow maintenance interrupt is requested.
    pub fn underflow_requested(&self) -> bool {
        self.regs.hcr & GICH_HCR_UIE != 0
    }

    /// Rebuilds the occupancy bitmap from the list registers read back after
    /// an exit. Registers the guest has completed are returned to the free
    /// pool.
    pub fn track_all_list_registers(&mut self) {
        self.in_lr.clear();
        for lr in self.regs.lr.iter_mut() {
            if LrState::of(*lr) == LrState::Invalid {
                *lr = 0;
            } else {
                self.in_lr.insert(lr_vector(*lr));
            }
        }
    }

    fn find_lr(&self, vector: u32) -> Option<usize> {
        self.regs
            .lr
            .iter()
            .position(|&lr| LrState::of(lr) != LrState::Invalid && lr_vector(lr) == vector)
    }

    fn free_lr(&self) -> Option<usize> {
        self.regs
            .lr
            .iter()
            .position(|&lr| LrState::of(lr) == LrState::Invalid)
    }

    /// Moves queued interrupts into list registers, highest priority first.
    ///
    /// A vector already held active in a list register becomes pending and
    /// active, so both the in-service instance and the new raise are kept.
    /// A vector already pending is not duplicated.
    pub fn refill(&mut self, queue: &InterruptQueue) {
        while let Some(irq) = queue.pop() {
            if self.in_lr.contains(irq.vector) {
                if let Some(idx) = self.find_lr(irq.vector) {
                    let lr = self.regs.lr[idx];
                    if LrState::of(lr) == LrState::Active {
                        self.regs.lr[idx] = ICH_LR::STATE
                            .val(LrState::PendingActive as u64)
                            .modify(lr);
                    }
                    continue;
                }
                self.in_lr.remove(irq.vector);
            }
            match self.free_lr() {
                Some(idx) => {
                    let priority = vector_priority(irq.vector, self.priority_bits);
                    self.regs.lr[idx] = encode_lr(irq.vector, priority, irq.kind, LrState::Pending);
                    self.in_lr.insert(irq.vector);
                }
                None => {
                    queue.unpop(irq);
                    break;
                }
            }
        }

        if self.lrs_in_use() > 1 && !queue.is_empty() {
            self.regs.hcr |= GICH_HCR_UIE;
        } else {
            self.regs.hcr &= !GICH_HCR_UIE;
        }
    }
}
