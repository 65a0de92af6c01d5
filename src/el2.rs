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

//! Provisioning of the EL2 address space and the per-CPU EL2 stacks.
//!
//! EL2 runs with its own stage-1 translation regime. The table built here
//! identity maps every memory region reported by the kernel: code read +
//! execute, everything else read + write and never executable.

use alloc::vec::Vec;
use core::marker::PhantomData;

use axerrno::{AxResult, ax_err, ax_err_type};
use bitflags::bitflags;

use crate::{
    addr::{HostPhysAddr, PAGE_SIZE_4K, is_aligned_4k},
    hal::{El2Hal, MemRegionKind},
};

/// Pages of EL2 stack per CPU.
pub const EL2_STACK_PAGES: usize = 4;

const ENTRIES_PER_TABLE: usize = 512;
/// The leaf level of a 4K-granule, 48-bit walk.
const LEAF_LEVEL: usize = 3;
const DESC_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

bitflags! {
    /// Bits of an EL2 stage-1 translation descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DescriptorFlags: u64 {
        const VALID = 1 << 0;
        /// Table descriptor at levels 0-2, page descriptor at level 3.
        const NON_BLOCK = 1 << 1;
        /// AP[2]: read-only.
        const READ_ONLY = 1 << 7;
        const INNER_SHAREABLE = 0b11 << 8;
        /// Access flag.
        const AF = 1 << 10;
        /// Execute never.
        const XN = 1 << 54;
    }
}

impl DescriptorFlags {
    fn for_region(kind: MemRegionKind) -> Self {
        let common = Self::VALID | Self::INNER_SHAREABLE | Self::AF;
        match kind {
            MemRegionKind::Code => common | Self::READ_ONLY,
            MemRegionKind::Data => common | Self::XN,
        }
    }
}

const fn level_shift(level: usize) -> usize {
    39 - 9 * level
}

const fn level_size(level: usize) -> usize {
    1 << level_shift(level)
}

const fn table_index(addr: usize, level: usize) -> usize {
    (addr >> level_shift(level)) & (ENTRIES_PER_TABLE - 1)
}

/// A leaf mapping found by [`TranslationTable::query`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub paddr: HostPhysAddr,
    pub flags: DescriptorFlags,
    pub level: usize,
}

/// The EL2 translation table.
///
/// Must be [`reset`](TranslationTable::reset) before it is dropped; dropping
/// does so if the owner did not.
pub struct TranslationTable<H: El2Hal> {
    root: Option<HostPhysAddr>,
    /// Every table page, root included.
    pages: Vec<HostPhysAddr>,
    _hal: PhantomData<H>,
}

impl<H: El2Hal> TranslationTable<H> {
    /// Allocates an empty table.
    pub fn new() -> AxResult<Self> {
        let mut table = Self {
            root: None,
            pages: Vec::new(),
            _hal: PhantomData,
        };
        table.root = Some(table.alloc_table()?);
        Ok(table)
    }

    /// Builds the identity map of every region reported by the kernel.
    pub fn map_identity(&mut self) -> AxResult {
        for region in H::memory_regions() {
            trace!(
                "el2: mapping {:?} {:#x} bytes as {:?}",
                region.base,
                region.size,
                region.kind
            );
            self.map(region.base, region.size, DescriptorFlags::for_region(region.kind))?;
        }
        Ok(())
    }

    pub fn root_paddr(&self) -> Option<HostPhysAddr> {
        self.root
    }

    /// Identity maps `[paddr, paddr + size)` with the largest blocks the
    /// alignment allows.
    pub fn map(&mut self, paddr: HostPhysAddr, size: usize, flags: DescriptorFlags) -> AxResult {
        if !is_aligned_4k(paddr.as_usize()) || !is_aligned_4k(size) {
            return ax_err!(InvalidInput, "unaligned EL2 mapping");
        }
        let mut addr = paddr.as_usize();
        let end = addr
            .checked_add(size)
            .ok_or_else(|| ax_err_type!(InvalidInput, "EL2 mapping overflows"))?;
        while addr < end {
            let level = (1..=LEAF_LEVEL)
                .find(|&level| addr % level_size(level) == 0 && end - addr >= level_size(level))
                .unwrap_or(LEAF_LEVEL);
            self.map_one(addr, level, flags)?;
            addr += level_size(level);
        }
        Ok(())
    }

    fn map_one(&mut self, addr: usize, level: usize, flags: DescriptorFlags) -> AxResult {
        let mut table = self.root_or_err()?;
        for walk_level in 0..level {
            let idx = table_index(addr, walk_level);
            let entry = Self::entries(table)[idx];
            let entry_flags = DescriptorFlags::from_bits_retain(entry);
            table = if !entry_flags.contains(DescriptorFlags::VALID) {
                let next = self.alloc_table()?;
                Self::entries(table)[idx] = next.as_usize() as u64
                    | (DescriptorFlags::VALID | DescriptorFlags::NON_BLOCK).bits();
                next
            } else if entry_flags.contains(DescriptorFlags::NON_BLOCK) {
                HostPhysAddr::from_usize((entry & DESC_ADDR_MASK) as usize)
            } else {
                return ax_err!(AlreadyExists, "EL2 range already mapped by a block");
            };
        }

        let slot = &mut Self::entries(table)[table_index(addr, level)];
        if *slot & DescriptorFlags::VALID.bits() != 0 {
            return ax_err!(AlreadyExists, "EL2 range already mapped");
        }
        let mut desc = flags;
        if level == LEAF_LEVEL {
            desc |= DescriptorFlags::NON_BLOCK;
        }
        *slot = addr as u64 | desc.bits();
        Ok(())
    }

    /// Looks up the leaf descriptor covering `vaddr`.
    pub fn query(&self, vaddr: usize) -> Option<Mapping> {
        let mut table = self.root?;
        for level in 0..=LEAF_LEVEL {
            let entry = Self::entries(table)[table_index(vaddr, level)];
            let flags = DescriptorFlags::from_bits_retain(entry & !DESC_ADDR_MASK);
            if !flags.contains(DescriptorFlags::VALID) {
                return None;
            }
            let next = (entry & DESC_ADDR_MASK) as usize;
            if level == LEAF_LEVEL || !flags.contains(DescriptorFlags::NON_BLOCK) {
                let offset = vaddr & (level_size(level) - 1);
                return Some(Mapping {
                    paddr: HostPhysAddr::from_usize(next + offset),
                    flags,
                    level,
                });
            }
            table = HostPhysAddr::from_usize(next);
        }
        None
    }

    /// Unmaps everything and frees every table page.
    pub fn reset(&mut self) {
        for page in self.pages.drain(..) {
            H::dealloc_pages(page, 1);
        }
        self.root = None;
    }

    fn root_or_err(&self) -> AxResult<HostPhysAddr> {
        self.root
            .ok_or_else(|| ax_err_type!(BadState, "EL2 translation table was reset"))
    }

    fn alloc_table(&mut self) -> AxResult<HostPhysAddr> {
        let page = H::alloc_pages(1)
            .ok_or_else(|| ax_err_type!(NoMemory, "no page for EL2 translation table"))?;
        Self::entries(page).fill(0);
        self.pages.push(page);
        Ok(page)
    }

    #[allow(clippy::mut_from_ref)]
    fn entries<'a>(table: HostPhysAddr) -> &'a mut [u64; ENTRIES_PER_TABLE] {
        // SAFETY: `table` is a page owned by this translation table, and the
        // kernel maps it at `phys_to_virt(table)`.
        unsafe { &mut *(H::phys_to_virt(table).as_usize() as *mut [u64; ENTRIES_PER_TABLE]) }
    }
}

impl<H: El2Hal> Drop for TranslationTable<H> {
    fn drop(&mut self) {
        self.reset();
    }
}

/// The stack a CPU uses while executing at EL2.
pub struct Stack<H: El2Hal> {
    base: HostPhysAddr,
    _hal: PhantomData<H>,
}

impl<H: El2Hal> Stack<H> {
    pub fn alloc() -> AxResult<Self> {
        let base = H::alloc_pages(EL2_STACK_PAGES)
            .ok_or_else(|| ax_err_type!(NoMemory, "no pages for EL2 stack"))?;
        Ok(Self {
            base,
            _hal: PhantomData,
        })
    }

    pub fn base(&self) -> HostPhysAddr {
        self.base
    }

    /// Initial stack pointer; the stack grows down from here.
    pub fn top(&self) -> HostPhysAddr {
        HostPhysAddr::from_usize(self.base.as_usize() + EL2_STACK_PAGES * PAGE_SIZE_4K)
    }
}

impl<H: El2Hal> Drop for Stack<H> {
    fn drop(&mut self) {
        H::dealloc_pages(self.base, EL2_STACK_PAGES);
    }
}
