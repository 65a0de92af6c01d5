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

//! Address types shared by the guest and host sides of the engine.

use memory_addr::{def_usize_addr, def_usize_addr_formatter};

pub use memory_addr::{PAGE_SIZE_4K, is_aligned_4k};

def_usize_addr! {
    /// A guest physical address (intermediate physical address on aarch64).
    pub type GuestPhysAddr;
    /// A host physical address.
    pub type HostPhysAddr;
    /// A host virtual address.
    pub type HostVirtAddr;
}

def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
    HostPhysAddr = "HPA:{}";
    HostVirtAddr = "HVA:{}";
}

/// Mask of the page-offset bits within a 4K page.
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE_4K - 1;
