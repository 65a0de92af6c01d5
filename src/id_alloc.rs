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

use axerrno::{AxResult, ax_err};

const WORDS: usize = 256 / 64;

/// Allocator for 8-bit identifiers (VMIDs and VPIDs).
///
/// Ids are handed out lowest-free-first from the inclusive range
/// `[min, max]`. Exhaustion is reported as an error, never by reusing a live id.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    bitmap: [u64; WORDS],
    min: u8,
    max: u8,
}

impl IdAllocator {
    /// Creates an allocator over `[min, max]`.
    pub const fn new(min: u8, max: u8) -> Self {
        Self {
            bitmap: [0; WORDS],
            min,
            max,
        }
    }

    /// Allocates the lowest free id.
    pub fn alloc(&mut self) -> AxResult<u8> {
        for id in self.min..=self.max {
            if !self.is_allocated(id) {
                self.bitmap[id as usize / 64] |= 1 << (id % 64);
                return Ok(id);
            }
        }
        ax_err!(NoMemory, "id space exhausted")
    }

    /// Returns `id` to the allocator.
    pub fn free(&mut self, id: u8) -> AxResult {
        if id < self.min || id > self.max || !self.is_allocated(id) {
            return ax_err!(InvalidInput, "id is not allocated");
        }
        self.bitmap[id as usize / 64] &= !(1 << (id % 64));
        Ok(())
    }

    pub fn is_allocated(&self, id: u8) -> bool {
        self.bitmap[id as usize / 64] & (1 << (id % 64)) != 0
    }

    /// Number of ids currently handed out.
    pub fn allocated(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }
}
