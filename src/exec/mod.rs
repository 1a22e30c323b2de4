//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Executable memory.
//!
//! Generated trampolines live in memory that is readable, writable and executable
//! at once. Regions come straight from the OS (`mmap` or `VirtualAlloc`) and are
//! never unmapped during normal operation. Individual code objects are handed back
//! to the [`ExecArena`] that made them once their owner knows they are dead, and the
//! space is reused for later code of the same size.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

use crate::error::{fatal, Error, Result};
use std::collections::HashMap;
use std::ptr::NonNull;

/// Gets the page size of the host.
pub fn page_size() -> usize {
    os::page_size()
}

/// A contiguous block of read+write+execute memory.
#[derive(Debug)]
pub struct ExecRegion {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is plain memory, owning it on another thread is fine
unsafe impl Send for ExecRegion {}

impl ExecRegion {
    /// Maps a new region of at least `size` bytes, rounded up to the page size.
    pub fn try_new(size: usize) -> Result<Self> {
        let page = page_size();
        let size = size.max(1).div_ceil(page) * page;
        let base = os::map(size).map_err(|source| Error::ExecAllocation { size, source })?;

        log::info!(
            "mapped {size} bytes of executable memory at {:p}",
            base.as_ptr()
        );

        Ok(Self { base, size })
    }

    /// The first byte of the region.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The size of the region, in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the region to the operating system.
    ///
    /// # Safety
    ///
    /// Nothing may execute, read or write any part of the region afterwards.
    pub unsafe fn release(self) {
        os::unmap(self.base, self.size)
    }
}

/// Allocates `size` bytes of read+write+execute memory.
///
/// This never returns an invalid region. If the OS refuses, the failure is reported
/// and the process is terminated.
pub fn allocate_exec_region(size: usize) -> NonNull<u8> {
    match ExecRegion::try_new(size) {
        Ok(region) => region.base(),
        Err(e) => fatal(&e),
    }
}

struct ArenaRegion {
    region: ExecRegion,
    used: usize,
}

/// A bump allocator that packs many small code objects into shared regions.
///
/// Every allocation is aligned to 16 bytes. Requests that do not fit into the
/// most recent region get a region of their own (at least the arena's region size).
///
/// Released allocations go on a free list bucketed by their size rounded up to the
/// alignment, and a later write of the same rounded size takes the most recently
/// released slot before bumping. Regions themselves are never unmapped.
pub struct ExecArena {
    regions: Vec<ArenaRegion>,
    region_size: usize,
    free: HashMap<usize, Vec<usize>, ahash::RandomState>,
    live: usize,
}

impl ExecArena {
    /// Default size of each region the arena maps (64 KiB).
    pub const DEFAULT_REGION_SIZE: usize = 64 * 1024;

    /// Alignment of every allocation.
    pub const ALIGNMENT: usize = 16;

    /// Creates an empty arena with the default region size.
    pub fn new() -> Self {
        Self::with_region_size(Self::DEFAULT_REGION_SIZE)
    }

    /// Creates an empty arena that maps `region_size` bytes at a time.
    pub fn with_region_size(region_size: usize) -> Self {
        Self {
            regions: Vec::new(),
            region_size: region_size.max(Self::ALIGNMENT),
            free: HashMap::default(),
            live: 0,
        }
    }

    #[inline]
    fn slot_size(len: usize) -> usize {
        len.next_multiple_of(Self::ALIGNMENT)
    }

    fn reuse(&mut self, len: usize) -> Option<NonNull<u8>> {
        let address = self.free.get_mut(&Self::slot_size(len))?.pop()?;

        NonNull::new(address as *mut u8)
    }

    fn bump(&mut self, len: usize) -> Option<NonNull<u8>> {
        let current = self.regions.last_mut()?;
        let start = current.used.next_multiple_of(Self::ALIGNMENT);

        if start + len > current.region.size() {
            return None;
        }

        current.used = start + len;

        // SAFETY: `start + len` is in bounds of the region
        let ptr = unsafe { current.region.base().as_ptr().add(start) };

        NonNull::new(ptr)
    }

    /// Copies `bytes` into executable memory and returns where they went.
    pub fn try_write(&mut self, bytes: &[u8]) -> Result<NonNull<u8>> {
        let dest = match self.reuse(bytes.len()).or_else(|| self.bump(bytes.len())) {
            Some(dest) => dest,
            None => {
                let region = ExecRegion::try_new(self.region_size.max(bytes.len()))?;

                self.regions.push(ArenaRegion { region, used: 0 });

                match self.bump(bytes.len()) {
                    Some(dest) => dest,
                    None => unreachable!("fresh region cannot hold {} bytes", bytes.len()),
                }
            }
        };

        // SAFETY: `dest` was just carved out of a region we own, and is `bytes.len()` long
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest.as_ptr(), bytes.len());
        }

        self.live += bytes.len();

        Ok(dest)
    }

    /// Hands an allocation back to the arena so its slot can be reused.
    ///
    /// The released bytes are overwritten with `int3`, so a stale call traps instead
    /// of running whatever gets written there next.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Self::try_write`] or [`Self::write`] on this
    /// arena for exactly `len` bytes, must not have been released already, and
    /// nothing may execute or read the code afterwards.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>, len: usize) {
        let slot = Self::slot_size(len);

        let address = ptr.as_ptr() as usize;

        ptr.as_ptr().write_bytes(0xCC, slot);

        self.free.entry(slot).or_default().push(address);
        self.live -= len;
    }

    /// Same as [`Self::try_write`], but running out of executable memory is fatal.
    pub fn write(&mut self, bytes: &[u8]) -> NonNull<u8> {
        match self.try_write(bytes) {
            Ok(ptr) => ptr,
            Err(e) => fatal(&e),
        }
    }

    /// Gets `(total_mapped, total_used)`, in bytes.
    ///
    /// Released allocations do not count as used.
    pub fn stats(&self) -> (usize, usize) {
        let mapped = self.regions.iter().map(|r| r.region.size()).sum();

        (mapped, self.live)
    }
}

impl Default for ExecArena {
    fn default() -> Self {
        Self::new()
    }
}
