//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! The configuration record for a single foreign call shape.
//!
//! A [`Descriptor`] is the validated, owned description of a call: how its arguments
//! classify, which target it routes to and what kind of value comes back. When a call
//! is actually made, the descriptor is published into a [`StagedDescriptor`], a flat
//! `#[repr(C)]` block of 64-bit fields that generated code reads and writes at fixed
//! offsets.

use crate::abi::{classify, ArgType, Platform, ReturnType, Shape};
use crate::error::{Error, Result};
use smallbitvec::sbvec;
use smallvec::SmallVec;
use static_assertions::{assert_eq_size, const_assert_eq};
use std::fmt;
use std::mem;

/// A routine that picks a native function by `extern_index` and calls it with the
/// canonical argument buffer.
///
/// `args` points at the call path's canonical buffer, holding every argument in
/// logical order as a raw 64-bit value (floats by bit pattern, `f32` in the low half).
pub type Dispatcher = unsafe extern "C" fn(args: *mut u64, extern_index: u64) -> u64;

/// What the interposing routine invokes once the arguments have been gathered.
#[derive(Copy, Clone)]
pub enum Entry {
    /// Call a dispatcher with the canonical buffer and the extern index.
    Dispatcher(Dispatcher),
    /// Call a native function directly. The gathered arguments are placed back into
    /// the registers and stack slots the descriptor's platform expects.
    Direct(usize),
}

impl Entry {
    /// The raw address of the routine.
    pub fn address(self) -> u64 {
        match self {
            Self::Dispatcher(f) => f as *const () as usize as u64,
            Self::Direct(addr) => addr as u64,
        }
    }

    /// The kind tag stored in [`StagedDescriptor::entry_kind`].
    pub fn kind(self) -> u64 {
        match self {
            Self::Dispatcher(_) => StagedDescriptor::ENTRY_DISPATCHER,
            Self::Direct(_) => StagedDescriptor::ENTRY_DIRECT,
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatcher(_) => write!(f, "Dispatcher({:#x})", self.address()),
            Self::Direct(_) => write!(f, "Direct({:#x})", self.address()),
        }
    }
}

/// The validated description of one foreign call shape.
#[derive(Clone, Debug)]
pub struct Descriptor {
    platform: Platform,
    shape: Shape,
    extern_index: u64,
    entry: Entry,
    index_list: SmallVec<[u64; 8]>,
    return_type: ReturnType,
}

impl Descriptor {
    /// Classifies `args` under `platform` and builds a descriptor from the result.
    pub fn new(
        platform: Platform,
        args: &[ArgType],
        return_type: ReturnType,
        extern_index: u64,
        entry: Entry,
    ) -> Result<Self> {
        let classification = classify(args, platform);
        let desc = Self {
            platform,
            shape: classification.shape,
            extern_index,
            entry,
            index_list: classification.index_list,
            return_type,
        };

        desc.validate()?;

        Ok(desc)
    }

    /// Builds a descriptor from an explicit shape and index list, as a runtime that
    /// classifies arguments itself would.
    pub fn from_parts(
        platform: Platform,
        shape: Shape,
        index_list: &[u64],
        return_type: ReturnType,
        extern_index: u64,
        entry: Entry,
    ) -> Result<Self> {
        let desc = Self {
            platform,
            shape,
            extern_index,
            entry,
            index_list: SmallVec::from_slice(index_list),
            return_type,
        };

        desc.validate()?;

        Ok(desc)
    }

    /// Checks every invariant of the descriptor.
    ///
    /// - The platform must be able to produce the shape
    /// - The counts must sum to the length of the index list
    /// - The index list must be a permutation of `0..total_args`
    pub fn validate(&self) -> Result<()> {
        self.platform.convention().validate(self.shape)?;

        let len = self.index_list.len();

        if self.shape.total() != len as u64 {
            return Err(Error::CountMismatch {
                counted: self.shape.total(),
                listed: len,
            });
        }

        let mut seen = sbvec![false; len];

        for &index in self.index_list.iter() {
            let index = index as usize;

            match seen.get(index) {
                Some(false) => seen.set(index, true),
                _ => return Err(Error::InvalidIndexList { len }),
            }
        }

        Ok(())
    }

    /// Replaces the entry point, keeping everything else.
    pub fn with_entry(mut self, entry: Entry) -> Self {
        self.entry = entry;
        self
    }

    /// The platform the descriptor was classified for
    #[inline]
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// The argument counts (and float mask)
    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Arguments passed in integer registers
    #[inline]
    pub fn num_int_args(&self) -> u64 {
        self.shape.num_int_args
    }

    /// Arguments passed in vector registers
    #[inline]
    pub fn num_float_args(&self) -> u64 {
        self.shape.num_float_args
    }

    /// Arguments passed on the stack
    #[inline]
    pub fn num_mem_args(&self) -> u64 {
        self.shape.num_mem_args
    }

    /// Which register positions hold floats (Windows x64 only)
    #[inline]
    pub fn float_mask(&self) -> u64 {
        self.shape.float_mask
    }

    /// The total number of logical arguments
    #[inline]
    pub fn total_args(&self) -> usize {
        self.index_list.len()
    }

    /// The opaque target selector handed to a dispatcher
    #[inline]
    pub fn extern_index(&self) -> u64 {
        self.extern_index
    }

    /// What gets called once arguments are gathered
    #[inline]
    pub fn entry(&self) -> Entry {
        self.entry
    }

    /// Hardware slot to logical position mapping
    #[inline]
    pub fn index_list(&self) -> &[u64] {
        &self.index_list
    }

    /// The kind of value the target returns
    #[inline]
    pub fn return_type(&self) -> ReturnType {
        self.return_type
    }
}

/// The runtime-published form of a descriptor, read by generated code.
///
/// Every field is a raw 64-bit value at a fixed offset. Stubs store their patched
/// shape into the first few fields right before jumping into the interposing
/// routine, and the interposing routine reads the rest.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StagedDescriptor {
    /// Arguments passed in integer registers
    pub num_int_args: u64,
    /// Arguments passed in vector registers
    pub num_float_args: u64,
    /// Arguments passed on the stack
    pub num_mem_args: u64,
    /// Opaque target selector
    pub extern_index: u64,
    /// Address of the dispatcher or native function
    pub entry_point: u64,
    /// Address of the hardware-slot to logical-position mapping
    pub index_list: u64,
    /// Address of the canonical argument buffer
    pub args_list: u64,
    /// A [`ReturnType`] tag
    pub return_type: u64,
    /// Which register positions hold floats (Windows x64 only)
    pub float_mask: u64,
    /// [`StagedDescriptor::ENTRY_DISPATCHER`] or [`StagedDescriptor::ENTRY_DIRECT`]
    pub entry_kind: u64,
    /// Capacity of the canonical buffer, in 8-byte values
    pub args_capacity: u64,
    /// Address of the call-out routine used for direct entries
    pub call_out: u64,
}

impl StagedDescriptor {
    /// `entry_point` is a [`Dispatcher`].
    pub const ENTRY_DISPATCHER: u64 = 0;

    /// `entry_point` is a native function called with the platform's convention.
    pub const ENTRY_DIRECT: u64 = 1;

    /// Offset of `num_int_args`, as an x86-64 displacement.
    pub const NUM_INT_ARGS: i32 = mem::offset_of!(Self, num_int_args) as i32;

    /// Offset of `num_float_args`, as an x86-64 displacement.
    pub const NUM_FLOAT_ARGS: i32 = mem::offset_of!(Self, num_float_args) as i32;

    /// Offset of `num_mem_args`, as an x86-64 displacement.
    pub const NUM_MEM_ARGS: i32 = mem::offset_of!(Self, num_mem_args) as i32;

    /// Offset of `extern_index`, as an x86-64 displacement.
    pub const EXTERN_INDEX: i32 = mem::offset_of!(Self, extern_index) as i32;

    /// Offset of `index_list`, as an x86-64 displacement.
    pub const INDEX_LIST: i32 = mem::offset_of!(Self, index_list) as i32;

    /// Offset of `return_type`, as an x86-64 displacement.
    pub const RETURN_TYPE: i32 = mem::offset_of!(Self, return_type) as i32;

    /// Offset of `float_mask`, as an x86-64 displacement.
    pub const FLOAT_MASK: i32 = mem::offset_of!(Self, float_mask) as i32;

    /// Reads the shape last published into the descriptor.
    #[inline]
    pub fn shape(&self) -> Shape {
        Shape {
            num_int_args: self.num_int_args,
            num_float_args: self.num_float_args,
            num_mem_args: self.num_mem_args,
            float_mask: self.float_mask,
        }
    }

    /// Total number of arguments in the published shape.
    #[inline]
    pub fn total_args(&self) -> usize {
        self.shape().total() as usize
    }
}

assert_eq_size!(StagedDescriptor, [u64; 12]);
const_assert_eq!(mem::offset_of!(StagedDescriptor, num_int_args), 0);
const_assert_eq!(mem::offset_of!(StagedDescriptor, num_float_args), 8);
const_assert_eq!(mem::offset_of!(StagedDescriptor, num_mem_args), 16);
const_assert_eq!(mem::offset_of!(StagedDescriptor, extern_index), 24);
const_assert_eq!(mem::offset_of!(StagedDescriptor, entry_point), 32);
const_assert_eq!(mem::offset_of!(StagedDescriptor, index_list), 40);
const_assert_eq!(mem::offset_of!(StagedDescriptor, args_list), 48);
const_assert_eq!(mem::offset_of!(StagedDescriptor, return_type), 56);
const_assert_eq!(mem::offset_of!(StagedDescriptor, float_mask), 64);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ArgType::{Float as F, Int as I};

    unsafe extern "C" fn zero(_: *mut u64, _: u64) -> u64 {
        0
    }

    fn entry() -> Entry {
        Entry::Dispatcher(zero)
    }

    #[test]
    fn new_classifies() {
        let desc =
            Descriptor::new(Platform::SystemV, &[F, I], ReturnType::Int64, 7, entry()).unwrap();

        assert_eq!(desc.num_int_args(), 1);
        assert_eq!(desc.num_float_args(), 1);
        assert_eq!(desc.num_mem_args(), 0);
        assert_eq!(desc.index_list(), &[1, 0]);
        assert_eq!(desc.extern_index(), 7);
        assert_eq!(desc.entry().kind(), StagedDescriptor::ENTRY_DISPATCHER);
    }

    #[test]
    fn generated_index_lists_are_permutations() {
        let mut args = Vec::new();

        for n in 0..24 {
            args.push(if n % 3 == 0 { F } else { I });

            for platform in [Platform::SystemV, Platform::WindowsX64] {
                let desc = Descriptor::new(platform, &args, ReturnType::Void, 0, entry());

                match desc {
                    Ok(desc) => {
                        let mut sorted = desc.index_list().to_vec();

                        sorted.sort_unstable();

                        assert!(sorted.into_iter().eq(0..args.len() as u64));
                    }
                    Err(Error::UnsupportedShape { mems, .. }) => {
                        assert!(mems > crate::abi::MAX_MEM_ARGS)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let shape = Shape {
            num_int_args: 3,
            ..Shape::default()
        };

        let result = Descriptor::from_parts(
            Platform::SystemV,
            shape,
            &[0, 1, 1],
            ReturnType::Int64,
            0,
            entry(),
        );

        assert!(matches!(result, Err(Error::InvalidIndexList { len: 3 })));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let shape = Shape {
            num_int_args: 2,
            ..Shape::default()
        };

        let result = Descriptor::from_parts(
            Platform::SystemV,
            shape,
            &[0, 2],
            ReturnType::Int64,
            0,
            entry(),
        );

        assert!(matches!(result, Err(Error::InvalidIndexList { .. })));
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let shape = Shape {
            num_int_args: 2,
            num_float_args: 1,
            ..Shape::default()
        };

        let result = Descriptor::from_parts(
            Platform::SystemV,
            shape,
            &[0, 1],
            ReturnType::Int64,
            0,
            entry(),
        );

        assert!(matches!(
            result,
            Err(Error::CountMismatch {
                counted: 3,
                listed: 2
            })
        ));
    }

    #[test]
    fn explicit_parts_accept_any_permutation() {
        let shape = Shape {
            num_int_args: 2,
            num_float_args: 1,
            ..Shape::default()
        };

        let desc = Descriptor::from_parts(
            Platform::SystemV,
            shape,
            &[2, 0, 1],
            ReturnType::Float64,
            3,
            Entry::Direct(0x1000),
        )
        .unwrap();

        assert_eq!(desc.total_args(), 3);
        assert_eq!(desc.entry().address(), 0x1000);
        assert_eq!(desc.entry().kind(), StagedDescriptor::ENTRY_DIRECT);
    }

    #[test]
    fn staged_offsets() {
        assert_eq!(StagedDescriptor::NUM_INT_ARGS, 0);
        assert_eq!(StagedDescriptor::INDEX_LIST, 40);
        assert_eq!(StagedDescriptor::FLOAT_MASK, 64);

        let staged = StagedDescriptor {
            num_int_args: 1,
            num_float_args: 2,
            num_mem_args: 3,
            float_mask: 0,
            ..StagedDescriptor::default()
        };

        assert_eq!(staged.total_args(), 6);
    }
}
