//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Error types shared by every layer of the crate.
//!
//! Errors come in two flavors. Configuration errors (an unsupported shape, a
//! mismatched signature, a bad index list) are returned to the caller and leave
//! everything untouched. Allocation failures and template corruption mean the
//! process can no longer make foreign calls at all, and go through [`fatal`].

use crate::abi::Platform;
use crate::codegen::{Hole, TemplateId};
use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while configuring or generating trampolines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operating system refused to hand out executable memory.
    #[error("unable to allocate {size} bytes of executable memory: {source}")]
    ExecAllocation {
        /// The number of bytes requested
        size: usize,
        /// The underlying OS error
        #[source]
        source: io::Error,
    },

    /// The patch scan ran off the end of the image looking for a hole.
    #[error("hole `{0:?}` was not found in the template image")]
    HoleNotFound(Hole),

    /// The scan found a sentinel, but not where the template recorded the hole.
    #[error("hole `{hole:?}` found at offset {found}, template recorded it at {expected}")]
    HoleMisplaced {
        /// The hole being patched
        hole: Hole,
        /// Offset the scan found a sentinel at
        found: usize,
        /// Offset recorded when the template was assembled
        expected: usize,
    },

    /// A label-relative branch could not be encoded in the space reserved for it.
    #[error("branch at offset {at} cannot reach its label ({distance} bytes away)")]
    BranchOutOfRange {
        /// Offset of the displacement being fixed up
        at: usize,
        /// The distance that did not fit
        distance: i64,
    },

    /// A branch refers to a label that was never bound.
    #[error("branch at offset {at} refers to a label that was never bound")]
    UnboundLabel {
        /// Offset of the displacement being fixed up
        at: usize,
    },

    /// No template bucket can express the requested shape.
    #[error("template `{template:?}` cannot express {ints} int, {floats} float and {mems} memory arguments")]
    UnsupportedShape {
        /// The template the shape was requested from
        template: TemplateId,
        /// Integer register arguments requested
        ints: u64,
        /// Floating-point register arguments requested
        floats: u64,
        /// Memory arguments requested
        mems: u64,
    },

    /// The descriptor targets a platform the template was not built for.
    #[error("template `{template:?}` cannot be used with {platform:?} descriptors")]
    TemplateMismatch {
        /// The template requested
        template: TemplateId,
        /// The platform of the descriptor
        platform: Platform,
    },

    /// The index list is not a permutation of `0..total_args`.
    #[error("index list is not a permutation of 0..{len}")]
    InvalidIndexList {
        /// Length of the list
        len: usize,
    },

    /// The argument counts do not agree with the index list.
    #[error("argument counts sum to {counted}, but the index list holds {listed} entries")]
    CountMismatch {
        /// `num_int_args + num_float_args + num_mem_args`
        counted: u64,
        /// Length of the index list
        listed: usize,
    },

    /// The float mask disagrees with the register arguments it describes.
    #[error("float mask {mask:#b} does not describe {floats} float registers out of {registers}")]
    InvalidFloatMask {
        /// The mask
        mask: u64,
        /// Number of float register arguments
        floats: u64,
        /// Number of register positions in use
        registers: u64,
    },

    /// A call path's canonical buffer cannot hold every argument of a shape.
    #[error("argument buffer holds {capacity} values, but the shape needs {needed}")]
    BufferTooSmall {
        /// Buffer capacity, in 8-byte values
        capacity: usize,
        /// Arguments in the shape
        needed: usize,
    },

    /// A function pointer type does not classify the same way as the descriptor.
    #[error("function type `{ty}` does not match the staged descriptor")]
    SignatureMismatch {
        /// Name of the offending type
        ty: &'static str,
    },

    /// The stub was generated against another call path's staging storage.
    #[error("stub was instantiated for a different call path")]
    ForeignStub,

    /// The stub bakes in a different shape than the staged descriptor describes.
    #[error("stub was instantiated for a different shape than the staged descriptor")]
    StubMismatch,
}

/// Reports an unrecoverable error and terminates the process.
///
/// Used for failures that leave the process unable to make foreign calls safely:
/// running out of executable memory, or a template whose holes are not where they
/// were recorded.
#[cold]
pub fn fatal(err: &Error) -> ! {
    log::error!("fatal: {err}");
    eprintln!("ferry: fatal error: {err}");

    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_include_context() {
        let err = Error::BufferTooSmall {
            capacity: 4,
            needed: 9,
        };

        assert_eq!(
            err.to_string(),
            "argument buffer holds 4 values, but the shape needs 9"
        );

        let err = Error::HoleMisplaced {
            hole: Hole::ExternIndex,
            found: 10,
            expected: 42,
        };

        assert!(err.to_string().contains("ExternIndex"));
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn allocation_error_keeps_source() {
        use std::error::Error as _;

        let err = Error::ExecAllocation {
            size: 4096,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        };

        assert!(err.source().is_some());
    }
}
