//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Argument classification for the supported x86-64 calling conventions.
//!
//! Every logical argument of a foreign call is either an integer-class value
//! (integers, pointers, booleans) or a floating-point value. Where that argument
//! physically lands (an integer register, a vector register or a stack slot) is up
//! to the calling convention, and that placement is what the rest of the crate needs
//! to know. This module turns a list of [`ArgType`]s into a [`Classification`]:
//! the register/memory counts, and the mapping from hardware slots back to logical
//! argument positions.
//!
//! The rules are a strategy: a [`Platform`] picks its [`CallingConvention`] once,
//! and everything else asks the convention.

mod sysv;
mod win64;

pub use sysv::*;
pub use win64::*;

use crate::error::Result;
use smallvec::SmallVec;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// The most memory-passed arguments any shape may have.
pub const MAX_MEM_ARGS: u64 = 32;

/// The type class of a single logical argument.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ArgType {
    /// Integers, pointers and booleans
    Int,
    /// `f32` or `f64`
    Float,
}

/// Where a single logical argument was placed by a calling convention.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ArgClass {
    /// Passed in an integer register
    Int,
    /// Passed in a vector register
    Float,
    /// Passed on the stack
    Memory,
}

/// The kind of value a foreign function returns.
///
/// Integer kinds come back in `rax`, floating-point kinds in `xmm0`. The narrow
/// kinds are normalized so that the upper bits of the 64-bit result are well-defined.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ReturnType {
    /// A 64-bit integer or pointer
    Int64 = 0,
    /// An `f64`
    Float64 = 1,
    /// A 32-bit integer, sign-extended to 64 bits
    Int32 = 2,
    /// An `f32`, kept in the low 32 bits
    Float32 = 3,
    /// Nothing. The result is always zero.
    Void = 4,
}

impl ReturnType {
    /// The tag stored in a staged descriptor.
    #[inline]
    pub const fn tag(self) -> u64 {
        self as u64
    }

    /// Maps a tag back to a return type.
    pub const fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Int64),
            1 => Some(Self::Float64),
            2 => Some(Self::Int32),
            3 => Some(Self::Float32),
            4 => Some(Self::Void),
            _ => None,
        }
    }

    /// Whether the result travels in a vector register.
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float64 | Self::Float32)
    }

    /// Cleans up the raw 64-bit result of a call according to the return type.
    pub const fn normalize(self, raw: u64) -> u64 {
        match self {
            Self::Int64 | Self::Float64 => raw,
            Self::Int32 => raw as u32 as i32 as i64 as u64,
            Self::Float32 => raw & 0xFFFF_FFFF,
            Self::Void => 0,
        }
    }
}

/// The register/memory breakdown of a call shape.
///
/// `float_mask` is only meaningful for conventions that share a single positional
/// counter between integer and vector registers (Windows x64): bit `i` is set when
/// register position `i` holds a floating-point value. It is always zero for System V.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Shape {
    /// Arguments passed in integer registers
    pub num_int_args: u64,
    /// Arguments passed in vector registers
    pub num_float_args: u64,
    /// Arguments passed on the stack
    pub num_mem_args: u64,
    /// Which register positions are floating-point
    pub float_mask: u64,
}

impl Shape {
    /// The total number of logical arguments.
    #[inline]
    pub const fn total(self) -> u64 {
        self.num_int_args + self.num_float_args + self.num_mem_args
    }

    /// The number of arguments that are passed in some register.
    #[inline]
    pub const fn in_registers(self) -> u64 {
        self.num_int_args + self.num_float_args
    }
}

/// A physical location an argument can be passed in.
///
/// Register numbers are positions in the convention's argument register sequence,
/// not hardware encodings. `IntRegister(0)` is `rdi` under System V and `rcx` under
/// Windows x64.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum HardwareSlot {
    /// The n-th integer argument register
    IntRegister(usize),
    /// The n-th vector argument register
    FloatRegister(usize),
    /// The n-th stack argument slot of the caller's frame
    Stack(usize),
}

/// The result of classifying an argument list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    /// The counts (and float mask) of the arguments
    pub shape: Shape,
    /// `index_list[i]` is the logical position of the argument in hardware slot `i`
    pub index_list: SmallVec<[u64; 8]>,
    /// The class each logical argument was given
    pub classes: SmallVec<[ArgClass; 8]>,
}

/// The calling conventions a descriptor can target.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Platform {
    /// System V AMD64, used by Linux, macOS and the BSDs
    SystemV,
    /// The Windows x64 convention
    WindowsX64,
}

pub(crate) const SYS_V_CC: SystemVCallingConv = SystemVCallingConv;

pub(crate) const WINDOWS_X64_CC: WindowsX64CallingConv = WindowsX64CallingConv;

impl Platform {
    /// The convention native code on the running target uses.
    pub const fn host() -> Self {
        if cfg!(windows) {
            Self::WindowsX64
        } else {
            Self::SystemV
        }
    }

    /// Gets the classification rules for this platform.
    pub fn convention(self) -> &'static dyn CallingConvention {
        match self {
            Self::SystemV => &SYS_V_CC,
            Self::WindowsX64 => &WINDOWS_X64_CC,
        }
    }
}

/// Models the argument-passing rules of a single calling convention.
pub trait CallingConvention: Sync {
    /// The platform these rules belong to.
    fn platform(&self) -> Platform;

    /// How many integer argument registers the convention has.
    fn int_registers(&self) -> usize;

    /// Classifies a list of logical arguments.
    fn classify(&self, args: &[ArgType]) -> Classification;

    /// Checks that a shape is something this convention could have produced.
    fn validate(&self, shape: Shape) -> Result<()>;

    /// Gets the physical location of hardware slot `i` in a given shape.
    ///
    /// Slots are numbered in the order the interposing routine walks them, which is
    /// the order `index_list` is written in.
    fn slot(&self, shape: Shape, i: usize) -> HardwareSlot;
}

/// Classifies `args` under the rules of `platform`.
pub fn classify(args: &[ArgType], platform: Platform) -> Classification {
    platform.convention().classify(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_eq_size;

    assert_eq_size!(ReturnType, u8);

    #[test]
    fn return_tags_round_trip() {
        for ty in [
            ReturnType::Int64,
            ReturnType::Float64,
            ReturnType::Int32,
            ReturnType::Float32,
            ReturnType::Void,
        ] {
            assert_eq!(ReturnType::from_tag(ty.tag()), Some(ty));
        }

        assert_eq!(ReturnType::Int64.tag(), 0);
        assert_eq!(ReturnType::Float64.tag(), 1);
        assert_eq!(ReturnType::from_tag(5), None);
    }

    #[test]
    fn normalize_narrow_returns() {
        let neg = (-83i32) as u32 as u64 | 0xDEAD_0000_0000_0000;

        assert_eq!(ReturnType::Int32.normalize(neg), (-83i64) as u64);
        assert_eq!(ReturnType::Int64.normalize(neg), neg);

        let f = 2.5f32.to_bits() as u64 | 0xFFFF_FFFF_0000_0000;

        assert_eq!(ReturnType::Float32.normalize(f), 2.5f32.to_bits() as u64);
        assert_eq!(ReturnType::Void.normalize(f), 0);
        assert!(ReturnType::Float32.is_float());
        assert!(!ReturnType::Int32.is_float());
    }

    #[test]
    fn host_matches_target() {
        let expected = if cfg!(windows) {
            Platform::WindowsX64
        } else {
            Platform::SystemV
        };

        assert_eq!(Platform::host(), expected);
        assert_eq!(Platform::host().convention().platform(), expected);
    }

    #[test]
    fn platforms_agree_on_all_integer_register_args() {
        let args = [ArgType::Int, ArgType::Int, ArgType::Int];

        for platform in [Platform::SystemV, Platform::WindowsX64] {
            let c = classify(&args, platform);

            assert_eq!(c.shape.num_int_args, 3);
            assert_eq!(c.shape.total(), 3);
            assert_eq!(c.index_list.as_slice(), &[0, 1, 2]);
            assert_eq!(c.shape.float_mask, 0);
        }
    }

    #[test]
    fn empty_argument_list() {
        for platform in [Platform::SystemV, Platform::WindowsX64] {
            let c = classify(&[], platform);

            assert_eq!(c.shape, Shape::default());
            assert!(c.index_list.is_empty());
            assert!(platform.convention().validate(c.shape).is_ok());
        }
    }

    #[cfg(feature = "enable-serde")]
    #[test]
    fn serde_tokens() {
        use serde_test::{assert_tokens, Token};

        assert_tokens(
            &Platform::WindowsX64,
            &[Token::UnitVariant {
                name: "Platform",
                variant: "WindowsX64",
            }],
        );

        assert_tokens(
            &ReturnType::Float32,
            &[Token::UnitVariant {
                name: "ReturnType",
                variant: "Float32",
            }],
        );

        assert_tokens(
            &Shape {
                num_int_args: 2,
                num_float_args: 1,
                num_mem_args: 0,
                float_mask: 0b100,
            },
            &[
                Token::Struct {
                    name: "Shape",
                    len: 4,
                },
                Token::Str("num_int_args"),
                Token::U64(2),
                Token::Str("num_float_args"),
                Token::U64(1),
                Token::Str("num_mem_args"),
                Token::U64(0),
                Token::Str("float_mask"),
                Token::U64(4),
                Token::StructEnd,
            ],
        );
    }
}
