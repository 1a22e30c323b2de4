//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::abi::{Platform, ReturnType, Shape, MAX_MEM_ARGS};
use crate::codegen::x86_64::{Assembler, Gpr, Mem};
use crate::codegen::HOLE_SENTINEL;
use crate::descriptor::StagedDescriptor;
use crate::error::{Error, Result};
use smallvec::SmallVec;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// A runtime-known constant that gets patched into a template.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Hole {
    /// Address of the live [`StagedDescriptor`] the stub publishes its shape into
    Descriptor,
    /// `num_int_args`
    NumIntArgs,
    /// `num_float_args`
    NumFloatArgs,
    /// `num_mem_args`
    NumMemArgs,
    /// `extern_index`
    ExternIndex,
    /// The [`ReturnType`] tag
    ReturnType,
    /// `float_mask`, only present in Windows x64 templates
    FloatMask,
    /// Address of the interposing routine the stub jumps to
    Interposer,
}

/// Selects a template bucket.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum TemplateId {
    /// Stubs called with the System V convention
    SystemV,
    /// Stubs called with the Windows x64 convention
    WindowsX64,
}

impl TemplateId {
    /// The template that serves descriptors for `platform`.
    pub const fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::SystemV => Self::SystemV,
            Platform::WindowsX64 => Self::WindowsX64,
        }
    }

    /// The calling convention stubs from this template are called with.
    pub const fn platform(self) -> Platform {
        match self {
            Self::SystemV => Platform::SystemV,
            Self::WindowsX64 => Platform::WindowsX64,
        }
    }

    /// The holes of the template, in the order they appear in the code.
    pub const fn holes(self) -> &'static [Hole] {
        match self {
            Self::SystemV => &[
                Hole::Descriptor,
                Hole::NumIntArgs,
                Hole::NumFloatArgs,
                Hole::NumMemArgs,
                Hole::ExternIndex,
                Hole::ReturnType,
                Hole::Interposer,
            ],
            Self::WindowsX64 => &[
                Hole::Descriptor,
                Hole::NumIntArgs,
                Hole::NumFloatArgs,
                Hole::NumMemArgs,
                Hole::ExternIndex,
                Hole::ReturnType,
                Hole::FloatMask,
                Hole::Interposer,
            ],
        }
    }

    /// The largest shapes the template accepts.
    pub const fn limits(self) -> ShapeLimits {
        match self {
            Self::SystemV => ShapeLimits {
                max_int_args: 6,
                max_float_args: 8,
                max_register_args: 14,
                max_mem_args: MAX_MEM_ARGS,
            },
            Self::WindowsX64 => ShapeLimits {
                max_int_args: 4,
                max_float_args: 4,
                max_register_args: 4,
                max_mem_args: MAX_MEM_ARGS,
            },
        }
    }
}

/// The largest shape a template bucket can express.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShapeLimits {
    /// Integer register arguments
    pub max_int_args: u64,
    /// Vector register arguments
    pub max_float_args: u64,
    /// Register arguments of either class
    pub max_register_args: u64,
    /// Memory arguments
    pub max_mem_args: u64,
}

impl ShapeLimits {
    /// Whether `shape` fits inside the limits.
    pub const fn admits(self, shape: Shape) -> bool {
        shape.num_int_args <= self.max_int_args
            && shape.num_float_args <= self.max_float_args
            && shape.in_registers() <= self.max_register_args
            && shape.num_mem_args <= self.max_mem_args
    }
}

/// The values every hole of a template gets patched with.
#[derive(Copy, Clone, Debug)]
pub struct HoleValues {
    /// Address of the staged descriptor
    pub descriptor: u64,
    /// Address of the interposing routine
    pub interposer: u64,
    /// The shape being baked in
    pub shape: Shape,
    /// The extern index being baked in
    pub extern_index: u64,
    /// The return type being baked in
    pub return_type: ReturnType,
}

impl HoleValues {
    /// The value `hole` is patched with.
    pub fn value(&self, hole: Hole) -> u64 {
        match hole {
            Hole::Descriptor => self.descriptor,
            Hole::NumIntArgs => self.shape.num_int_args,
            Hole::NumFloatArgs => self.shape.num_float_args,
            Hole::NumMemArgs => self.shape.num_mem_args,
            Hole::ExternIndex => self.extern_index,
            Hole::ReturnType => self.return_type.tag(),
            Hole::FloatMask => self.shape.float_mask,
            Hole::Interposer => self.interposer,
        }
    }
}

/// A precompiled stub skeleton.
///
/// The code publishes the stub's shape into the staged descriptor and tail-jumps into
/// the interposing routine, leaving every argument register and the caller's stack
/// exactly as they were:
///
/// ```text
///   movabs r11, <descriptor>
///   movabs rax, <num_int_args>   ; mov [r11 + 0], rax
///   ...                          ; one pair per shape hole
///   lea    rax, [rip + index_list]
///   mov    [r11 + 40], rax
///   movabs r10, <interposer>
///   jmp    r10
///   int3 ...                     ; padding up to a multiple of 8
/// index_list:                    ; offset `code_size`, filled per instantiation
/// ```
#[derive(Clone, Debug)]
pub struct Template {
    id: TemplateId,
    code: Vec<u8>,
    holes: SmallVec<[(Hole, usize); 8]>,
}

impl Template {
    /// Assembles the template for `id`.
    pub fn build(id: TemplateId) -> Result<Self> {
        let mut asm = Assembler::new();
        let index_list = asm.new_label();

        asm.movabs_hole(Gpr::R11, Hole::Descriptor);

        for &hole in id.holes() {
            let offset = match hole {
                Hole::NumIntArgs => StagedDescriptor::NUM_INT_ARGS,
                Hole::NumFloatArgs => StagedDescriptor::NUM_FLOAT_ARGS,
                Hole::NumMemArgs => StagedDescriptor::NUM_MEM_ARGS,
                Hole::ExternIndex => StagedDescriptor::EXTERN_INDEX,
                Hole::ReturnType => StagedDescriptor::RETURN_TYPE,
                Hole::FloatMask => StagedDescriptor::FLOAT_MASK,
                Hole::Descriptor | Hole::Interposer => continue,
            };

            asm.movabs_hole(Gpr::RAX, hole);
            asm.store(Mem::base(Gpr::R11, offset), Gpr::RAX);
        }

        asm.lea_label(Gpr::RAX, index_list);
        asm.store(Mem::base(Gpr::R11, StagedDescriptor::INDEX_LIST), Gpr::RAX);
        asm.movabs_hole(Gpr::R10, Hole::Interposer);
        asm.jmp(Gpr::R10);
        asm.align_with_int3(8);
        asm.bind(index_list);

        let assembled = asm.finish()?;

        Ok(Self {
            id,
            code: assembled.code,
            holes: assembled.holes,
        })
    }

    /// Which bucket this template serves.
    #[inline]
    pub fn id(&self) -> TemplateId {
        self.id
    }

    /// The unpatched code.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Length of the code, which is also where the index list starts.
    #[inline]
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Every hole and the offset recorded for it when the template was assembled.
    #[inline]
    pub fn holes(&self) -> &[(Hole, usize)] {
        &self.holes
    }

    /// Checks that `shape` can be expressed by this template.
    pub fn admit(&self, shape: Shape) -> Result<()> {
        if self.id.limits().admits(shape) {
            Ok(())
        } else {
            Err(Error::UnsupportedShape {
                template: self.id,
                ints: shape.num_int_args,
                floats: shape.num_float_args,
                mems: shape.num_mem_args,
            })
        }
    }

    /// Produces a fully patched image: the code with every hole filled in, followed
    /// by `index_list` as little-endian 64-bit values.
    pub fn instantiate_image(&self, values: &HoleValues, index_list: &[u64]) -> Result<Vec<u8>> {
        let mut image = Vec::with_capacity(self.code_size() + 8 * index_list.len());

        image.extend_from_slice(&self.code);
        patch_holes(&mut image, &self.holes, |hole| values.value(hole))?;

        for &index in index_list {
            image.extend_from_slice(&index.to_le_bytes());
        }

        Ok(image)
    }
}

/// Patches each hole of `code` in declaration order.
///
/// The scan is linear: every hole is the first sentinel at or after the end of the
/// previous one. Finding it anywhere other than the offset recorded in `holes` means
/// the code does not match the template it claims to be.
pub fn patch_holes(
    code: &mut [u8],
    holes: &[(Hole, usize)],
    mut value: impl FnMut(Hole) -> u64,
) -> Result<()> {
    let sentinel = HOLE_SENTINEL.to_le_bytes();
    let mut cursor = 0;

    for &(hole, expected) in holes {
        let found = code
            .get(cursor..)
            .and_then(|rest| rest.windows(8).position(|w| w == sentinel))
            .map(|pos| cursor + pos)
            .ok_or(Error::HoleNotFound(hole))?;

        if found != expected {
            return Err(Error::HoleMisplaced {
                hole,
                found,
                expected,
            });
        }

        code[found..found + 8].copy_from_slice(&value(hole).to_le_bytes());
        cursor = found + 8;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> HoleValues {
        HoleValues {
            descriptor: 0x1111_2222_3333_4444,
            interposer: 0x5555_6666_7777_8888,
            shape: Shape {
                num_int_args: 2,
                num_float_args: 1,
                num_mem_args: 0,
                float_mask: 0b100,
            },
            extern_index: 9,
            return_type: ReturnType::Float64,
        }
    }

    fn read_u64(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    #[test]
    fn holes_in_declared_order() {
        for id in [TemplateId::SystemV, TemplateId::WindowsX64] {
            let template = Template::build(id).unwrap();
            let order: Vec<_> = template.holes().iter().map(|&(h, _)| h).collect();

            assert_eq!(order.as_slice(), id.holes());
            assert!(template
                .holes()
                .windows(2)
                .all(|pair| pair[0].1 + 8 <= pair[1].1));

            for &(_, at) in template.holes() {
                assert_eq!(read_u64(template.code(), at), HOLE_SENTINEL);
            }
        }
    }

    #[test]
    fn code_is_padded_for_the_index_list() {
        for id in [TemplateId::SystemV, TemplateId::WindowsX64] {
            let template = Template::build(id).unwrap();

            assert_eq!(template.code_size() % 8, 0);
        }
    }

    #[test]
    fn image_is_fully_patched() {
        let template = Template::build(TemplateId::WindowsX64).unwrap();
        let values = values();
        let image = template.instantiate_image(&values, &[0, 1, 2]).unwrap();
        let sentinel = HOLE_SENTINEL.to_le_bytes();

        assert_eq!(image.len(), template.code_size() + 24);
        assert!(!image.windows(8).any(|w| w == sentinel));

        for &(hole, at) in template.holes() {
            assert_eq!(read_u64(&image, at), values.value(hole));
        }

        let base = template.code_size();

        assert_eq!(read_u64(&image, base), 0);
        assert_eq!(read_u64(&image, base + 8), 1);
        assert_eq!(read_u64(&image, base + 16), 2);
    }

    #[test]
    fn system_v_has_no_float_mask() {
        let template = Template::build(TemplateId::SystemV).unwrap();

        assert!(template.holes().iter().all(|&(h, _)| h != Hole::FloatMask));
    }

    #[test]
    fn missing_hole_is_detected() {
        let template = Template::build(TemplateId::SystemV).unwrap();
        let mut code = template.code().to_vec();
        let &(last, at) = template.holes().last().unwrap();

        code[at..at + 8].fill(0);

        assert!(matches!(
            patch_holes(&mut code, template.holes(), |_| 0),
            Err(Error::HoleNotFound(hole)) if hole == last
        ));
    }

    #[test]
    fn skipped_hole_is_misplaced() {
        let template = Template::build(TemplateId::SystemV).unwrap();
        let mut code = template.code().to_vec();
        let (_, at) = template.holes()[2];

        code[at..at + 8].fill(0);

        // the scan for the third hole lands on the fourth
        assert!(matches!(
            patch_holes(&mut code, template.holes(), |_| 0),
            Err(Error::HoleMisplaced {
                hole: Hole::NumFloatArgs,
                ..
            })
        ));
    }

    #[test]
    fn stray_sentinel_is_misplaced() {
        let template = Template::build(TemplateId::SystemV).unwrap();
        let mut code = HOLE_SENTINEL.to_le_bytes().to_vec();

        code.extend_from_slice(template.code());

        let shifted: Vec<_> = template
            .holes()
            .iter()
            .map(|&(h, at)| (h, at + 8))
            .collect();

        assert!(matches!(
            patch_holes(&mut code, &shifted, |_| 0),
            Err(Error::HoleMisplaced {
                hole: Hole::Descriptor,
                found: 0,
                ..
            })
        ));
    }

    #[test]
    fn shape_limits() {
        let sysv = Template::build(TemplateId::SystemV).unwrap();
        let win = Template::build(TemplateId::WindowsX64).unwrap();
        let big = Shape {
            num_int_args: 6,
            num_float_args: 8,
            num_mem_args: 2,
            float_mask: 0,
        };

        assert!(sysv.admit(big).is_ok());
        assert!(matches!(
            win.admit(big),
            Err(Error::UnsupportedShape {
                template: TemplateId::WindowsX64,
                ..
            })
        ));
    }

    #[test]
    fn buckets_follow_platforms() {
        for platform in [Platform::SystemV, Platform::WindowsX64] {
            assert_eq!(TemplateId::for_platform(platform).platform(), platform);
        }
    }
}
