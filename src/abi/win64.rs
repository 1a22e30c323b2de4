//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::abi::{
    ArgClass, ArgType, CallingConvention, Classification, HardwareSlot, Platform, Shape,
    MAX_MEM_ARGS,
};
use crate::codegen::TemplateId;
use crate::error::{Error, Result};
use smallvec::SmallVec;

/// Register positions shared by both classes: `rcx/xmm0 rdx/xmm1 r8/xmm2 r9/xmm3`.
pub const WIN64_REGISTER_POSITIONS: usize = 4;

/// The Windows x64 argument-passing rules.
///
/// A single positional counter is shared between integer and vector registers:
/// argument 0 goes in `rcx` or `xmm0`, argument 1 in `rdx` or `xmm1`, and so on.
/// Every argument from position 4 onwards is passed on the stack, above the 32-byte
/// home area the caller reserves.
///
/// Since placement is positional, hardware slot `i` *is* logical argument `i`,
/// and the only extra information needed to read registers back is which register
/// positions are vector registers (the shape's `float_mask`).
#[derive(Debug)]
pub struct WindowsX64CallingConv;

impl CallingConvention for WindowsX64CallingConv {
    fn platform(&self) -> Platform {
        Platform::WindowsX64
    }

    fn int_registers(&self) -> usize {
        WIN64_REGISTER_POSITIONS
    }

    fn classify(&self, args: &[ArgType]) -> Classification {
        let mut shape = Shape::default();
        let mut classes = SmallVec::new();

        for (position, &arg) in args.iter().enumerate() {
            let class = match arg {
                _ if position >= WIN64_REGISTER_POSITIONS => {
                    shape.num_mem_args += 1;

                    ArgClass::Memory
                }
                ArgType::Int => {
                    shape.num_int_args += 1;

                    ArgClass::Int
                }
                ArgType::Float => {
                    shape.num_float_args += 1;
                    shape.float_mask |= 1 << position;

                    ArgClass::Float
                }
            };

            classes.push(class);
        }

        Classification {
            shape,
            index_list: (0..args.len() as u64).collect(),
            classes,
        }
    }

    fn validate(&self, shape: Shape) -> Result<()> {
        let registers = shape.in_registers();
        let positions = WIN64_REGISTER_POSITIONS as u64;

        // memory slots only exist once every register position is taken
        if registers > positions
            || (shape.num_mem_args != 0 && registers != positions)
            || shape.num_mem_args > MAX_MEM_ARGS
        {
            return Err(Error::UnsupportedShape {
                template: TemplateId::WindowsX64,
                ints: shape.num_int_args,
                floats: shape.num_float_args,
                mems: shape.num_mem_args,
            });
        }

        let in_use = (1u64 << registers) - 1;

        if shape.float_mask & !in_use != 0
            || u64::from(shape.float_mask.count_ones()) != shape.num_float_args
        {
            return Err(Error::InvalidFloatMask {
                mask: shape.float_mask,
                floats: shape.num_float_args,
                registers,
            });
        }

        Ok(())
    }

    fn slot(&self, shape: Shape, i: usize) -> HardwareSlot {
        let regs = shape.in_registers() as usize;

        if i >= regs {
            HardwareSlot::Stack(i - regs)
        } else if shape.float_mask & (1 << i) != 0 {
            HardwareSlot::FloatRegister(i)
        } else {
            HardwareSlot::IntRegister(i)
        }
    }
}
