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

/// Integer argument registers, in order: `rdi rsi rdx rcx r8 r9`.
pub const SYS_V_INT_REGISTERS: usize = 6;

/// Vector argument registers, in order: `xmm0` through `xmm7`.
pub const SYS_V_FLOAT_REGISTERS: usize = 8;

/// The System V AMD64 argument-passing rules.
///
/// Integer and vector registers are handed out by two independent counters, so a
/// function taking `(f64, i64)` passes the `f64` in `xmm0` and the `i64` in `rdi`.
/// Anything that does not fit in its class's registers goes on the stack in
/// argument order, whatever its type.
///
/// Hardware slots are numbered integer registers first, then vector registers, then
/// stack slots.
#[derive(Debug)]
pub struct SystemVCallingConv;

impl CallingConvention for SystemVCallingConv {
    fn platform(&self) -> Platform {
        Platform::SystemV
    }

    fn int_registers(&self) -> usize {
        SYS_V_INT_REGISTERS
    }

    fn classify(&self, args: &[ArgType]) -> Classification {
        let mut ints = SmallVec::<[u64; 8]>::new();
        let mut floats = SmallVec::<[u64; 8]>::new();
        let mut mems = SmallVec::<[u64; 8]>::new();
        let mut classes = SmallVec::new();

        for (i, &arg) in args.iter().enumerate() {
            let i = i as u64;

            let class = match arg {
                ArgType::Int if ints.len() < SYS_V_INT_REGISTERS => {
                    ints.push(i);

                    ArgClass::Int
                }
                ArgType::Float if floats.len() < SYS_V_FLOAT_REGISTERS => {
                    floats.push(i);

                    ArgClass::Float
                }
                _ => {
                    mems.push(i);

                    ArgClass::Memory
                }
            };

            classes.push(class);
        }

        let shape = Shape {
            num_int_args: ints.len() as u64,
            num_float_args: floats.len() as u64,
            num_mem_args: mems.len() as u64,
            float_mask: 0,
        };

        let mut index_list = ints;
        index_list.extend(floats);
        index_list.extend(mems);

        Classification {
            shape,
            index_list,
            classes,
        }
    }

    fn validate(&self, shape: Shape) -> Result<()> {
        if shape.num_int_args > SYS_V_INT_REGISTERS as u64
            || shape.num_float_args > SYS_V_FLOAT_REGISTERS as u64
            || shape.num_mem_args > MAX_MEM_ARGS
        {
            return Err(Error::UnsupportedShape {
                template: TemplateId::SystemV,
                ints: shape.num_int_args,
                floats: shape.num_float_args,
                mems: shape.num_mem_args,
            });
        }

        if shape.float_mask != 0 {
            return Err(Error::InvalidFloatMask {
                mask: shape.float_mask,
                floats: shape.num_float_args,
                registers: shape.in_registers(),
            });
        }

        Ok(())
    }

    fn slot(&self, shape: Shape, i: usize) -> HardwareSlot {
        let ints = shape.num_int_args as usize;
        let regs = shape.in_registers() as usize;

        if i < ints {
            HardwareSlot::IntRegister(i)
        } else if i < regs {
            HardwareSlot::FloatRegister(i - ints)
        } else {
            HardwareSlot::Stack(i - regs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ArgType::{Float as F, Int as I};
    use crate::abi::{classify, SYS_V_CC};

    fn counts(c: &Classification) -> (u64, u64, u64) {
        (
            c.shape.num_int_args,
            c.shape.num_float_args,
            c.shape.num_mem_args,
        )
    }

    #[test]
    fn float_then_int() {
        let c = classify(&[F, I], Platform::SystemV);

        assert_eq!(counts(&c), (1, 1, 0));
        assert_eq!(c.index_list.as_slice(), &[1, 0]);
        assert_eq!(c.classes.as_slice(), &[ArgClass::Float, ArgClass::Int]);
    }

    #[test]
    fn int_budget_plus_one() {
        let c = classify(&[I; 7], Platform::SystemV);

        assert_eq!(counts(&c), (6, 0, 1));
        assert_eq!(c.index_list.as_slice(), &[0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(c.classes[6], ArgClass::Memory);
    }

    #[test]
    fn spilled_int_before_float() {
        let c = classify(&[I, I, I, I, I, I, I, F], Platform::SystemV);

        assert_eq!(counts(&c), (6, 1, 1));
        assert_eq!(c.index_list.as_slice(), &[0, 1, 2, 3, 4, 5, 7, 6]);
    }

    #[test]
    fn float_budget_plus_one() {
        let c = classify(&[F; 9], Platform::SystemV);

        assert_eq!(counts(&c), (0, 8, 1));
        assert_eq!(c.index_list.as_slice(), &[0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn interleaved_ten_and_ten() {
        let args: Vec<_> = (0..20).map(|i| if i % 2 == 0 { I } else { F }).collect();
        let c = classify(&args, Platform::SystemV);

        assert_eq!(counts(&c), (6, 8, 6));
        assert_eq!(&c.index_list[..6], &[0, 2, 4, 6, 8, 10]);
        assert_eq!(&c.index_list[6..14], &[1, 3, 5, 7, 9, 11, 13, 15]);
        assert_eq!(&c.index_list[14..], &[12, 14, 16, 17, 18, 19]);
    }

    #[test]
    fn six_ints_four_mems() {
        let c = classify(&[I; 10], Platform::SystemV);

        assert_eq!(counts(&c), (6, 0, 4));
        assert_eq!(SYS_V_CC.slot(c.shape, 5), HardwareSlot::IntRegister(5));
        assert_eq!(SYS_V_CC.slot(c.shape, 6), HardwareSlot::Stack(0));
        assert_eq!(SYS_V_CC.slot(c.shape, 9), HardwareSlot::Stack(3));
    }

    #[test]
    fn slots_follow_class_groups() {
        let c = classify(&[F, I, F], Platform::SystemV);

        assert_eq!(SYS_V_CC.slot(c.shape, 0), HardwareSlot::IntRegister(0));
        assert_eq!(SYS_V_CC.slot(c.shape, 1), HardwareSlot::FloatRegister(0));
        assert_eq!(SYS_V_CC.slot(c.shape, 2), HardwareSlot::FloatRegister(1));
    }

    #[test]
    fn validate_rejects_impossible_shapes() {
        let ok = Shape {
            num_int_args: 6,
            num_float_args: 8,
            num_mem_args: 3,
            float_mask: 0,
        };

        assert!(SYS_V_CC.validate(ok).is_ok());

        let too_many_ints = Shape {
            num_int_args: 7,
            ..ok
        };

        assert!(matches!(
            SYS_V_CC.validate(too_many_ints),
            Err(Error::UnsupportedShape { ints: 7, .. })
        ));

        let masked = Shape {
            float_mask: 1,
            ..ok
        };

        assert!(matches!(
            SYS_V_CC.validate(masked),
            Err(Error::InvalidFloatMask { .. })
        ));

        let too_many_mems = Shape {
            num_mem_args: MAX_MEM_ARGS + 1,
            ..ok
        };

        assert!(SYS_V_CC.validate(too_many_mems).is_err());
    }
}
