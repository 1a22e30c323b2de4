//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! The generic half of the interposing trampoline.
//!
//! The assembled interposing routine spills the argument registers and calls one of
//! the `interpose_*` functions here. From that point on everything is driven by the
//! staged descriptor: gather every hardware slot into the canonical buffer, call the
//! entry point, and clean up the result according to the return type.

use crate::abi::{CallingConvention, HardwareSlot, Platform, ReturnType, Shape};
use crate::codegen::CallOutFrame;
use crate::descriptor::{Dispatcher, StagedDescriptor};
use smallvec::SmallVec;
use std::{mem, slice};

/// Stack arguments built for one outgoing call.
pub(crate) type SpillArea = SmallVec<[u64; 16]>;

/// Entered from the System V interposing routine.
///
/// # Safety
///
/// `staged` must be a fully staged descriptor, `regs` must point at 6 + 8 spilled
/// registers and `stack` at the caller's stack arguments.
pub(crate) unsafe extern "sysv64" fn interpose_sysv(
    staged: *mut StagedDescriptor,
    regs: *const u64,
    stack: *const u64,
) -> u64 {
    interpose(Platform::SystemV, staged, regs, stack)
}

/// Entered from the Windows x64 interposing routine.
///
/// # Safety
///
/// `staged` must be a fully staged descriptor, `regs` must point at 4 + 4 spilled
/// registers and `stack` at the caller's stack arguments (past the home area).
pub(crate) unsafe extern "win64" fn interpose_win64(
    staged: *mut StagedDescriptor,
    regs: *const u64,
    stack: *const u64,
) -> u64 {
    interpose(Platform::WindowsX64, staged, regs, stack)
}

unsafe fn read_slot(
    conv: &dyn CallingConvention,
    slot: HardwareSlot,
    regs: *const u64,
    stack: *const u64,
) -> u64 {
    match slot {
        HardwareSlot::IntRegister(r) => *regs.add(r),
        HardwareSlot::FloatRegister(r) => *regs.add(conv.int_registers() + r),
        HardwareSlot::Stack(s) => *stack.add(s),
    }
}

unsafe fn interpose(
    platform: Platform,
    staged: *mut StagedDescriptor,
    regs: *const u64,
    stack: *const u64,
) -> u64 {
    let staged = *staged;
    let conv = platform.convention();
    let shape = staged.shape();
    let index_list = slice::from_raw_parts(staged.index_list as *const u64, staged.total_args());
    let args =
        slice::from_raw_parts_mut(staged.args_list as *mut u64, staged.args_capacity as usize);

    for (i, &logical) in index_list.iter().enumerate() {
        args[logical as usize] = read_slot(conv, conv.slot(shape, i), regs, stack);
    }

    let raw = if staged.entry_kind == StagedDescriptor::ENTRY_DIRECT {
        let return_type = ReturnType::from_tag(staged.return_type).unwrap_or(ReturnType::Int64);

        call_native(
            platform,
            staged.call_out,
            staged.entry_point,
            shape,
            index_list,
            args,
            return_type,
        )
    } else {
        let dispatcher: Dispatcher = mem::transmute(staged.entry_point as usize);

        dispatcher(args.as_mut_ptr(), staged.extern_index)
    };

    match ReturnType::from_tag(staged.return_type) {
        Some(ty) => ty.normalize(raw),
        None => raw,
    }
}

/// Places logical arguments back into the hardware slots of `platform`.
///
/// Floating-point register arguments under Windows x64 are also copied into the
/// integer register of the same position, which variadic callees read them from.
pub(crate) fn expand_call_out(
    platform: Platform,
    target: u64,
    shape: Shape,
    index_list: &[u64],
    args: &[u64],
) -> (CallOutFrame, SpillArea) {
    let conv = platform.convention();
    let mut frame = CallOutFrame {
        target,
        ..CallOutFrame::default()
    };
    let mut spill = SpillArea::new();

    for (i, &logical) in index_list.iter().enumerate() {
        let value = args[logical as usize];

        match conv.slot(shape, i) {
            HardwareSlot::IntRegister(r) => frame.int_regs[r] = value,
            HardwareSlot::FloatRegister(r) => {
                frame.float_regs[r] = value;

                if platform == Platform::WindowsX64 {
                    frame.int_regs[r] = value;
                }
            }
            HardwareSlot::Stack(_) => spill.push(value),
        }
    }

    (frame, spill)
}

/// Runs the call-out routine at `routine` on `frame`.
///
/// # Safety
///
/// `routine` must be the call-out routine for `platform`, and `frame` must describe
/// a call that is valid for its target.
pub(crate) unsafe fn run_call_out(platform: Platform, routine: u64, frame: &mut CallOutFrame) {
    match platform {
        Platform::SystemV => {
            let f: extern "sysv64" fn(*mut CallOutFrame) = mem::transmute(routine as usize);

            f(frame)
        }
        Platform::WindowsX64 => {
            let f: extern "win64" fn(*mut CallOutFrame) = mem::transmute(routine as usize);

            f(frame)
        }
    }
}

/// Calls `target` with the arguments in `args`, returning the register the return
/// type lives in.
///
/// # Safety
///
/// Same as [`run_call_out`].
pub(crate) unsafe fn call_native(
    platform: Platform,
    routine: u64,
    target: u64,
    shape: Shape,
    index_list: &[u64],
    args: &[u64],
    return_type: ReturnType,
) -> u64 {
    let (mut frame, spill) = expand_call_out(platform, target, shape, index_list, args);

    frame.stack = spill.as_ptr() as u64;
    frame.num_stack = spill.len() as u64;

    run_call_out(platform, routine, &mut frame);

    if return_type.is_float() {
        frame.ret_float
    } else {
        frame.ret_int
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::classify;
    use crate::abi::ArgType::{Float as F, Int as I};

    #[test]
    fn system_v_expansion() {
        let c = classify(&[F, I, I, I, I, I, I, I], Platform::SystemV);
        let args: Vec<u64> = (100..108).collect();
        let (frame, spill) =
            expand_call_out(Platform::SystemV, 0x42, c.shape, &c.index_list, &args);

        assert_eq!(frame.target, 0x42);
        assert_eq!(frame.int_regs, [101, 102, 103, 104, 105, 106]);
        assert_eq!(frame.float_regs[0], 100);
        assert_eq!(spill.as_slice(), &[107]);
    }

    #[test]
    fn windows_expansion_shadows_floats() {
        let c = classify(&[I, F, I, F, F, I], Platform::WindowsX64);
        let args: Vec<u64> = (10..16).collect();
        let (frame, spill) =
            expand_call_out(Platform::WindowsX64, 0, c.shape, &c.index_list, &args);

        assert_eq!(&frame.int_regs[..4], &[10, 11, 12, 13]);
        assert_eq!(frame.float_regs[1], 11);
        assert_eq!(frame.float_regs[3], 13);
        assert_eq!(frame.float_regs[0], 0);
        assert_eq!(spill.as_slice(), &[14, 15]);
    }

    #[test]
    fn gather_reads_every_slot_class() {
        let c = classify(&[F, I, I, I, I, I, I, I], Platform::SystemV);
        let mut regs = [0u64; 14];

        regs[..6].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        regs[6] = 0.5f64.to_bits();

        let stack = [7u64];
        let conv = Platform::SystemV.convention();
        let mut args = [0u64; 8];

        for (i, &logical) in c.index_list.iter().enumerate() {
            let slot = conv.slot(c.shape, i);

            // SAFETY: `regs` and `stack` are large enough for the shape
            args[logical as usize] =
                unsafe { read_slot(conv, slot, regs.as_ptr(), stack.as_ptr()) };
        }

        assert_eq!(args, [0.5f64.to_bits(), 1, 2, 3, 4, 5, 6, 7]);
    }
}
