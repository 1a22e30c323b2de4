//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! The fixed routines that sit on either side of a stub.
//!
//! The *interposing routine* is what every stub jumps to. It spills the argument
//! registers of its convention, then calls back into Rust with the staged
//! descriptor, the spilled registers and the address of the caller's stack arguments.
//!
//! The *call-out routine* goes the other way: given a [`CallOutFrame`] describing
//! register and stack contents, it calls a native function with exactly that
//! register and stack state and records both possible return registers.

use crate::abi::{Platform, SYS_V_FLOAT_REGISTERS, SYS_V_INT_REGISTERS, WIN64_REGISTER_POSITIONS};
use crate::codegen::x86_64::{Assembler, Gpr, Mem, Xmm};
use crate::error::Result;
use static_assertions::{assert_eq_size, const_assert_eq};
use std::mem;

/// Integer argument registers of System V, in order.
pub const SYS_V_ARG_GPRS: [Gpr; SYS_V_INT_REGISTERS] =
    [Gpr::RDI, Gpr::RSI, Gpr::RDX, Gpr::RCX, Gpr::R8, Gpr::R9];

/// Integer argument registers of Windows x64, in order.
pub const WIN64_ARG_GPRS: [Gpr; WIN64_REGISTER_POSITIONS] = [Gpr::RCX, Gpr::RDX, Gpr::R8, Gpr::R9];

// the 32 bytes a Windows x64 caller reserves for its callee's register arguments
const WIN64_HOME_AREA: i32 = 32;

/// The complete register and stack state for one outgoing native call.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CallOutFrame {
    /// The function to call
    pub target: u64,
    /// Integer argument registers, in convention order
    pub int_regs: [u64; SYS_V_INT_REGISTERS],
    /// Vector argument registers (`xmm0..`), as raw 64-bit patterns
    pub float_regs: [u64; SYS_V_FLOAT_REGISTERS],
    /// Address of the stack arguments, first argument lowest
    pub stack: u64,
    /// How many 8-byte stack arguments there are
    pub num_stack: u64,
    /// `rax` after the call
    pub ret_int: u64,
    /// The low 64 bits of `xmm0` after the call
    pub ret_float: u64,
}

impl CallOutFrame {
    const TARGET: i32 = mem::offset_of!(Self, target) as i32;
    const INT_REGS: i32 = mem::offset_of!(Self, int_regs) as i32;
    const FLOAT_REGS: i32 = mem::offset_of!(Self, float_regs) as i32;
    const STACK: i32 = mem::offset_of!(Self, stack) as i32;
    const NUM_STACK: i32 = mem::offset_of!(Self, num_stack) as i32;
    const RET_INT: i32 = mem::offset_of!(Self, ret_int) as i32;
    const RET_FLOAT: i32 = mem::offset_of!(Self, ret_float) as i32;
}

assert_eq_size!(CallOutFrame, [u64; 19]);
const_assert_eq!(mem::offset_of!(CallOutFrame, int_regs), 8);
const_assert_eq!(mem::offset_of!(CallOutFrame, float_regs), 56);
const_assert_eq!(mem::offset_of!(CallOutFrame, stack), 120);
const_assert_eq!(mem::offset_of!(CallOutFrame, ret_float), 144);

/// Assembles the interposing routine for `platform`.
///
/// `staged` is the address of the descriptor storage the routine serves, and
/// `interpose` is the address of a Rust function with the signature
/// `fn(staged: *mut StagedDescriptor, regs: *const u64, stack: *const u64) -> u64`
/// in the same convention. `regs` holds the integer argument registers followed
/// by the vector argument registers.
///
/// The result is returned in `rax` and copied into `xmm0`, so callers expecting
/// either register class see it.
///
/// [`StagedDescriptor`]: crate::descriptor::StagedDescriptor
pub fn interposer_routine(platform: Platform, staged: u64, interpose: u64) -> Result<Vec<u8>> {
    let mut asm = Assembler::new();

    asm.push(Gpr::RBP);
    asm.mov(Gpr::RBP, Gpr::RSP);

    match platform {
        Platform::SystemV => {
            let floats = (8 * SYS_V_INT_REGISTERS) as i32;

            // 14 * 8 bytes, rsp stays 16-byte aligned
            asm.sub_imm(Gpr::RSP, floats + 8 * SYS_V_FLOAT_REGISTERS as i32);

            for (i, &reg) in SYS_V_ARG_GPRS.iter().enumerate() {
                asm.store(Mem::base(Gpr::RSP, 8 * i as i32), reg);
            }

            for i in 0..SYS_V_FLOAT_REGISTERS {
                let at = Mem::base(Gpr::RSP, floats + 8 * i as i32);

                asm.store_sd(at, Xmm::new(i as u8));
            }

            asm.movabs(Gpr::RDI, staged);
            asm.mov(Gpr::RSI, Gpr::RSP);
            asm.lea(Gpr::RDX, Mem::base(Gpr::RBP, 16));
        }
        Platform::WindowsX64 => {
            let ints = WIN64_HOME_AREA;
            let floats = ints + 8 * WIN64_REGISTER_POSITIONS as i32;

            // home area for our own callee, then 4 + 4 spilled registers
            asm.sub_imm(Gpr::RSP, floats + 8 * WIN64_REGISTER_POSITIONS as i32);

            for (i, &reg) in WIN64_ARG_GPRS.iter().enumerate() {
                asm.store(Mem::base(Gpr::RSP, ints + 8 * i as i32), reg);
            }

            for i in 0..WIN64_REGISTER_POSITIONS {
                let at = Mem::base(Gpr::RSP, floats + 8 * i as i32);

                asm.store_sd(at, Xmm::new(i as u8));
            }

            // the caller's stack arguments start above its home area
            asm.movabs(Gpr::RCX, staged);
            asm.lea(Gpr::RDX, Mem::base(Gpr::RSP, ints));
            asm.lea(Gpr::R8, Mem::base(Gpr::RBP, 16 + WIN64_HOME_AREA));
        }
    }

    asm.movabs(Gpr::RAX, interpose);
    asm.call(Gpr::RAX);
    asm.movq_to_xmm(Xmm::new(0), Gpr::RAX);
    asm.leave();
    asm.ret();

    Ok(asm.finish()?.code)
}

/// Assembles the call-out routine for `platform`.
///
/// The routine has the signature `fn(frame: *mut CallOutFrame)` in the convention
/// of `platform`, and calls `frame.target` with that same convention.
pub fn call_out_routine(platform: Platform) -> Result<Vec<u8>> {
    let mut asm = Assembler::new();
    let copy = asm.new_label();
    let done = asm.new_label();
    let (frame, home, gprs, xmms): (Gpr, i32, &[Gpr], usize) = match platform {
        Platform::SystemV => (Gpr::RDI, 0, &SYS_V_ARG_GPRS[..], SYS_V_FLOAT_REGISTERS),
        Platform::WindowsX64 => (
            Gpr::RCX,
            WIN64_HOME_AREA,
            &WIN64_ARG_GPRS[..],
            WIN64_REGISTER_POSITIONS,
        ),
    };

    // rbx holds the frame across the call, r12 is pushed to keep rsp 16-byte aligned
    asm.push(Gpr::RBP);
    asm.mov(Gpr::RBP, Gpr::RSP);
    asm.push(Gpr::RBX);
    asm.push(Gpr::R12);
    asm.mov(Gpr::RBX, frame);

    // rsp -= align16(num_stack * 8 + home)
    asm.load(Gpr::RCX, Mem::base(Gpr::RBX, CallOutFrame::NUM_STACK));
    asm.lea(Gpr::RAX, Mem::scaled(Gpr::RCX, 15 + home));
    asm.and_imm8(Gpr::RAX, -16);
    asm.sub(Gpr::RSP, Gpr::RAX);

    // for (rdx = 0; rdx < rcx; ++rdx) rsp[home + rdx] = r10[rdx]
    asm.load(Gpr::R10, Mem::base(Gpr::RBX, CallOutFrame::STACK));
    asm.xor32(Gpr::RDX, Gpr::RDX);
    asm.bind(copy);
    asm.cmp(Gpr::RDX, Gpr::RCX);
    asm.jae_short(done);
    asm.load(Gpr::RAX, Mem::indexed(Gpr::R10, Gpr::RDX, 0));
    asm.store(Mem::indexed(Gpr::RSP, Gpr::RDX, home), Gpr::RAX);
    asm.inc(Gpr::RDX);
    asm.jmp_short(copy);
    asm.bind(done);

    for i in 0..xmms {
        let at = CallOutFrame::FLOAT_REGS + 8 * i as i32;

        asm.load_sd(Xmm::new(i as u8), Mem::base(Gpr::RBX, at));
    }

    for (i, &reg) in gprs.iter().enumerate() {
        let at = CallOutFrame::INT_REGS + 8 * i as i32;

        asm.load(reg, Mem::base(Gpr::RBX, at));
    }

    if platform == Platform::SystemV {
        // al is an upper bound on the vector registers used, for variadic callees
        asm.mov32_imm(Gpr::RAX, SYS_V_FLOAT_REGISTERS as u32);
    }

    asm.load(Gpr::R11, Mem::base(Gpr::RBX, CallOutFrame::TARGET));
    asm.call(Gpr::R11);
    asm.store(Mem::base(Gpr::RBX, CallOutFrame::RET_INT), Gpr::RAX);
    asm.store_sd(Mem::base(Gpr::RBX, CallOutFrame::RET_FLOAT), Xmm::new(0));

    asm.lea(Gpr::RSP, Mem::base(Gpr::RBP, -16));
    asm.pop(Gpr::R12);
    asm.pop(Gpr::RBX);
    asm.pop(Gpr::RBP);
    asm.ret();

    Ok(asm.finish()?.code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::HOLE_SENTINEL;

    fn contains(code: &[u8], needle: &[u8]) -> bool {
        code.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn interposers_bake_in_addresses() {
        for platform in [Platform::SystemV, Platform::WindowsX64] {
            let code = interposer_routine(platform, 0xAAAA_BBBB_CCCC_DDDD, 0x1234_5678).unwrap();

            assert!(contains(&code, &0xAAAA_BBBB_CCCC_DDDDu64.to_le_bytes()));
            assert!(contains(&code, &0x1234_5678u64.to_le_bytes()));
            assert!(!contains(&code, &HOLE_SENTINEL.to_le_bytes()));
            assert_eq!(&code[..4], &[0x55, 0x48, 0x89, 0xE5]);
            assert_eq!(&code[code.len() - 2..], &[0xC9, 0xC3]);
        }
    }

    #[test]
    fn system_v_stack_arguments_are_above_the_return_address() {
        let code = interposer_routine(Platform::SystemV, 0, 0).unwrap();

        // lea rdx, [rbp + 16]
        assert!(contains(&code, &[0x48, 0x8D, 0x55, 0x10]));
    }

    #[test]
    fn windows_stack_arguments_skip_the_home_area() {
        let code = interposer_routine(Platform::WindowsX64, 0, 0).unwrap();

        // lea r8, [rbp + 48]
        assert!(contains(&code, &[0x4C, 0x8D, 0x45, 0x30]));
    }

    #[test]
    fn call_out_sets_al_only_for_system_v() {
        let sysv = call_out_routine(Platform::SystemV).unwrap();
        let win = call_out_routine(Platform::WindowsX64).unwrap();
        let mov_eax_8 = [0xB8, 0x08, 0x00, 0x00, 0x00];

        assert!(contains(&sysv, &mov_eax_8));
        assert!(!contains(&win, &mov_eax_8));
    }

    #[cfg(target_arch = "x86_64")]
    mod execution {
        use super::*;
        use crate::exec::ExecArena;

        #[allow(clippy::too_many_arguments)]
        extern "sysv64" fn sum_sysv(
            a: i64,
            b: i64,
            c: i64,
            d: i64,
            e: i64,
            f: i64,
            x: f64,
            g: i64,
            h: i64,
        ) -> i64 {
            a + b + c + d + e + f + x as i64 + g * 1000 + h * 10000
        }

        extern "win64" fn mix_win64(a: i64, x: f64, b: i64, y: f64, c: i64) -> f64 {
            a as f64 + x * 10.0 + b as f64 * 100.0 + y * 1000.0 + c as f64 * 10000.0
        }

        #[test]
        fn system_v_call_out() {
            let mut arena = ExecArena::new();
            let code = arena.write(&call_out_routine(Platform::SystemV).unwrap());
            // SAFETY: the routine takes a frame pointer in rdi, per System V
            let call_out: extern "sysv64" fn(*mut CallOutFrame) =
                unsafe { mem::transmute(code.as_ptr()) };
            let stack = [7u64, 8u64];
            let mut frame = CallOutFrame {
                target: sum_sysv as *const () as usize as u64,
                int_regs: [1, 2, 3, 4, 5, 6],
                stack: stack.as_ptr() as u64,
                num_stack: 2,
                ..CallOutFrame::default()
            };

            frame.float_regs[0] = 100.0f64.to_bits();
            call_out(&mut frame);

            assert_eq!(
                frame.ret_int as i64,
                1 + 2 + 3 + 4 + 5 + 6 + 100 + 7000 + 80000
            );
        }

        #[test]
        fn windows_call_out() {
            let mut arena = ExecArena::new();
            let code = arena.write(&call_out_routine(Platform::WindowsX64).unwrap());
            // SAFETY: the routine takes a frame pointer in rcx, per Windows x64
            let call_out: extern "win64" fn(*mut CallOutFrame) =
                unsafe { mem::transmute(code.as_ptr()) };
            let stack = [5u64];
            let mut frame = CallOutFrame {
                target: mix_win64 as *const () as usize as u64,
                stack: stack.as_ptr() as u64,
                num_stack: 1,
                ..CallOutFrame::default()
            };

            frame.int_regs[0] = 1;
            frame.float_regs[1] = 2.0f64.to_bits();
            frame.int_regs[2] = 3;
            frame.float_regs[3] = 4.0f64.to_bits();
            call_out(&mut frame);

            assert_eq!(
                f64::from_bits(frame.ret_float),
                1.0 + 20.0 + 300.0 + 4000.0 + 50000.0
            );
        }
    }
}
