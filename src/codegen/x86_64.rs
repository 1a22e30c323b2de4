//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! A tiny x86-64 encoder.
//!
//! This covers exactly the instructions that trampolines and their helper routines
//! need: moves between registers and memory, a handful of ALU operations, calls,
//! jumps and the odd SSE move. Everything is 64-bit unless the name says otherwise.

use crate::codegen::{Assembled, CodeBuffer, Hole, Label};
use crate::error::Result;

/// A general-purpose register, by hardware encoding.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct Gpr(u8);

impl Gpr {
    /// `rax`
    pub const RAX: Gpr = Gpr(0);
    /// `rcx`
    pub const RCX: Gpr = Gpr(1);
    /// `rdx`
    pub const RDX: Gpr = Gpr(2);
    /// `rbx`
    pub const RBX: Gpr = Gpr(3);
    /// `rsp`
    pub const RSP: Gpr = Gpr(4);
    /// `rbp`
    pub const RBP: Gpr = Gpr(5);
    /// `rsi`
    pub const RSI: Gpr = Gpr(6);
    /// `rdi`
    pub const RDI: Gpr = Gpr(7);
    /// `r8`
    pub const R8: Gpr = Gpr(8);
    /// `r9`
    pub const R9: Gpr = Gpr(9);
    /// `r10`
    pub const R10: Gpr = Gpr(10);
    /// `r11`
    pub const R11: Gpr = Gpr(11);
    /// `r12`
    pub const R12: Gpr = Gpr(12);
    /// `r13`
    pub const R13: Gpr = Gpr(13);
    /// `r14`
    pub const R14: Gpr = Gpr(14);
    /// `r15`
    pub const R15: Gpr = Gpr(15);

    #[inline]
    const fn low(self) -> u8 {
        self.0 & 7
    }

    #[inline]
    const fn high(self) -> bool {
        self.0 >= 8
    }
}

/// An SSE register, by hardware encoding.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct Xmm(u8);

impl Xmm {
    /// Gets `xmm<n>`. `n` must be less than 16.
    pub const fn new(n: u8) -> Self {
        assert!(n < 16, "there are only 16 xmm registers");

        Self(n)
    }

    #[inline]
    const fn low(self) -> u8 {
        self.0 & 7
    }

    #[inline]
    const fn high(self) -> bool {
        self.0 >= 8
    }
}

/// A memory operand: `[base + index * 8 + disp]`, where `base` and `index` are optional.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mem {
    base: Option<Gpr>,
    index: Option<Gpr>,
    disp: i32,
}

impl Mem {
    /// `[base + disp]`
    pub const fn base(base: Gpr, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            disp,
        }
    }

    /// `[base + index * 8 + disp]`. `index` cannot be `rsp`.
    pub const fn indexed(base: Gpr, index: Gpr, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            disp,
        }
    }

    /// `[index * 8 + disp]`, with no base register. `index` cannot be `rsp`.
    pub const fn scaled(index: Gpr, disp: i32) -> Self {
        Self {
            base: None,
            index: Some(index),
            disp,
        }
    }

    fn rex_bits(self) -> u8 {
        let x = match self.index {
            Some(r) if r.high() => REX_X,
            _ => 0,
        };

        x | self.base.map_or(0, |r| rex_b(r.high()))
    }
}

const REX: u8 = 0x40;
const REX_W: u8 = 0x08;
const REX_R: u8 = 0x04;
const REX_X: u8 = 0x02;
const REX_B: u8 = 0x01;

const fn rex_r(high: bool) -> u8 {
    if high {
        REX_R
    } else {
        0
    }
}

const fn rex_b(high: bool) -> u8 {
    if high {
        REX_B
    } else {
        0
    }
}

// sib.scale for `* 8`
const SCALE_8: u8 = 0b11;

const fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Emits x86-64 instructions into a [`CodeBuffer`].
#[derive(Default)]
pub struct Assembler {
    buf: CodeBuffer,
}

impl Assembler {
    /// Creates an assembler with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new unbound label.
    pub fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    /// Binds `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        self.buf.bind(label)
    }

    /// Pads with `int3` until the code is a multiple of `align` bytes long.
    pub fn align_with_int3(&mut self, align: usize) {
        self.buf.align_with(align, 0xCC)
    }

    /// Resolves all branches and hands back the code.
    pub fn finish(self) -> Result<Assembled> {
        self.buf.finish()
    }

    fn rex(&mut self, bits: u8) {
        if bits != 0 {
            self.buf.put1(REX | bits);
        }
    }

    fn rex_w(&mut self, bits: u8) {
        self.buf.put1(REX | REX_W | bits);
    }

    // modrm + sib + displacement for a memory operand, with `reg` in modrm.reg
    fn mem_operand(&mut self, reg: u8, mem: Mem) {
        let disp8 = i8::try_from(mem.disp).ok();

        match (mem.base, mem.index) {
            (None, Some(index)) => {
                self.buf.put1(modrm(0b00, reg, 0b100));
                self.buf.put1(modrm(SCALE_8, index.low(), 0b101));
                self.buf.put_i32(mem.disp);
            }
            (Some(base), index) => {
                // rbp/r13 have no mod=00 form, they always need a displacement
                let md = match disp8 {
                    Some(0) if base.low() != 0b101 => 0b00,
                    Some(_) => 0b01,
                    None => 0b10,
                };

                // rsp/r12 as a base can only be encoded with a sib byte
                match index {
                    Some(index) => {
                        self.buf.put1(modrm(md, reg, 0b100));
                        self.buf.put1(modrm(SCALE_8, index.low(), base.low()));
                    }
                    None if base.low() == 0b100 => {
                        self.buf.put1(modrm(md, reg, 0b100));
                        self.buf.put1(modrm(0b00, 0b100, base.low()));
                    }
                    None => self.buf.put1(modrm(md, reg, base.low())),
                }

                match md {
                    0b01 => self.buf.put1(mem.disp as i8 as u8),
                    0b10 => self.buf.put_i32(mem.disp),
                    _ => {}
                }
            }
            (None, None) => unreachable!("memory operand needs a base or an index"),
        }
    }

    /// `push r64`
    pub fn push(&mut self, reg: Gpr) {
        self.rex(rex_b(reg.high()));
        self.buf.put1(0x50 + reg.low());
    }

    /// `pop r64`
    pub fn pop(&mut self, reg: Gpr) {
        self.rex(rex_b(reg.high()));
        self.buf.put1(0x58 + reg.low());
    }

    /// `mov dst, src`
    pub fn mov(&mut self, dst: Gpr, src: Gpr) {
        self.rex_w(rex_r(src.high()) | rex_b(dst.high()));
        self.buf.put1(0x89);
        self.buf.put1(modrm(0b11, src.low(), dst.low()));
    }

    /// `mov dst, qword ptr [mem]`
    pub fn load(&mut self, dst: Gpr, mem: Mem) {
        self.rex_w(rex_r(dst.high()) | mem.rex_bits());
        self.buf.put1(0x8B);
        self.mem_operand(dst.low(), mem);
    }

    /// `mov qword ptr [mem], src`
    pub fn store(&mut self, mem: Mem, src: Gpr) {
        self.rex_w(rex_r(src.high()) | mem.rex_bits());
        self.buf.put1(0x89);
        self.mem_operand(src.low(), mem);
    }

    /// `lea dst, [mem]`
    pub fn lea(&mut self, dst: Gpr, mem: Mem) {
        self.rex_w(rex_r(dst.high()) | mem.rex_bits());
        self.buf.put1(0x8D);
        self.mem_operand(dst.low(), mem);
    }

    /// `lea dst, [rip + label]`
    pub fn lea_label(&mut self, dst: Gpr, label: Label) {
        self.rex_w(rex_r(dst.high()));
        self.buf.put1(0x8D);
        self.buf.put1(modrm(0b00, dst.low(), 0b101));
        self.buf.put_rel32(label);
    }

    /// `movabs dst, imm64`
    pub fn movabs(&mut self, dst: Gpr, imm: u64) {
        self.rex_w(rex_b(dst.high()));
        self.buf.put1(0xB8 + dst.low());
        self.buf.put_u64(imm);
    }

    /// `movabs dst, <hole>`, leaving the immediate to be patched later.
    pub fn movabs_hole(&mut self, dst: Gpr, hole: Hole) {
        self.rex_w(rex_b(dst.high()));
        self.buf.put1(0xB8 + dst.low());
        self.buf.put_hole(hole);
    }

    /// `mov r32, imm32` (zero-extends into the full register)
    pub fn mov32_imm(&mut self, dst: Gpr, imm: u32) {
        self.rex(rex_b(dst.high()));
        self.buf.put1(0xB8 + dst.low());
        self.buf.put(&imm.to_le_bytes());
    }

    /// `xor r32, r32`
    pub fn xor32(&mut self, dst: Gpr, src: Gpr) {
        self.rex(rex_r(src.high()) | rex_b(dst.high()));
        self.buf.put1(0x31);
        self.buf.put1(modrm(0b11, src.low(), dst.low()));
    }

    /// `and dst, imm8` (sign-extended)
    pub fn and_imm8(&mut self, dst: Gpr, imm: i8) {
        self.rex_w(rex_b(dst.high()));
        self.buf.put1(0x83);
        self.buf.put1(modrm(0b11, 4, dst.low()));
        self.buf.put1(imm as u8);
    }

    /// `sub dst, imm`
    pub fn sub_imm(&mut self, dst: Gpr, imm: i32) {
        self.rex_w(rex_b(dst.high()));

        match i8::try_from(imm) {
            Ok(imm) => {
                self.buf.put1(0x83);
                self.buf.put1(modrm(0b11, 5, dst.low()));
                self.buf.put1(imm as u8);
            }
            Err(_) => {
                self.buf.put1(0x81);
                self.buf.put1(modrm(0b11, 5, dst.low()));
                self.buf.put_i32(imm);
            }
        }
    }

    /// `sub dst, src`
    pub fn sub(&mut self, dst: Gpr, src: Gpr) {
        self.rex_w(rex_r(src.high()) | rex_b(dst.high()));
        self.buf.put1(0x29);
        self.buf.put1(modrm(0b11, src.low(), dst.low()));
    }

    /// `cmp lhs, rhs`
    pub fn cmp(&mut self, lhs: Gpr, rhs: Gpr) {
        self.rex_w(rex_r(rhs.high()) | rex_b(lhs.high()));
        self.buf.put1(0x39);
        self.buf.put1(modrm(0b11, rhs.low(), lhs.low()));
    }

    /// `inc r64`
    pub fn inc(&mut self, reg: Gpr) {
        self.rex_w(rex_b(reg.high()));
        self.buf.put1(0xFF);
        self.buf.put1(modrm(0b11, 0, reg.low()));
    }

    /// `call r64`
    pub fn call(&mut self, target: Gpr) {
        self.rex(rex_b(target.high()));
        self.buf.put1(0xFF);
        self.buf.put1(modrm(0b11, 2, target.low()));
    }

    /// `jmp r64`
    pub fn jmp(&mut self, target: Gpr) {
        self.rex(rex_b(target.high()));
        self.buf.put1(0xFF);
        self.buf.put1(modrm(0b11, 4, target.low()));
    }

    /// `jmp rel8 label`
    pub fn jmp_short(&mut self, label: Label) {
        self.buf.put1(0xEB);
        self.buf.put_rel8(label);
    }

    /// `jae rel8 label`
    pub fn jae_short(&mut self, label: Label) {
        self.buf.put1(0x73);
        self.buf.put_rel8(label);
    }

    /// `movsd xmm, qword ptr [mem]`
    pub fn load_sd(&mut self, dst: Xmm, mem: Mem) {
        self.buf.put1(0xF2);
        self.rex(rex_r(dst.high()) | mem.rex_bits());
        self.buf.put(&[0x0F, 0x10]);
        self.mem_operand(dst.low(), mem);
    }

    /// `movsd qword ptr [mem], xmm`
    pub fn store_sd(&mut self, mem: Mem, src: Xmm) {
        self.buf.put1(0xF2);
        self.rex(rex_r(src.high()) | mem.rex_bits());
        self.buf.put(&[0x0F, 0x11]);
        self.mem_operand(src.low(), mem);
    }

    /// `movq xmm, r64`
    pub fn movq_to_xmm(&mut self, dst: Xmm, src: Gpr) {
        self.buf.put1(0x66);
        self.rex_w(rex_r(dst.high()) | rex_b(src.high()));
        self.buf.put(&[0x0F, 0x6E]);
        self.buf.put1(modrm(0b11, dst.low(), src.low()));
    }

    /// `leave`
    pub fn leave(&mut self) {
        self.buf.put1(0xC9);
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.buf.put1(0xC3);
    }

    /// `int3`
    pub fn int3(&mut self) {
        self.buf.put1(0xCC);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut asm = Assembler::new();

        f(&mut asm);

        asm.finish().unwrap().code
    }

    #[test]
    fn push_pop() {
        assert_eq!(encode(|a| a.push(Gpr::RBP)), [0x55]);
        assert_eq!(encode(|a| a.push(Gpr::R12)), [0x41, 0x54]);
        assert_eq!(encode(|a| a.pop(Gpr::RBX)), [0x5B]);
        assert_eq!(encode(|a| a.pop(Gpr::R12)), [0x41, 0x5C]);
    }

    #[test]
    fn extended_registers() {
        assert_eq!(encode(|a| a.push(Gpr::R13)), [0x41, 0x55]);
        assert_eq!(encode(|a| a.push(Gpr::R14)), [0x41, 0x56]);
        assert_eq!(encode(|a| a.pop(Gpr::R15)), [0x41, 0x5F]);
        // mov r14, rax
        assert_eq!(encode(|a| a.mov(Gpr::R14, Gpr::RAX)), [0x49, 0x89, 0xC6]);
        // mov rax, [r13], which needs an explicit zero displacement
        assert_eq!(
            encode(|a| a.load(Gpr::RAX, Mem::base(Gpr::R13, 0))),
            [0x49, 0x8B, 0x45, 0x00]
        );
        // mov [r12], r15, which needs a sib byte
        assert_eq!(
            encode(|a| a.store(Mem::base(Gpr::R12, 0), Gpr::R15)),
            [0x4D, 0x89, 0x3C, 0x24]
        );
    }

    #[test]
    fn register_moves() {
        // mov rbp, rsp
        assert_eq!(encode(|a| a.mov(Gpr::RBP, Gpr::RSP)), [0x48, 0x89, 0xE5]);
        // mov rsi, rsp
        assert_eq!(encode(|a| a.mov(Gpr::RSI, Gpr::RSP)), [0x48, 0x89, 0xE6]);
        // mov r11, r8
        assert_eq!(encode(|a| a.mov(Gpr::R11, Gpr::R8)), [0x4D, 0x89, 0xC3]);
    }

    #[test]
    fn loads_and_stores() {
        // mov [rsp], rdi
        assert_eq!(
            encode(|a| a.store(Mem::base(Gpr::RSP, 0), Gpr::RDI)),
            [0x48, 0x89, 0x3C, 0x24]
        );
        // mov [rsp + 40], r9
        assert_eq!(
            encode(|a| a.store(Mem::base(Gpr::RSP, 40), Gpr::R9)),
            [0x4C, 0x89, 0x4C, 0x24, 0x28]
        );
        // mov [r11 + 8], rax
        assert_eq!(
            encode(|a| a.store(Mem::base(Gpr::R11, 8), Gpr::RAX)),
            [0x49, 0x89, 0x43, 0x08]
        );
        // mov [r11], rax
        assert_eq!(
            encode(|a| a.store(Mem::base(Gpr::R11, 0), Gpr::RAX)),
            [0x49, 0x89, 0x03]
        );
        // mov rcx, [rbx + 128]
        assert_eq!(
            encode(|a| a.load(Gpr::RCX, Mem::base(Gpr::RBX, 128))),
            [0x48, 0x8B, 0x8B, 0x80, 0x00, 0x00, 0x00]
        );
        // mov rax, [rbp]
        assert_eq!(
            encode(|a| a.load(Gpr::RAX, Mem::base(Gpr::RBP, 0))),
            [0x48, 0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn indexed_operands() {
        // mov rax, [r10 + rdx*8]
        assert_eq!(
            encode(|a| a.load(Gpr::RAX, Mem::indexed(Gpr::R10, Gpr::RDX, 0))),
            [0x49, 0x8B, 0x04, 0xD2]
        );
        // mov [rsp + rdx*8 + 32], rax
        assert_eq!(
            encode(|a| a.store(Mem::indexed(Gpr::RSP, Gpr::RDX, 32), Gpr::RAX)),
            [0x48, 0x89, 0x44, 0xD4, 0x20]
        );
        // lea rax, [rcx*8 + 15]
        assert_eq!(
            encode(|a| a.lea(Gpr::RAX, Mem::scaled(Gpr::RCX, 15))),
            [0x48, 0x8D, 0x04, 0xCD, 0x0F, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn lea_forms() {
        // lea rdx, [rbp + 16]
        assert_eq!(
            encode(|a| a.lea(Gpr::RDX, Mem::base(Gpr::RBP, 16))),
            [0x48, 0x8D, 0x55, 0x10]
        );
        // lea rsp, [rbp - 16]
        assert_eq!(
            encode(|a| a.lea(Gpr::RSP, Mem::base(Gpr::RBP, -16))),
            [0x48, 0x8D, 0x65, 0xF0]
        );
        // lea rax, [rip + 0]
        assert_eq!(
            encode(|a| {
                let l = a.new_label();

                a.lea_label(Gpr::RAX, l);
                a.bind(l);
            }),
            [0x48, 0x8D, 0x05, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn immediates() {
        assert_eq!(
            encode(|a| a.movabs(Gpr::RAX, 0x1122_3344_5566_7788)),
            [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(encode(|a| a.movabs(Gpr::R11, 0))[..2], [0x49, 0xBB]);
        assert_eq!(encode(|a| a.mov32_imm(Gpr::RAX, 8)), [0xB8, 8, 0, 0, 0]);
        assert_eq!(encode(|a| a.xor32(Gpr::RDX, Gpr::RDX)), [0x31, 0xD2]);
        assert_eq!(
            encode(|a| a.and_imm8(Gpr::RAX, -16)),
            [0x48, 0x83, 0xE0, 0xF0]
        );
        assert_eq!(
            encode(|a| a.sub_imm(Gpr::RSP, 112)),
            [0x48, 0x83, 0xEC, 0x70]
        );
        assert_eq!(
            encode(|a| a.sub_imm(Gpr::RSP, 256)),
            [0x48, 0x81, 0xEC, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(encode(|a| a.sub(Gpr::RSP, Gpr::RAX)), [0x48, 0x29, 0xC4]);
        assert_eq!(encode(|a| a.cmp(Gpr::RDX, Gpr::RCX)), [0x48, 0x39, 0xCA]);
        assert_eq!(encode(|a| a.inc(Gpr::RDX)), [0x48, 0xFF, 0xC2]);
    }

    #[test]
    fn control_flow() {
        assert_eq!(encode(|a| a.call(Gpr::RAX)), [0xFF, 0xD0]);
        assert_eq!(encode(|a| a.call(Gpr::R11)), [0x41, 0xFF, 0xD3]);
        assert_eq!(encode(|a| a.jmp(Gpr::R10)), [0x41, 0xFF, 0xE2]);
        assert_eq!(encode(|a| a.leave()), [0xC9]);
        assert_eq!(encode(|a| a.ret()), [0xC3]);
        assert_eq!(encode(|a| a.int3()), [0xCC]);
    }

    #[test]
    fn sse_moves() {
        // movsd [rsp + 48], xmm0
        assert_eq!(
            encode(|a| a.store_sd(Mem::base(Gpr::RSP, 48), Xmm::new(0))),
            [0xF2, 0x0F, 0x11, 0x44, 0x24, 0x30]
        );
        // movsd xmm7, [rbx + 112]
        assert_eq!(
            encode(|a| a.load_sd(Xmm::new(7), Mem::base(Gpr::RBX, 112))),
            [0xF2, 0x0F, 0x10, 0x7B, 0x70]
        );
        // movq xmm0, rax
        assert_eq!(
            encode(|a| a.movq_to_xmm(Xmm::new(0), Gpr::RAX)),
            [0x66, 0x48, 0x0F, 0x6E, 0xC0]
        );
    }
}
