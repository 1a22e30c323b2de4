//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::codegen::Hole;
use crate::error::{Error, Result};
use smallvec::SmallVec;

/// The placeholder value a hole holds until it is patched.
pub const HOLE_SENTINEL: u64 = 0xcafe_babe_cafe_babe;

/// A position in a [`CodeBuffer`] that branches can refer to before it is known.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct Label(u32);

#[derive(Copy, Clone, Debug)]
enum FixupKind {
    Rel8,
    Rel32,
}

#[derive(Copy, Clone, Debug)]
struct Fixup {
    at: usize,
    label: Label,
    kind: FixupKind,
}

/// The result of assembling a [`CodeBuffer`].
#[derive(Clone, Debug)]
pub struct Assembled {
    /// The machine code
    pub code: Vec<u8>,
    /// Every hole in emission order, with the offset of its 8-byte slot
    pub holes: SmallVec<[(Hole, usize); 8]>,
}

/// A growable buffer of machine code with holes, labels and branch fixups.
///
/// Branch displacements are written as zero and resolved by [`CodeBuffer::finish`],
/// so code can jump forwards to labels that are bound later.
#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    holes: SmallVec<[(Hole, usize); 8]>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl CodeBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of bytes emitted so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing has been emitted yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Emits a single byte.
    #[inline]
    pub fn put1(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Emits raw bytes.
    #[inline]
    pub fn put(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Emits a little-endian 32-bit value.
    #[inline]
    pub fn put_i32(&mut self, value: i32) {
        self.put(&value.to_le_bytes());
    }

    /// Emits a little-endian 64-bit value.
    #[inline]
    pub fn put_u64(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }

    /// Emits a hole: an 8-byte sentinel whose offset is recorded for patching.
    pub fn put_hole(&mut self, hole: Hole) {
        self.holes.push((hole, self.len()));
        self.put_u64(HOLE_SENTINEL);
    }

    /// Creates a new, unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);

        Label(self.labels.len() as u32 - 1)
    }

    /// Binds `label` to the current position.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0 as usize].is_none(), "label bound twice");

        self.labels[label.0 as usize] = Some(self.len());
    }

    /// Emits a 1-byte displacement to `label`, relative to the end of the displacement.
    pub fn put_rel8(&mut self, label: Label) {
        self.fixups.push(Fixup {
            at: self.len(),
            label,
            kind: FixupKind::Rel8,
        });
        self.put1(0);
    }

    /// Emits a 4-byte displacement to `label`, relative to the end of the displacement.
    pub fn put_rel32(&mut self, label: Label) {
        self.fixups.push(Fixup {
            at: self.len(),
            label,
            kind: FixupKind::Rel32,
        });
        self.put_i32(0);
    }

    /// Pads with `fill` until the length is a multiple of `align`.
    pub fn align_with(&mut self, align: usize, fill: u8) {
        while self.len() % align != 0 {
            self.put1(fill);
        }
    }

    /// Resolves every branch and returns the finished code.
    pub fn finish(mut self) -> Result<Assembled> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target =
                self.labels[fixup.label.0 as usize].ok_or(Error::UnboundLabel { at: fixup.at })?;

            match fixup.kind {
                FixupKind::Rel8 => {
                    let distance = target as i64 - (fixup.at as i64 + 1);
                    let disp = i8::try_from(distance).map_err(|_| Error::BranchOutOfRange {
                        at: fixup.at,
                        distance,
                    })?;

                    self.bytes[fixup.at] = disp as u8;
                }
                FixupKind::Rel32 => {
                    let distance = target as i64 - (fixup.at as i64 + 4);
                    let disp = i32::try_from(distance).map_err(|_| Error::BranchOutOfRange {
                        at: fixup.at,
                        distance,
                    })?;

                    self.bytes[fixup.at..fixup.at + 4].copy_from_slice(&disp.to_le_bytes());
                }
            }
        }

        Ok(Assembled {
            code: self.bytes,
            holes: self.holes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holes_are_recorded() {
        let mut buf = CodeBuffer::new();

        buf.put(&[0x49, 0xBB]);
        buf.put_hole(Hole::Descriptor);
        buf.put1(0xC3);

        let asm = buf.finish().unwrap();

        assert_eq!(asm.holes.as_slice(), &[(Hole::Descriptor, 2)]);
        assert_eq!(&asm.code[2..10], &HOLE_SENTINEL.to_le_bytes());
        assert_eq!(asm.code.len(), 11);
    }

    #[test]
    fn forward_and_backward_branches() {
        let mut buf = CodeBuffer::new();
        let top = buf.new_label();
        let end = buf.new_label();

        buf.bind(top);
        buf.put1(0x90);
        buf.put1(0x73);
        buf.put_rel8(end);
        buf.put1(0xEB);
        buf.put_rel8(top);
        buf.bind(end);
        buf.put1(0xC3);

        let code = buf.finish().unwrap().code;

        // jae end: skips the 2-byte jmp
        assert_eq!(code[2], 2);
        // jmp top: back over everything so far
        assert_eq!(code[4] as i8, -5);
    }

    #[test]
    fn rel32_is_little_endian() {
        let mut buf = CodeBuffer::new();
        let end = buf.new_label();

        buf.put_rel32(end);
        buf.put(&[0xCC; 0x100]);
        buf.bind(end);

        let code = buf.finish().unwrap().code;

        assert_eq!(&code[..4], &0x100i32.to_le_bytes());
    }

    #[test]
    fn unreachable_rel8() {
        let mut buf = CodeBuffer::new();
        let end = buf.new_label();

        buf.put_rel8(end);
        buf.put(&[0xCC; 200]);
        buf.bind(end);

        assert!(matches!(
            buf.finish(),
            Err(Error::BranchOutOfRange {
                at: 0,
                distance: 200
            })
        ));
    }

    #[test]
    fn unbound_label() {
        let mut buf = CodeBuffer::new();
        let nowhere = buf.new_label();

        buf.put_rel32(nowhere);

        assert!(matches!(buf.finish(), Err(Error::UnboundLabel { at: 0 })));
    }

    #[test]
    fn alignment_padding() {
        let mut buf = CodeBuffer::new();

        buf.put(&[0x90; 3]);
        buf.align_with(8, 0xCC);

        assert_eq!(buf.len(), 8);

        buf.align_with(8, 0xCC);

        assert_eq!(buf.len(), 8);
    }
}
