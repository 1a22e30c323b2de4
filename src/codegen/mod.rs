//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Machine code for stubs and the routines around them.
//!
//! Nothing in here executes generated code, it only produces bytes. Templates are
//! assembled once with named holes, and instantiating one is a matter of copying the
//! bytes and patching the holes in order. Anything in [`x86_64`] is CPU-specific.

mod buffer;
mod routines;
mod template;
pub mod x86_64;

pub use buffer::*;
pub use routines::*;
pub use template::*;
