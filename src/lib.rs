//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

#![deny(
    unreachable_pub,
    missing_docs,
    missing_abi,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]

//! # Ferry
//!
//! Run-time generated calling-convention trampolines for foreign function calls.
//!
//! A managed runtime that only learns the shape of a native call at configuration
//! time (how many integer, floating-point and stack-passed arguments, and what kind
//! of value comes back) describes that shape with a [`Descriptor`]. The [`Engine`]
//! clones a small precompiled machine-code template for the shape into executable
//! memory and patches the shape's constants into it. Calling the resulting [`Stub`]
//! through an ordinary function pointer lands in a generic interposing routine that
//! gathers the hardware-placed arguments into a canonical buffer (in logical order),
//! calls the real target and hands the result back in the right register.
//!
//! ```text
//!   caller ──▶ stub (patched template) ──▶ interposing routine ──▶ target
//!                 │ stages shape                 │ gathers args
//!                 ▼                              ▼
//!            StagedDescriptor            canonical args buffer
//! ```
//!
//! Classification, descriptors and template assembly are portable. Everything that
//! actually executes generated code only exists on `x86_64`.

pub mod abi;
pub mod codegen;
pub mod descriptor;
pub mod error;
pub mod exec;

#[cfg(target_arch = "x86_64")]
pub mod call;
#[cfg(target_arch = "x86_64")]
mod engine;
#[cfg(target_arch = "x86_64")]
mod interpose;

#[cfg(feature = "dev-tools")]
pub mod cli;

pub use abi::{classify, ArgType, Classification, Platform, ReturnType};
pub use codegen::TemplateId;
pub use descriptor::{Descriptor, Dispatcher, Entry, StagedDescriptor};
pub use error::{Error, Result};

#[cfg(target_arch = "x86_64")]
pub use call::{describe, CallPath, ForeignFn, NativeArg, NativeReturn, PathId, Staged};
#[cfg(target_arch = "x86_64")]
pub use engine::*;
