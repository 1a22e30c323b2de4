//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! The foreign call site.
//!
//! This is the one place where an address of generated code becomes something
//! callable. A [`CallPath`] owns the storage a stub publishes into (the staged
//! descriptor and the canonical argument buffer). Staging a descriptor borrows the
//! path mutably and yields a [`Staged`], which is the only thing that can turn a
//! [`Stub`] into a function pointer, and only after checking that the pointer type
//! classifies exactly like the descriptor.
//!
//! ```ignore
//! let mut path = engine.call_path();
//! let stub = engine.instantiate(TemplateId::SystemV, &desc, &path)?;
//! let staged = path.stage(&desc)?;
//! let f = unsafe { staged.bind::<extern "sysv64" fn(i64) -> i64>(&stub)? };
//!
//! assert_eq!(f(42), 4201);
//! ```

use crate::abi::{classify, ArgType, Platform, ReturnType};
use crate::descriptor::{Descriptor, Entry, StagedDescriptor};
use crate::engine::{EngineShared, Stub};
use crate::error::{Error, Result};
use std::cell::Cell;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

/// A pair of routine addresses, one per calling convention.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct RoutinePair {
    pub(crate) system_v: u64,
    pub(crate) windows_x64: u64,
}

impl RoutinePair {
    pub(crate) fn get(self, platform: Platform) -> u64 {
        match platform {
            Platform::SystemV => self.system_v,
            Platform::WindowsX64 => self.windows_x64,
        }
    }
}

/// Identifies a call path for the lifetime of the process.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct PathId(pub(crate) u64);

/// The staging storage for one thread's foreign calls.
///
/// A path owns one [`StagedDescriptor`] and one canonical argument buffer. Stubs are
/// instantiated against a specific path and write into its storage when called, so
/// a path is `Send` but not `Sync`: give every thread its own path.
///
/// Dropping a path frees its interposing routines and every stub instantiated for
/// it. Function pointers bound from those must not be called afterwards.
pub struct CallPath {
    id: PathId,
    staged: NonNull<StagedDescriptor>,
    args: NonNull<u64>,
    index_list: NonNull<u64>,
    capacity: usize,
    interposers: RoutinePair,
    interposer_sizes: [usize; 2],
    call_outs: RoutinePair,
    engine: Option<Arc<EngineShared>>,
    _not_sync: PhantomData<Cell<()>>,
}

// SAFETY: the path exclusively owns its storage, the call-out routines it refers
// to live for the rest of the process, and the engine state is `Send + Sync`
unsafe impl Send for CallPath {}

fn leak_buffer(capacity: usize) -> NonNull<u64> {
    let boxed = vec![0u64; capacity.max(1)].into_boxed_slice();

    // SAFETY: Box::into_raw never returns null
    unsafe { NonNull::new_unchecked(Box::into_raw(boxed) as *mut u64) }
}

// SAFETY: `ptr` must come from `leak_buffer(capacity)` and not be used afterwards
unsafe fn free_buffer(ptr: NonNull<u64>, capacity: usize) {
    let slice = std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), capacity.max(1));

    drop(Box::from_raw(slice));
}

impl CallPath {
    pub(crate) fn new(id: PathId, capacity: usize, call_outs: RoutinePair) -> Self {
        let staged = Box::into_raw(Box::<StagedDescriptor>::default());

        Self {
            id,
            // SAFETY: Box::into_raw never returns null
            staged: unsafe { NonNull::new_unchecked(staged) },
            args: leak_buffer(capacity),
            index_list: leak_buffer(capacity),
            capacity,
            interposers: RoutinePair::default(),
            interposer_sizes: [0; 2],
            call_outs,
            engine: None,
            _not_sync: PhantomData,
        }
    }

    pub(crate) fn install_interposers(
        &mut self,
        interposers: RoutinePair,
        sizes: [usize; 2],
        engine: Arc<EngineShared>,
    ) {
        self.interposers = interposers;
        self.interposer_sizes = sizes;
        self.engine = Some(engine);
    }

    pub(crate) fn interposer(&self, platform: Platform) -> u64 {
        self.interposers.get(platform)
    }

    /// The identity stubs are checked against.
    #[inline]
    pub fn id(&self) -> PathId {
        self.id
    }

    /// The address of the staged descriptor, as patched into stubs.
    #[inline]
    pub fn staged_address(&self) -> u64 {
        self.staged.as_ptr() as u64
    }

    /// How many arguments the canonical buffer holds.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The descriptor as it was last published, by staging or by a stub.
    pub fn staged(&self) -> StagedDescriptor {
        // SAFETY: the descriptor is owned by the path and nothing writes to it
        // while we hold `&self`
        unsafe { self.staged.as_ptr().read() }
    }

    /// The whole canonical argument buffer.
    pub fn args(&self) -> &[u64] {
        // SAFETY: the buffer is `capacity` long and owned by the path
        unsafe { std::slice::from_raw_parts(self.args.as_ptr(), self.capacity) }
    }

    /// Publishes `desc` into the staged descriptor, ready for a call.
    pub fn stage<'a>(&'a mut self, desc: &'a Descriptor) -> Result<Staged<'a>> {
        let needed = desc.total_args();

        if needed > self.capacity {
            return Err(Error::BufferTooSmall {
                capacity: self.capacity,
                needed,
            });
        }

        let shape = desc.shape();
        let entry = desc.entry();

        // SAFETY: both regions are owned by the path, and `needed <= capacity`
        unsafe {
            std::ptr::copy_nonoverlapping(
                desc.index_list().as_ptr(),
                self.index_list.as_ptr(),
                needed,
            );

            self.staged.as_ptr().write(StagedDescriptor {
                num_int_args: shape.num_int_args,
                num_float_args: shape.num_float_args,
                num_mem_args: shape.num_mem_args,
                extern_index: desc.extern_index(),
                entry_point: entry.address(),
                index_list: self.index_list.as_ptr() as u64,
                args_list: self.args.as_ptr() as u64,
                return_type: desc.return_type().tag(),
                float_mask: shape.float_mask,
                entry_kind: entry.kind(),
                args_capacity: self.capacity as u64,
                call_out: self.call_outs.get(desc.platform()),
            });
        }

        log::trace!("staged {desc:?} into call path {:?}", self.id);

        Ok(Staged { path: self, desc })
    }
}

impl Drop for CallPath {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            let [system_v, windows_x64] = self.interposer_sizes;

            engine.retire(
                self.id,
                &[
                    (self.interposers.system_v, system_v),
                    (self.interposers.windows_x64, windows_x64),
                ],
            );
        }

        // SAFETY: all three came from Box::into_raw in `new` and are dropped once
        unsafe {
            drop(Box::from_raw(self.staged.as_ptr()));
            free_buffer(self.args, self.capacity);
            free_buffer(self.index_list, self.capacity);
        }
    }
}

/// A call path with a descriptor staged into it.
pub struct Staged<'a> {
    path: &'a mut CallPath,
    desc: &'a Descriptor,
}

impl<'a> Staged<'a> {
    /// The descriptor that was staged.
    #[inline]
    pub fn descriptor(&self) -> &Descriptor {
        self.desc
    }

    /// The first `total_args` values of the canonical buffer, in logical order.
    pub fn args(&self) -> &[u64] {
        &self.path.args()[..self.desc.total_args()]
    }

    fn check_signature<F: ForeignFn>(&self) -> Result<()> {
        let mismatch = Error::SignatureMismatch {
            ty: std::any::type_name::<F>(),
        };

        if F::PLATFORM != self.desc.platform() {
            return Err(mismatch);
        }

        let c = classify(F::ARGS, F::PLATFORM);

        if c.shape != self.desc.shape() || c.index_list.as_slice() != self.desc.index_list() {
            return Err(mismatch);
        }

        match F::RETURN {
            ReturnType::Void => Ok(()),
            ret if ret.is_float() == self.desc.return_type().is_float() => Ok(()),
            _ => Err(mismatch),
        }
    }

    /// Turns `stub` into a callable function pointer of type `F`.
    ///
    /// # Errors
    ///
    /// Fails if the stub belongs to another path, was generated for a different
    /// shape, or if `F` does not classify exactly like the staged descriptor.
    ///
    /// # Safety
    ///
    /// The returned pointer writes into this path's storage and uses whatever is
    /// staged there at the time it is called. It must only be called while this
    /// descriptor (or one with an identical entry point) is staged, never
    /// concurrently with another call on the same path, and never after the path
    /// has been dropped.
    pub unsafe fn bind<F: ForeignFn>(&self, stub: &Stub) -> Result<F> {
        if stub.path() != self.path.id() {
            return Err(Error::ForeignStub);
        }

        if !stub.matches(self.desc) {
            return Err(Error::StubMismatch);
        }

        self.check_signature::<F>()?;

        Ok(F::from_address(stub.address()))
    }

    /// Gets the path's interposing routine as a function pointer of type `F`.
    ///
    /// Without a stub, nothing publishes a shape before the routine runs, so it
    /// reads everything (including the index list) from what was staged.
    ///
    /// # Safety
    ///
    /// Same as [`Staged::bind`].
    pub unsafe fn bind_interposer<F: ForeignFn>(&self) -> Result<F> {
        self.check_signature::<F>()?;

        let address = self.path.interposer(self.desc.platform());

        Ok(F::from_address(address as *const u8))
    }
}

/// A type that can be passed to a foreign function in a single 8-byte slot.
///
/// # Safety
///
/// `TYPE` must match how the calling conventions pass the type.
pub unsafe trait NativeArg: Copy {
    /// How the type is classified
    const TYPE: ArgType;
}

/// A type that can be returned from a foreign function.
///
/// # Safety
///
/// `RETURN` must match the register and width the type is returned in.
pub unsafe trait NativeReturn {
    /// How the type is returned
    const RETURN: ReturnType;
}

macro_rules! native_args {
    ($class:expr => $($ty:ty),*) => {
        $(
            unsafe impl NativeArg for $ty {
                const TYPE: ArgType = $class;
            }
        )*
    };
}

macro_rules! native_returns {
    ($ret:expr => $($ty:ty),*) => {
        $(
            unsafe impl NativeReturn for $ty {
                const RETURN: ReturnType = $ret;
            }
        )*
    };
}

native_args!(ArgType::Int => bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);
native_args!(ArgType::Float => f32, f64);
native_returns!(ReturnType::Int32 => bool, i8, i16, i32, u8, u16, u32);
native_returns!(ReturnType::Int64 => i64, isize, u64, usize);
native_returns!(ReturnType::Float32 => f32);
native_returns!(ReturnType::Float64 => f64);
native_returns!(ReturnType::Void => ());

unsafe impl<T> NativeArg for *const T {
    const TYPE: ArgType = ArgType::Int;
}

unsafe impl<T> NativeArg for *mut T {
    const TYPE: ArgType = ArgType::Int;
}

unsafe impl<T> NativeReturn for *const T {
    const RETURN: ReturnType = ReturnType::Int64;
}

unsafe impl<T> NativeReturn for *mut T {
    const RETURN: ReturnType = ReturnType::Int64;
}

/// A function pointer type a stub can be bound to.
///
/// Implemented for `extern "sysv64"` and `extern "win64"` function pointers (safe
/// and `unsafe`) taking up to 12 [`NativeArg`]s and returning a [`NativeReturn`].
///
/// # Safety
///
/// `PLATFORM`, `ARGS` and `RETURN` must describe exactly how the pointer is called.
pub unsafe trait ForeignFn: Copy {
    /// The calling convention of the pointer
    const PLATFORM: Platform;
    /// The classes of the parameters, in order
    const ARGS: &'static [ArgType];
    /// How the result comes back
    const RETURN: ReturnType;

    /// Reinterprets a code address as this function pointer type.
    ///
    /// # Safety
    ///
    /// `addr` must be the entry point of code that implements this signature.
    unsafe fn from_address(addr: *const u8) -> Self;
}

macro_rules! foreign_fn {
    ($abi:tt, $platform:expr; $($arg:ident),*) => {
        unsafe impl<R: NativeReturn, $($arg: NativeArg),*> ForeignFn for extern $abi fn($($arg),*) -> R {
            const PLATFORM: Platform = $platform;
            const ARGS: &'static [ArgType] = &[$(<$arg as NativeArg>::TYPE),*];
            const RETURN: ReturnType = R::RETURN;

            unsafe fn from_address(addr: *const u8) -> Self {
                mem::transmute_copy::<*const u8, Self>(&addr)
            }
        }

        unsafe impl<R: NativeReturn, $($arg: NativeArg),*> ForeignFn for unsafe extern $abi fn($($arg),*) -> R {
            const PLATFORM: Platform = $platform;
            const ARGS: &'static [ArgType] = &[$(<$arg as NativeArg>::TYPE),*];
            const RETURN: ReturnType = R::RETURN;

            unsafe fn from_address(addr: *const u8) -> Self {
                mem::transmute_copy::<*const u8, Self>(&addr)
            }
        }
    };
}

macro_rules! foreign_fns {
    ($($arg:ident),*) => {
        foreign_fn!("sysv64", Platform::SystemV; $($arg),*);
        foreign_fn!("win64", Platform::WindowsX64; $($arg),*);
    };
}

foreign_fns!();
foreign_fns!(A0);
foreign_fns!(A0, A1);
foreign_fns!(A0, A1, A2);
foreign_fns!(A0, A1, A2, A3);
foreign_fns!(A0, A1, A2, A3, A4);
foreign_fns!(A0, A1, A2, A3, A4, A5);
foreign_fns!(A0, A1, A2, A3, A4, A5, A6);
foreign_fns!(A0, A1, A2, A3, A4, A5, A6, A7);
foreign_fns!(A0, A1, A2, A3, A4, A5, A6, A7, A8);
foreign_fns!(A0, A1, A2, A3, A4, A5, A6, A7, A8, A9);
foreign_fns!(A0, A1, A2, A3, A4, A5, A6, A7, A8, A9, A10);
foreign_fns!(A0, A1, A2, A3, A4, A5, A6, A7, A8, A9, A10, A11);

/// Builds a descriptor for the signature of `F`.
pub fn describe<F: ForeignFn>(extern_index: u64, entry: Entry) -> Result<Descriptor> {
    Descriptor::new(F::PLATFORM, F::ARGS, F::RETURN, extern_index, entry)
}
