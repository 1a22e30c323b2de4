//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::abi::{Platform, ReturnType, Shape};
use crate::call::{CallPath, PathId, RoutinePair};
use crate::codegen::{self, HoleValues, Template, TemplateId};
use crate::descriptor::Descriptor;
use crate::error::{fatal, Error, Result};
use crate::exec::ExecArena;
use crate::interpose::{self, interpose_sysv, interpose_win64};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

type StubMap = HashMap<StubKey, Stub, ahash::RandomState>;

static NEXT_PATH: AtomicU64 = AtomicU64::new(0);

/// Tunables for an [`Engine`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct EngineOptions {
    /// Size of every executable region the engine maps, rounded up to pages
    pub region_size: usize,
    /// Capacity of the canonical buffer of every call path
    pub args_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            region_size: ExecArena::DEFAULT_REGION_SIZE,
            args_capacity: 64,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct StubKey {
    path: PathId,
    template: TemplateId,
    shape: Shape,
    extern_index: u64,
    return_type: ReturnType,
    index_list: SmallVec<[u64; 8]>,
}

/// An instantiated stub, living in executable memory.
///
/// The code never moves and lives as long as the call path it publishes into, so a
/// stub can be copied around freely. It is only ever called through a function
/// pointer obtained from [`Staged::bind`](crate::Staged::bind).
#[derive(Clone, Debug)]
pub struct Stub {
    address: usize,
    size: usize,
    key: StubKey,
}

impl Stub {
    /// The entry point of the stub.
    #[inline]
    pub fn address(&self) -> *const u8 {
        self.address as *const u8
    }

    /// Size of the code and its index list, in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The template the stub was built from.
    #[inline]
    pub fn template(&self) -> TemplateId {
        self.key.template
    }

    /// The shape baked into the stub.
    #[inline]
    pub fn shape(&self) -> Shape {
        self.key.shape
    }

    /// The call path the stub publishes into.
    #[inline]
    pub fn path(&self) -> PathId {
        self.key.path
    }

    /// Whether the stub publishes exactly what `desc` would stage.
    pub fn matches(&self, desc: &Descriptor) -> bool {
        self.key.template.platform() == desc.platform()
            && self.key.shape == desc.shape()
            && self.key.extern_index == desc.extern_index()
            && self.key.return_type == desc.return_type()
            && self.key.index_list.as_slice() == desc.index_list()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn or_fatal<T>(result: Result<T>) -> T {
    result.unwrap_or_else(|e| fatal(&e))
}

/// The part of an engine that call paths keep alive.
///
/// Locks are always taken stubs first, then arena.
pub(crate) struct EngineShared {
    arena: Mutex<ExecArena>,
    stubs: Mutex<StubMap>,
}

impl EngineShared {
    /// Evicts every stub instantiated for `path` and gives their memory back to the
    /// arena, along with the path's own `routines` (address and size).
    pub(crate) fn retire(&self, path: PathId, routines: &[(u64, usize)]) {
        let mut stubs = lock(&self.stubs);
        let mut arena = lock(&self.arena);
        let mut evicted = Vec::new();

        stubs.retain(|key, stub| {
            let keep = key.path != path;

            if !keep {
                evicted.push((stub.address as u64, stub.size));
            }

            keep
        });

        for &(address, size) in evicted.iter().chain(routines) {
            if let Some(ptr) = NonNull::new(address as *mut u8) {
                // SAFETY: every address came from `arena.write` with this size, and
                // the path that could reach it is being dropped
                unsafe { arena.release(ptr, size) }
            }
        }

        log::debug!(
            "retired call path {path:?} and {} of its stubs",
            evicted.len()
        );
    }
}

/// Owns everything needed to generate trampolines: the templates, the executable
/// memory, and the routines every call path shares.
///
/// Engines are `Send + Sync`. Executable memory is never unmapped. Every call path
/// keeps the engine's arena alive, and gives its interposing routines and stubs
/// back to it when dropped, so paths outlive the engine that made them safely.
pub struct Engine {
    options: EngineOptions,
    templates: [Template; 2],
    call_outs: RoutinePair,
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Creates an engine with default options.
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    /// Creates an engine, building both templates and the call-out routines.
    ///
    /// Failing to assemble a template or to map memory for the routines is fatal.
    pub fn with_options(options: EngineOptions) -> Self {
        let build = |id| or_fatal(Template::build(id));
        let routine = |platform| or_fatal(codegen::call_out_routine(platform));
        let templates = [build(TemplateId::SystemV), build(TemplateId::WindowsX64)];
        let mut arena = ExecArena::with_region_size(options.region_size);
        let call_outs = RoutinePair {
            system_v: arena.write(&routine(Platform::SystemV)).as_ptr() as u64,
            windows_x64: arena.write(&routine(Platform::WindowsX64)).as_ptr() as u64,
        };

        log::debug!(
            "built templates ({} and {} bytes of code)",
            templates[0].code_size(),
            templates[1].code_size()
        );

        Self {
            options,
            templates,
            call_outs,
            shared: Arc::new(EngineShared {
                arena: Mutex::new(arena),
                stubs: Mutex::new(StubMap::default()),
            }),
        }
    }

    /// The options the engine was created with.
    #[inline]
    pub fn options(&self) -> EngineOptions {
        self.options
    }

    /// Gets one of the precompiled templates.
    pub fn template(&self, id: TemplateId) -> &Template {
        match id {
            TemplateId::SystemV => &self.templates[0],
            TemplateId::WindowsX64 => &self.templates[1],
        }
    }

    /// Creates a call path with the default argument capacity.
    pub fn call_path(&self) -> CallPath {
        self.call_path_with_capacity(self.options.args_capacity)
    }

    /// Creates a call path whose canonical buffer holds `capacity` arguments.
    ///
    /// Every path gets its own pair of interposing routines with the address of its
    /// staged descriptor baked in. Dropping the path frees them, along with every
    /// stub instantiated for it.
    pub fn call_path_with_capacity(&self, capacity: usize) -> CallPath {
        let id = PathId(NEXT_PATH.fetch_add(1, Ordering::Relaxed));
        let mut path = CallPath::new(id, capacity, self.call_outs);
        let staged = path.staged_address();
        let routine = |platform, entry: *const ()| {
            or_fatal(codegen::interposer_routine(platform, staged, entry as usize as u64))
        };

        let system_v = routine(Platform::SystemV, interpose_sysv as *const ());
        let windows_x64 = routine(Platform::WindowsX64, interpose_win64 as *const ());

        let mut arena = lock(&self.shared.arena);
        let interposers = RoutinePair {
            system_v: arena.write(&system_v).as_ptr() as u64,
            windows_x64: arena.write(&windows_x64).as_ptr() as u64,
        };

        path.install_interposers(
            interposers,
            [system_v.len(), windows_x64.len()],
            Arc::clone(&self.shared),
        );

        log::debug!("created call path {id:?} with room for {capacity} arguments");

        path
    }

    /// Instantiates template `id` for `desc`, publishing into `path`.
    ///
    /// Requests that the template cannot express are rejected before any memory is
    /// touched. Stubs are cached, asking twice for the same thing returns the same
    /// code.
    pub fn instantiate(&self, id: TemplateId, desc: &Descriptor, path: &CallPath) -> Result<Stub> {
        if id.platform() != desc.platform() {
            return Err(Error::TemplateMismatch {
                template: id,
                platform: desc.platform(),
            });
        }

        let template = self.template(id);

        template.admit(desc.shape())?;

        if desc.total_args() > path.capacity() {
            return Err(Error::BufferTooSmall {
                capacity: path.capacity(),
                needed: desc.total_args(),
            });
        }

        let key = StubKey {
            path: path.id(),
            template: id,
            shape: desc.shape(),
            extern_index: desc.extern_index(),
            return_type: desc.return_type(),
            index_list: SmallVec::from_slice(desc.index_list()),
        };

        let mut stubs = lock(&self.shared.stubs);

        if let Some(stub) = stubs.get(&key) {
            log::debug!("reusing stub at {:#x} for {desc:?}", stub.address);

            return Ok(stub.clone());
        }

        let values = HoleValues {
            descriptor: path.staged_address(),
            interposer: path.interposer(desc.platform()),
            shape: desc.shape(),
            extern_index: desc.extern_index(),
            return_type: desc.return_type(),
        };

        let image = or_fatal(template.instantiate_image(&values, desc.index_list()));
        let address = lock(&self.shared.arena).write(&image).as_ptr() as usize;

        log::debug!(
            "instantiated {id:?} stub at {address:#x} ({} bytes) for {desc:?}",
            image.len()
        );

        let stub = Stub {
            address,
            size: image.len(),
            key: key.clone(),
        };

        stubs.insert(key, stub.clone());

        Ok(stub)
    }

    /// Bytes of executable memory mapped, and how many of them are in use.
    pub fn stats(&self) -> (usize, usize) {
        lock(&self.shared.arena).stats()
    }

    /// Number of stubs currently cached, across every live call path.
    pub fn stub_count(&self) -> usize {
        lock(&self.shared.stubs).len()
    }

    /// Calls the native function at `target` with `args` in logical order, using
    /// the calling convention and shape of `desc`.
    ///
    /// # Safety
    ///
    /// `target` must be a function with exactly the signature `desc` describes.
    pub unsafe fn call_native(
        &self,
        desc: &Descriptor,
        target: usize,
        args: &[u64],
    ) -> Result<u64> {
        if args.len() != desc.total_args() {
            return Err(Error::CountMismatch {
                counted: desc.shape().total(),
                listed: args.len(),
            });
        }

        let platform = desc.platform();
        let raw = interpose::call_native(
            platform,
            self.call_outs.get(platform),
            target as u64,
            desc.shape(),
            desc.index_list(),
            args,
            desc.return_type(),
        );

        Ok(desc.return_type().normalize(raw))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
