//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    PAGE_NOACCESS,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

pub(super) fn page_size() -> usize {
    // SAFETY: SYSTEM_INFO is plain data, and GetSystemInfo fills all of it
    let info = unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();

        GetSystemInfo(&mut info);

        info
    };

    info.dwPageSize as usize
}

pub(super) fn map(size: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: reserving fresh address space, no existing memory is touched
    let reserved = unsafe { VirtualAlloc(ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) };

    if reserved.is_null() {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: committing the range that was just reserved
    let committed = unsafe { VirtualAlloc(reserved, size, MEM_COMMIT, PAGE_EXECUTE_READWRITE) };

    if committed.is_null() {
        let err = io::Error::last_os_error();

        // SAFETY: the reservation is ours and nothing refers to it
        unsafe {
            VirtualFree(reserved, 0, MEM_RELEASE);
        }

        return Err(err);
    }

    NonNull::new(committed.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
}

pub(super) unsafe fn unmap(base: NonNull<u8>, _size: usize) {
    VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE);
}
