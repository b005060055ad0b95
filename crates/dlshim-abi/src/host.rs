//! Linux host backend over the system dynamic linker.
//!
//! Loading, unloading and per-module lookup go through the system
//! `dlopen`/`dlclose`/`dlsym`. The process module table comes from
//! `dl_iterate_phdr`. Module handles in the table are recovered with
//! `RTLD_NOLOAD`, so they compare equal to handles returned by `load`.

use std::ffi::{CStr, CString, c_char, c_int, c_void};

use dlshim_core::{HostLoader, HostStatus, ModuleInfo, RawHandle};

/// Host loader backed by the running process's dynamic linker.
#[derive(Debug)]
pub struct LinuxHost {
    process: RawHandle,
    main_path: String,
}

impl LinuxHost {
    pub fn new() -> Self {
        // SAFETY: a null path asks for the main program; never fails on glibc.
        let process = unsafe { libc::dlopen(std::ptr::null(), libc::RTLD_NOW) } as RawHandle;
        let main_path = std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { process, main_path }
    }
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self::new()
    }
}

fn last_errno() -> i64 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .map_or(0, i64::from)
}

fn clear_errno() {
    // SAFETY: the errno location is thread-local and always valid.
    unsafe { *libc::__errno_location() = 0 };
}

/// Consume the system loader's pending error text, if any.
fn take_host_error() -> Option<String> {
    // SAFETY: dlerror returns null or a NUL-terminated thread-local string.
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned())
}

fn failure(fallback: c_int) -> HostStatus {
    let code = match last_errno() {
        0 => i64::from(fallback),
        errno => errno,
    };
    let status = HostStatus::new(code);
    match take_host_error() {
        Some(detail) => status.with_detail(detail),
        None => status,
    }
}

impl HostLoader for LinuxHost {
    fn native_separator(&self) -> char {
        '/'
    }

    fn process_image(&self) -> RawHandle {
        self.process
    }

    fn load(&self, native_path: &str) -> Result<RawHandle, HostStatus> {
        let path = CString::new(native_path).map_err(|_| HostStatus::new(libc::EINVAL.into()))?;
        clear_errno();
        // SAFETY: `path` is NUL-terminated and outlives the call.
        let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(failure(libc::ENOENT));
        }
        Ok(handle as RawHandle)
    }

    fn unload(&self, handle: RawHandle) -> Result<(), HostStatus> {
        clear_errno();
        // SAFETY: the caller passes a handle obtained from `load`; anything
        // else is undefined behavior in the system loader too.
        let rc = unsafe { libc::dlclose(handle as *mut c_void) };
        if rc != 0 {
            return Err(failure(libc::EINVAL));
        }
        Ok(())
    }

    fn symbol(&self, handle: RawHandle, name: &str) -> Option<usize> {
        let name = CString::new(name).ok()?;
        // SAFETY: `handle` came from `load` or `process_image`.
        let address = unsafe { libc::dlsym(handle as *mut c_void, name.as_ptr()) };
        if address.is_null() {
            // Leave no stale text behind in the system loader.
            let _ = take_host_error();
            return None;
        }
        Some(address as usize)
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, HostStatus> {
        let mut raw: Vec<PhdrModule> = Vec::new();
        // SAFETY: `collect` only writes into the Vec passed through `data`.
        unsafe {
            libc::dl_iterate_phdr(Some(collect), (&mut raw as *mut Vec<PhdrModule>).cast());
        }

        // Handles are recovered after iteration: dlopen must not run while
        // the loader is walking its own list.
        Ok(raw
            .into_iter()
            .filter_map(|m| {
                let (low, high) = m.span?;
                let (handle, path) = match &m.name {
                    None => (Some(self.process), self.main_path.clone()),
                    Some(name) => (resident_handle(name), name.to_string_lossy().into_owned()),
                };
                Some(ModuleInfo {
                    handle,
                    base: m.bias.wrapping_add(low),
                    size: high - low,
                    load_bias: m.bias,
                    path,
                })
            })
            .collect())
    }
}

/// Handle of an already-mapped module, without changing its refcount.
fn resident_handle(name: &CStr) -> Option<RawHandle> {
    // SAFETY: NOLOAD never maps anything; the reference it takes is dropped
    // again right away.
    unsafe {
        let handle = libc::dlopen(name.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD);
        if handle.is_null() {
            let _ = take_host_error();
            return None;
        }
        libc::dlclose(handle);
        Some(handle as RawHandle)
    }
}

struct PhdrModule {
    bias: usize,
    /// `None` for the main program, which the loader lists without a name.
    name: Option<CString>,
    /// Lowest and highest PT_LOAD addresses, image-relative.
    span: Option<(usize, usize)>,
}

unsafe extern "C" fn collect(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    // SAFETY: `data` is the Vec handed to dl_iterate_phdr in `modules`, and
    // `info` is valid for the duration of the callback.
    let (out, info) = unsafe { (&mut *data.cast::<Vec<PhdrModule>>(), &*info) };

    let phdrs = if info.dlpi_phdr.is_null() {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) }
    };
    let span = phdrs
        .iter()
        .filter(|p| p.p_type == libc::PT_LOAD)
        .map(|p| {
            let low = p.p_vaddr as usize;
            (low, low.wrapping_add(p.p_memsz as usize))
        })
        .reduce(|(lo, hi), (l, h)| (lo.min(l), hi.max(h)));

    let name = if info.dlpi_name.is_null() {
        None
    } else {
        let name = unsafe { CStr::from_ptr(info.dlpi_name as *const c_char) };
        (!name.is_empty()).then(|| name.to_owned())
    };

    out.push(PhdrModule {
        bias: info.dlpi_addr as usize,
        name,
        span,
    });
    0
}
