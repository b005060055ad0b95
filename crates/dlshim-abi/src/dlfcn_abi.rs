//! ABI layer for `<dlfcn.h>` functions.
//!
//! Exports `dlshim_dlopen`, `dlshim_dlsym`, `dlshim_dlvsym`,
//! `dlshim_dlclose`, `dlshim_dlinfo`, `dlshim_dladdr`, `dlshim_dladdr1` and
//! `dlshim_dlerror`. Names carry a prefix so the shim never interposes the
//! system `libdl` it is built on.
//!
//! Handle values: null is `RTLD_DEFAULT`, `(void *)-1` is `RTLD_NEXT`, and
//! `dlshim_dlopen(NULL, ..)` returns the process pseudo-handle
//! `(void *)-2`.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::ffi::{CStr, CString, c_char, c_int, c_void};

use dlshim_core::{AddrFlags, DlError, ModuleHandle, SymbolInfo};
use parking_lot::Mutex;

use crate::macros::abi_fn;
use crate::runtime;

/// C layout of `Dl_info`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DlInfo {
    pub dli_fname: *const c_char,
    pub dli_fbase: *mut c_void,
    pub dli_sname: *const c_char,
    pub dli_saddr: *mut c_void,
}

impl Default for DlInfo {
    fn default() -> Self {
        Self {
            dli_fname: std::ptr::null(),
            dli_fbase: std::ptr::null_mut(),
            dli_sname: std::ptr::null(),
            dli_saddr: std::ptr::null_mut(),
        }
    }
}

// ---------------------------------------------------------------------------
// String storage
// ---------------------------------------------------------------------------

// Module paths and symbol names handed out through `Dl_info`. Interned for
// the life of the process: callers may keep the pointers after the module
// is gone.
static INTERNED: Mutex<BTreeSet<CString>> = Mutex::new(BTreeSet::new());

fn intern(text: &str) -> *const c_char {
    let Ok(owned) = CString::new(text) else {
        return std::ptr::null();
    };
    let mut set = INTERNED.lock();
    if let Some(existing) = set.get(owned.as_c_str()) {
        return existing.as_ptr();
    }
    let ptr = owned.as_ptr();
    set.insert(owned);
    ptr
}

std::thread_local! {
    // Text returned by the last `dlshim_dlerror` on this thread.
    static DLERROR_TEXT: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Borrow a C string argument, `None` for null.
///
/// Safety: `ptr` must be null or NUL-terminated.
unsafe fn arg_str<'a>(ptr: *const c_char) -> Option<std::borrow::Cow<'a, str>> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy())
}

fn handle_of(handle: *mut c_void) -> ModuleHandle {
    ModuleHandle::from_raw(handle as usize)
}

fn fill(info: *mut DlInfo, resolved: &SymbolInfo) {
    if info.is_null() {
        return;
    }
    let out = DlInfo {
        dli_fname: intern(&resolved.module_path),
        dli_fbase: resolved.module_base as *mut c_void,
        dli_sname: resolved
            .symbol_name
            .as_deref()
            .map_or(std::ptr::null(), intern),
        dli_saddr: resolved
            .symbol_address
            .map_or(std::ptr::null_mut(), |a| a as *mut c_void),
    };
    // SAFETY: caller-provided, non-null, sized for Dl_info.
    unsafe { info.write(out) };
}

// ---------------------------------------------------------------------------
// dlopen
// ---------------------------------------------------------------------------

abi_fn! {
    /// Open a shared object. A null `filename` returns the process
    /// pseudo-handle. `flags` is accepted but does not change behavior.
    fn dlshim_dlopen(filename: *const c_char, flags: c_int) -> *mut c_void = std::ptr::null_mut(); {
        let ctx = runtime::context();
        let path = arg_str(filename);
        match ctx.load(path.as_deref(), flags) {
            Some(handle) => handle.as_raw() as *mut c_void,
            None => std::ptr::null_mut(),
        }
    }
}

// ---------------------------------------------------------------------------
// dlsym / dlvsym
// ---------------------------------------------------------------------------

abi_fn! {
    /// Find `symbol` through `handle` (a module handle, `RTLD_DEFAULT`, or
    /// the process pseudo-handle).
    fn dlshim_dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void = std::ptr::null_mut(); {
        let ctx = runtime::context();
        let Some(name) = arg_str(symbol) else {
            ctx.errors().report(&DlError::SymbolNotFound { name: "(null)".into() });
            return std::ptr::null_mut();
        };
        ctx.lookup(handle_of(handle), &name)
            .map_or(std::ptr::null_mut(), |a| a as *mut c_void)
    }
}

abi_fn! {
    /// Like `dlshim_dlsym`; `version` is ignored.
    fn dlshim_dlvsym(handle: *mut c_void, symbol: *const c_char, version: *const c_char) -> *mut c_void = std::ptr::null_mut(); {
        let ctx = runtime::context();
        let Some(name) = arg_str(symbol) else {
            ctx.errors().report(&DlError::SymbolNotFound { name: "(null)".into() });
            return std::ptr::null_mut();
        };
        let version = arg_str(version).unwrap_or_default();
        ctx.lookup_versioned(handle_of(handle), &name, &version)
            .map_or(std::ptr::null_mut(), |a| a as *mut c_void)
    }
}

// ---------------------------------------------------------------------------
// dlclose
// ---------------------------------------------------------------------------

abi_fn! {
    /// Close a module handle. Returns 0 on success, -1 on error.
    fn dlshim_dlclose(handle: *mut c_void) -> c_int = -1; {
        if runtime::context().unload(handle_of(handle)) { 0 } else { -1 }
    }
}

// ---------------------------------------------------------------------------
// dlinfo
// ---------------------------------------------------------------------------

abi_fn! {
    /// Validate `request`; `arg` is never written. Returns 0 for recognized
    /// requests, -1 otherwise.
    fn dlshim_dlinfo(handle: *mut c_void, request: c_int, arg: *mut c_void) -> c_int = -1; {
        let _ = arg;
        runtime::context().query_info(handle_of(handle), request)
    }
}

// ---------------------------------------------------------------------------
// dladdr / dladdr1
// ---------------------------------------------------------------------------

abi_fn! {
    /// Describe the module and nearest symbol containing `addr`. Returns
    /// non-zero on success. String fields stay valid for the life of the
    /// process.
    fn dlshim_dladdr(addr: *const c_void, info: *mut DlInfo) -> c_int = 0; {
        match runtime::context().resolve_address(addr as usize) {
            Some(resolved) => {
                fill(info, &resolved);
                1
            }
            None => 0,
        }
    }
}

abi_fn! {
    /// `dlshim_dladdr` with an extra-info slot. `*extra_info` is set to
    /// null: no link map or symbol entry is provided.
    fn dlshim_dladdr1(addr: *const c_void, info: *mut DlInfo, extra_info: *mut *mut c_void, flags: c_int) -> c_int = 0; {
        if !extra_info.is_null() {
            extra_info.write(std::ptr::null_mut());
        }
        match runtime::context().resolve_address_extended(addr as usize, AddrFlags(flags)) {
            Some(resolved) => {
                fill(info, &resolved);
                1
            }
            None => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// dlerror
// ---------------------------------------------------------------------------

abi_fn! {
    /// Return and clear the last error, or null if none is pending. The
    /// text stays valid until this thread calls `dlshim_dlerror` again.
    fn dlshim_dlerror() -> *mut c_char = std::ptr::null_mut(); {
        let message = runtime::context()
            .take_last_error()
            .and_then(|m| CString::new(m).ok());
        DLERROR_TEXT.with(|slot| {
            let mut slot = slot.borrow_mut();
            *slot = message;
            slot.as_ref().map_or(std::ptr::null_mut(), |m| m.as_ptr().cast_mut())
        })
    }
}
