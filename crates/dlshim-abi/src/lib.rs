// Exported entry points take raw pointers straight from C callers; their
// contracts are the `<dlfcn.h>` ones.
#![allow(clippy::missing_safety_doc)]
//! # dlshim-abi
//!
//! `extern "C"` boundary for the dlfcn shim.
//!
//! This crate produces a `cdylib` (`libdlshim_abi.so`) exporting `dlshim_dlopen`,
//! `dlshim_dlsym`, `dlshim_dlvsym`, `dlshim_dlclose`, `dlshim_dlinfo`,
//! `dlshim_dladdr`, `dlshim_dladdr1` and `dlshim_dlerror`. Each export
//! converts its C arguments and calls the process [`runtime::context`], a
//! `dlshim_core::DlContext` over the Linux host backend in [`host`].
//!
//! # Architecture
//!
//! ```text
//! C caller -> ABI entry (this crate) -> DlContext (dlshim-core) -> LinuxHost -> system libdl
//! ```

#![cfg(target_os = "linux")]

mod macros;

pub mod dlfcn_abi;
pub mod host;
pub mod runtime;
