//! # dlshim-core
//!
//! Safe core of a `<dlfcn.h>` compatibility shim.
//!
//! The shim exposes the POSIX dynamic-loading surface (`dlopen`, `dlsym`,
//! `dlclose`, `dlinfo`, `dladdr`, `dlerror`) on top of a host loader and a
//! host debug-symbol engine whose shapes differ from POSIX. The host is
//! reached only through the traits in [`host`]; this crate contains no
//! `unsafe` code.
//!
//! # Architecture
//!
//! ```text
//! caller -> DlContext -> ModuleRegistry / lookup / AddressResolver -> host
//!                  \-> ErrorChannel (one-shot, last-write-wins)
//! ```
//!
//! Load and unload bump a module-set version under the registry lock; the
//! address resolver compares that version against the one its symbol engine
//! was last synced to and refreshes the engine only when they differ.

#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod dlfcn;
pub mod error;
pub mod host;
pub mod info;
pub mod log;
pub mod lookup;
pub mod path;
pub mod registry;
pub mod resolver;
pub mod symtab;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ErrorScope, SafetyLevel, ShimConfig};
pub use context::DlContext;
pub use dlfcn::{AddrFlags, DlMode, InfoRequest, ModuleHandle};
pub use error::{DlError, ErrorChannel, MAX_ERROR_LEN};
pub use host::{HostLoader, HostStatus, ModuleInfo, RawHandle, SymbolEngine, SymbolHit};
pub use resolver::SymbolInfo;
pub use symtab::{ElfSymbolEngine, FsImageReader, ImageReader};
