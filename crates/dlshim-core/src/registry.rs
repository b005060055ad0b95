//! Module registry: load/unload forwarding and the module-set version.
//!
//! Every mutation of the module set (load or unload attempt) runs under the
//! registry lock and bumps `version` before the lock is released. The
//! address resolver takes the same lock before comparing versions, so a
//! refresh never observes a half-updated module table.
//!
//! The lock is reentrant: module constructors run inside the host loader
//! call and may call back into the shim on the same thread.

use std::cell::RefCell;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::dlfcn::ModuleHandle;
use crate::error::DlError;
use crate::host::{HostLoader, HostStatus, RawHandle};
use crate::path;

#[derive(Debug, Default)]
struct RegistryState {
    version: u64,
}

/// Process-wide module-set bookkeeping.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    state: ReentrantMutex<RefCell<RegistryState>>,
}

/// Held while the module set must not change.
pub struct RegistryGuard<'a> {
    guard: ReentrantMutexGuard<'a, RefCell<RegistryState>>,
}

impl RegistryGuard<'_> {
    /// Module-set version observed under the lock.
    pub fn version(&self) -> u64 {
        self.guard.borrow().version
    }

    fn bump(&self) {
        let mut state = self.guard.borrow_mut();
        state.version = state.version.wrapping_add(1);
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            guard: self.state.lock(),
        }
    }

    pub fn version(&self) -> u64 {
        self.lock().version()
    }

    /// Host identifier a handle stands for. `None` for the scope markers.
    pub fn to_raw<H: HostLoader>(host: &H, handle: ModuleHandle) -> Option<RawHandle> {
        match handle {
            ModuleHandle::DEFAULT | ModuleHandle::NEXT => None,
            ModuleHandle::PROCESS => Some(host.process_image()),
            other => Some(other.as_raw()),
        }
    }

    /// Whether `handle` names the process image or a module in the host table.
    pub fn is_live<H: HostLoader>(host: &H, handle: ModuleHandle) -> bool {
        let Some(raw) = Self::to_raw(host, handle) else {
            return false;
        };
        if raw == host.process_image() {
            return true;
        }
        host.modules()
            .map(|modules| modules.iter().any(|m| m.handle == Some(raw)))
            .unwrap_or(false)
    }

    /// Map `path`, or return [`ModuleHandle::PROCESS`] when no path is given.
    ///
    /// `path` uses `/` separators and is rewritten to the host's native form.
    /// Any attempt to map a file bumps the version, successful or not.
    pub fn load<H: HostLoader>(
        &self,
        host: &H,
        path: Option<&str>,
    ) -> Result<ModuleHandle, DlError> {
        let Some(path) = path else {
            return Ok(ModuleHandle::PROCESS);
        };
        let native = path::to_native(path, host.native_separator());

        let guard = self.lock();
        let result = host.load(&native);
        guard.bump();

        result
            .map(ModuleHandle::from_raw)
            .map_err(|status: HostStatus| DlError::LoadFailure {
                path: path.to_owned(),
                code: status.code,
                detail: status.detail,
            })
    }

    /// Unmap `handle`. Bumps the version whatever the outcome, except for
    /// the process image, which is never unmapped.
    pub fn unload<H: HostLoader>(
        &self,
        host: &H,
        handle: ModuleHandle,
        validate: bool,
    ) -> Result<(), DlError> {
        if handle == ModuleHandle::PROCESS {
            return Ok(());
        }

        let guard = self.lock();
        let result = match Self::to_raw(host, handle) {
            None => Err(DlError::InvalidHandle { handle }),
            Some(_) if validate && !Self::is_live(host, handle) => {
                Err(DlError::InvalidHandle { handle })
            }
            Some(raw) => host
                .unload(raw)
                .map_err(|status| DlError::UnloadFailure {
                    handle,
                    code: status.code,
                    detail: status.detail,
                }),
        };
        guard.bump();
        result
    }
}
