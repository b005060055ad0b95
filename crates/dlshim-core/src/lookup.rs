//! Name-to-address lookup, scoped to one module or across every module.

use crate::dlfcn::ModuleHandle;
use crate::error::DlError;
use crate::host::HostLoader;
use crate::registry::ModuleRegistry;

/// Resolve `name` through `handle`.
///
/// [`ModuleHandle::DEFAULT`] walks the host module table and returns the
/// first hit in host enumeration order. No ordering is promised beyond that.
/// When `validate` is set, a real handle must appear in the host table.
pub fn lookup<H: HostLoader>(
    host: &H,
    handle: ModuleHandle,
    name: &str,
    validate: bool,
) -> Result<usize, DlError> {
    match handle {
        ModuleHandle::DEFAULT => lookup_global(host, name),
        // TODO: RTLD_NEXT: search the modules after the caller's, located by resolving the return address.
        ModuleHandle::NEXT => Err(DlError::UnsupportedHandle {
            name: name.to_owned(),
        }),
        _ => {
            if validate && !ModuleRegistry::is_live(host, handle) {
                return Err(DlError::InvalidHandle { handle });
            }
            ModuleRegistry::to_raw(host, handle)
                .and_then(|raw| host.symbol(raw, name))
                .ok_or_else(|| DlError::SymbolNotFoundIn {
                    name: name.to_owned(),
                    handle,
                })
        }
    }
}

fn lookup_global<H: HostLoader>(host: &H, name: &str) -> Result<usize, DlError> {
    let modules = host
        .modules()
        .map_err(|status| DlError::ModuleTableUnavailable {
            name: name.to_owned(),
            code: status.code,
        })?;
    modules
        .iter()
        .filter_map(|m| m.handle)
        .find_map(|raw| host.symbol(raw, name))
        .ok_or_else(|| DlError::SymbolNotFound {
            name: name.to_owned(),
        })
}
