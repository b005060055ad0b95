//! Address-to-symbol resolution (`dladdr`).
//!
//! The symbol engine moves `Uninitialized -> Initialized` once. After that,
//! each call compares the registry's module-set version with the version the
//! engine was last synced to and refreshes the engine only on mismatch.
//! Both the comparison and the refresh run under the registry lock.

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::DlError;
use crate::host::{HostLoader, HostStatus, ModuleInfo, SymbolEngine};
use crate::path;
use crate::registry::ModuleRegistry;

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolInfo {
    /// Module file path with `/` separators.
    pub module_path: String,
    pub module_base: usize,
    pub symbol_name: Option<String>,
    pub symbol_address: Option<usize>,
}

/// What happened to the engine during one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineTransition {
    None,
    Initialized,
    Refreshed,
    /// Initialization failed; the engine stays uninitialized.
    InitFailed(i64),
    /// The refresh failed; the engine stays stale and will retry next call.
    RefreshFailed(i64),
}

/// A resolution together with bookkeeping the legacy interface drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub info: SymbolInfo,
    pub displacement: usize,
    pub transition: EngineTransition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Uninitialized,
    Initialized { synced_version: u64 },
}

struct EngineSlot<E> {
    engine: E,
    state: EngineState,
}

/// Lazily initialized, version-gated symbol engine.
pub struct AddressResolver<E> {
    slot: Mutex<EngineSlot<E>>,
}

impl<E: SymbolEngine> AddressResolver<E> {
    pub fn new(engine: E) -> Self {
        Self {
            slot: Mutex::new(EngineSlot {
                engine,
                state: EngineState::Uninitialized,
            }),
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.slot.lock().state, EngineState::Initialized { .. })
    }

    /// Version the engine was last synced to, if initialized.
    pub fn synced_version(&self) -> Option<u64> {
        match self.slot.lock().state {
            EngineState::Uninitialized => None,
            EngineState::Initialized { synced_version } => Some(synced_version),
        }
    }

    /// Resolve `address` to its module and nearest preceding symbol.
    ///
    /// If the address lies in several modules (host anomaly), the last one in
    /// enumeration order wins. A located module without an enclosing symbol
    /// is a failure, not a partial result.
    pub fn resolve<H: HostLoader>(
        &self,
        host: &H,
        registry: &ModuleRegistry,
        address: usize,
    ) -> Result<Resolution, DlError> {
        self.resolve_traced(host, registry, address).1
    }

    /// Like [`resolve`](Self::resolve), but also reports what happened to
    /// the engine when the resolution itself fails.
    pub fn resolve_traced<H: HostLoader>(
        &self,
        host: &H,
        registry: &ModuleRegistry,
        address: usize,
    ) -> (EngineTransition, Result<Resolution, DlError>) {
        let guard = registry.lock();
        let version = guard.version();
        let mut slot = self.slot.lock();

        let (transition, snapshot) = Self::sync(&mut slot, host, version);
        if let EngineTransition::InitFailed(code) = transition {
            return (transition, Err(DlError::SymbolEngineInitFailure { code }));
        }
        let result = Self::locate(&slot.engine, host, snapshot, address).map(
            |(info, displacement)| Resolution {
                info,
                displacement,
                transition,
            },
        );
        (transition, result)
    }

    fn locate<H: HostLoader>(
        engine: &E,
        host: &H,
        snapshot: Option<Vec<ModuleInfo>>,
        address: usize,
    ) -> Result<(SymbolInfo, usize), DlError> {
        let modules = match snapshot {
            Some(modules) => modules,
            None => host
                .modules()
                .map_err(|status| DlError::ModuleNotFound {
                    address,
                    code: status.code,
                })?,
        };

        let module = modules
            .iter()
            .rev()
            .find(|m| m.contains(address))
            .ok_or(DlError::ModuleNotFound {
                address,
                code: HostStatus::NO_MODULE,
            })?;

        let hit = engine
            .symbol_from_addr(module, address)
            .map_err(|status| DlError::SymbolEngineQueryFailure {
                address,
                code: status.code,
            })?;

        let info = SymbolInfo {
            module_path: path::to_portable(&module.path, host.native_separator()),
            module_base: module.base,
            symbol_name: Some(hit.name),
            symbol_address: Some(hit.address),
        };
        Ok((info, hit.displacement))
    }

    /// Bring the engine up to `version`. Returns the module list it fetched,
    /// if any, so the caller need not enumerate twice.
    fn sync<H: HostLoader>(
        slot: &mut EngineSlot<E>,
        host: &H,
        version: u64,
    ) -> (EngineTransition, Option<Vec<ModuleInfo>>) {
        match slot.state {
            EngineState::Uninitialized => {
                let initialized = host
                    .modules()
                    .and_then(|modules| slot.engine.initialize(&modules).map(|()| modules));
                match initialized {
                    Ok(modules) => {
                        slot.state = EngineState::Initialized {
                            synced_version: version,
                        };
                        (EngineTransition::Initialized, Some(modules))
                    }
                    Err(status) => (EngineTransition::InitFailed(status.code), None),
                }
            }
            EngineState::Initialized { synced_version } if synced_version != version => {
                let refreshed = host
                    .modules()
                    .and_then(|modules| slot.engine.refresh(&modules).map(|()| modules));
                match refreshed {
                    Ok(modules) => {
                        slot.state = EngineState::Initialized {
                            synced_version: version,
                        };
                        (EngineTransition::Refreshed, Some(modules))
                    }
                    Err(status) => (EngineTransition::RefreshFailed(status.code), None),
                }
            }
            EngineState::Initialized { .. } => (EngineTransition::None, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlfcn::ModuleHandle;
    use crate::host::ModuleInfo;
    use crate::symtab::ElfSymbolEngine;
    use crate::testing::{CountingEngine, FakeHost, MemReader, PROCESS_BASE};

    type Engine = CountingEngine<ElfSymbolEngine<MemReader>>;

    fn setup() -> (FakeHost, ModuleRegistry, AddressResolver<Engine>, std::sync::Arc<crate::testing::EngineCounters>) {
        let host = FakeHost::new();
        let engine = CountingEngine::new(ElfSymbolEngine::new(host.reader()));
        let counters = std::sync::Arc::clone(&engine.counters);
        (host, ModuleRegistry::new(), AddressResolver::new(engine), counters)
    }

    #[test]
    fn first_call_initializes_once() {
        let (host, registry, resolver, counters) = setup();
        assert!(!resolver.is_initialized());

        let r = resolver.resolve(&host, &registry, PROCESS_BASE + 0x104).unwrap();
        assert_eq!(r.transition, EngineTransition::Initialized);
        assert_eq!(r.info.symbol_name.as_deref(), Some("main"));
        assert_eq!(r.info.symbol_address, Some(PROCESS_BASE + 0x100));
        assert_eq!(r.displacement, 4);
        assert_eq!(r.info.module_path, "C:/app/main.exe");
        assert_eq!(r.info.module_base, PROCESS_BASE);

        let r = resolver.resolve(&host, &registry, PROCESS_BASE + 0x100).unwrap();
        assert_eq!(r.transition, EngineTransition::None);
        assert_eq!(counters.inits(), 1);
        assert_eq!(counters.refreshes(), 0);
        assert_eq!(resolver.synced_version(), Some(0));
    }

    #[test]
    fn refresh_happens_only_after_module_set_changes() {
        let (host, registry, resolver, counters) = setup();
        host.install("lib\\x.so", 0x2000, &[("x_fn", 0x800)]);

        resolver.resolve(&host, &registry, PROCESS_BASE + 0x100).unwrap();
        let handle = registry.load(&host, Some("lib/x.so")).unwrap();
        let x_fn = handle.as_raw() + 0x800;

        let r = resolver.resolve(&host, &registry, x_fn + 2).unwrap();
        assert_eq!(r.transition, EngineTransition::Refreshed);
        assert_eq!(r.info.symbol_name.as_deref(), Some("x_fn"));
        assert_eq!(r.info.module_path, "lib/x.so");

        for _ in 0..5 {
            resolver.resolve(&host, &registry, x_fn).unwrap();
        }
        assert_eq!(counters.refreshes(), 1);
        assert_eq!(resolver.synced_version(), Some(registry.version()));
    }

    #[test]
    fn unloaded_range_reports_module_not_found() {
        let (host, registry, resolver, _) = setup();
        host.install("y.so", 0x1000, &[("y_fn", 0x10)]);
        let handle = registry.load(&host, Some("y.so")).unwrap();
        let y_fn = handle.as_raw() + 0x10;
        assert!(resolver.resolve(&host, &registry, y_fn).is_ok());

        registry.unload(&host, handle, false).unwrap();
        assert_eq!(
            resolver.resolve(&host, &registry, y_fn),
            Err(DlError::ModuleNotFound {
                address: y_fn,
                code: HostStatus::NO_MODULE,
            })
        );
    }

    #[test]
    fn address_between_symbols_and_before_first() {
        let (host, registry, resolver, _) = setup();
        host.install("z.so", 0x1000, &[("z1", 0x100), ("z2", 0x200)]);
        let base = registry.load(&host, Some("z.so")).unwrap().as_raw();

        let r = resolver.resolve(&host, &registry, base + 0x10f).unwrap();
        assert_eq!(r.info.symbol_name.as_deref(), Some("z1"));
        assert_eq!(
            resolver.resolve(&host, &registry, base + 0x1ff),
            Err(DlError::SymbolEngineQueryFailure {
                address: base + 0x1ff,
                code: HostStatus::NO_SYMBOL,
            })
        );

        assert_eq!(
            resolver.resolve(&host, &registry, base + 0x10),
            Err(DlError::SymbolEngineQueryFailure {
                address: base + 0x10,
                code: HostStatus::NO_SYMBOL,
            })
        );
    }

    #[test]
    fn overlapping_modules_last_match_wins() {
        let (host, registry, resolver, _) = setup();
        host.push_extra_module(ModuleInfo {
            handle: None,
            base: PROCESS_BASE,
            size: 0x1000,
            load_bias: PROCESS_BASE,
            path: "C:\\shadow.dll".into(),
        });
        let err = resolver
            .resolve(&host, &registry, PROCESS_BASE + 0x100)
            .unwrap_err();
        // The shadow module wins the range but has no readable image.
        assert_eq!(
            err,
            DlError::SymbolEngineQueryFailure {
                address: PROCESS_BASE + 0x100,
                code: HostStatus::NO_SYMBOL,
            }
        );
    }

    #[test]
    fn init_failure_aborts_and_retries_next_call() {
        let (host, registry, resolver, counters) = setup();
        counters
            .fail_init
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(
            resolver.resolve(&host, &registry, PROCESS_BASE + 0x100),
            Err(DlError::SymbolEngineInitFailure { code: 87 })
        );
        assert!(!resolver.is_initialized());

        counters
            .fail_init
            .store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(resolver.resolve(&host, &registry, PROCESS_BASE + 0x100).is_ok());
        assert_eq!(counters.inits(), 2);
    }

    #[test]
    fn enumeration_failure_during_init_is_init_failure() {
        let (host, registry, resolver, _) = setup();
        host.set_fail_enumeration(true);
        assert_eq!(
            resolver.resolve(&host, &registry, PROCESS_BASE),
            Err(DlError::SymbolEngineInitFailure { code: 299 })
        );
    }

    #[test]
    fn enumeration_failure_after_init_is_module_not_found() {
        let (host, registry, resolver, _) = setup();
        resolver.resolve(&host, &registry, PROCESS_BASE + 0x100).unwrap();
        host.set_fail_enumeration(true);
        assert_eq!(
            resolver.resolve(&host, &registry, PROCESS_BASE + 0x100),
            Err(DlError::ModuleNotFound {
                address: PROCESS_BASE + 0x100,
                code: 299,
            })
        );
    }

    #[test]
    fn failed_refresh_keeps_engine_stale() {
        let (host, registry, resolver, _) = setup();
        resolver.resolve(&host, &registry, PROCESS_BASE + 0x100).unwrap();
        registry
            .unload(&host, ModuleHandle::from_raw(0xbad0_0000), false)
            .unwrap_err();

        host.set_fail_enumeration(true);
        assert!(resolver.resolve(&host, &registry, PROCESS_BASE + 0x100).is_err());
        assert_eq!(resolver.synced_version(), Some(0));

        host.set_fail_enumeration(false);
        let r = resolver.resolve(&host, &registry, PROCESS_BASE + 0x100).unwrap();
        assert_eq!(r.transition, EngineTransition::Refreshed);
        assert_eq!(resolver.synced_version(), Some(1));
    }

    #[test]
    fn concurrent_churn_never_outruns_registry_version() {
        let (host, registry, resolver, counters) = setup();
        host.install("keep.so", 0x1000, &[("keep", 0x200)]);
        for i in 0..4 {
            host.install(&format!("churn{i}.so"), 0x1000, &[("c", 0x10)]);
        }
        let keep = registry.load(&host, Some("keep.so")).unwrap().as_raw() + 0x200;

        std::thread::scope(|s| {
            for i in 0..4 {
                let (host, registry) = (&host, &registry);
                s.spawn(move || {
                    let path = format!("churn{i}.so");
                    for _ in 0..50 {
                        let handle = registry.load(host, Some(path.as_str())).unwrap();
                        registry.unload(host, handle, false).unwrap();
                    }
                });
            }
            for _ in 0..4 {
                let (host, registry, resolver) = (&host, &registry, &resolver);
                s.spawn(move || {
                    for _ in 0..100 {
                        let r = resolver.resolve(host, registry, keep + 4).unwrap();
                        assert_eq!(r.info.symbol_name.as_deref(), Some("keep"));
                        assert_eq!(r.info.module_path, "keep.so");
                        let r = resolver.resolve(host, registry, PROCESS_BASE + 0x100).unwrap();
                        assert_eq!(r.info.symbol_name.as_deref(), Some("main"));

                        let synced = resolver.synced_version().unwrap();
                        assert!(synced <= registry.version());
                    }
                });
            }
        });

        assert_eq!(registry.version(), 1 + 4 * 50 * 2);
        assert_eq!(counters.inits(), 1);

        let handle = registry.load(&host, Some("churn0.so")).unwrap();
        registry.unload(&host, handle, false).unwrap();
        let r = resolver.resolve(&host, &registry, keep).unwrap();
        assert_eq!(r.transition, EngineTransition::Refreshed);
        let r = resolver.resolve(&host, &registry, keep).unwrap();
        assert_eq!(r.transition, EngineTransition::None);
        assert_eq!(resolver.synced_version(), Some(registry.version()));
    }

    #[test]
    fn traced_resolution_reports_transition_on_failure() {
        let (host, registry, resolver, counters) = setup();
        counters
            .fail_init
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let (transition, result) = resolver.resolve_traced(&host, &registry, PROCESS_BASE);
        assert_eq!(transition, EngineTransition::InitFailed(87));
        assert!(result.is_err());

        counters
            .fail_init
            .store(false, std::sync::atomic::Ordering::SeqCst);
        resolver.resolve(&host, &registry, PROCESS_BASE + 0x100).unwrap();
        registry.load(&host, Some("absent.so")).unwrap_err();
        let (transition, result) = resolver.resolve_traced(&host, &registry, 0x10);
        assert_eq!(transition, EngineTransition::Refreshed);
        assert!(matches!(result, Err(DlError::ModuleNotFound { .. })));
    }
}
