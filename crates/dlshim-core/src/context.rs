//! Process-scoped shim context.
//!
//! A [`DlContext`] owns the host, the error channel, the module registry and
//! the address resolver. The C boundary keeps one per process, created on
//! first use and never torn down.
//!
//! Each operation comes in two forms. `try_*` returns a `Result` and leaves
//! the error channel alone. The legacy form (`load`, `lookup`, ...) reports
//! failures into the channel, overwriting any unread message, and returns a
//! sentinel.

use parking_lot::Mutex;

use crate::config::ShimConfig;
use crate::dlfcn::{AddrFlags, DlMode, InfoRequest, ModuleHandle};
use crate::error::{DlError, ErrorChannel};
use crate::host::{HostLoader, SymbolEngine};
use crate::info;
use crate::log::{LogEmitter, LogEntry, LogLevel, Outcome};
use crate::lookup;
use crate::registry::ModuleRegistry;
use crate::resolver::{AddressResolver, EngineTransition, SymbolInfo};

pub struct DlContext<H, E> {
    host: H,
    config: ShimConfig,
    errors: ErrorChannel,
    registry: ModuleRegistry,
    resolver: AddressResolver<E>,
    log: Option<Mutex<LogEmitter>>,
}

impl<H: HostLoader, E: SymbolEngine> DlContext<H, E> {
    /// Build a context. If `config.log_path` is set and cannot be opened,
    /// logging stays off.
    pub fn new(host: H, engine: E, config: ShimConfig) -> Self {
        let log = config
            .log_path
            .as_deref()
            .and_then(|path| LogEmitter::to_file(path, &std::process::id().to_string()).ok())
            .map(Mutex::new);
        Self {
            errors: ErrorChannel::new(config.error_scope),
            host,
            config,
            registry: ModuleRegistry::new(),
            resolver: AddressResolver::new(engine),
            log,
        }
    }

    /// Replace the log sink.
    #[must_use]
    pub fn with_log(mut self, emitter: LogEmitter) -> Self {
        self.log = Some(Mutex::new(emitter));
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &ShimConfig {
        &self.config
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &AddressResolver<E> {
        &self.resolver
    }

    fn emit(&self, entry: LogEntry) {
        if let Some(log) = &self.log {
            let _ = log.lock().emit_entry(entry);
        }
    }

    fn entry(&self, event: &str) -> LogEntry {
        LogEntry::new("", LogLevel::Info, event).with_mode(self.config.mode.as_str())
    }

    fn finish<T>(&self, entry: LogEntry, result: &Result<T, DlError>) {
        let entry = match result {
            Ok(_) => entry.with_outcome(Outcome::Ok),
            Err(err) => with_host_detail(entry.with_failure(err.kind(), err.to_string()), err),
        };
        self.emit(entry);
    }

    fn settle<T>(&self, result: Result<T, DlError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.errors.report(&err);
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Result-returning operations
    // -----------------------------------------------------------------------

    /// Map `path` (`/`-separated) or return the process pseudo-handle.
    /// `mode` is recorded in the log only.
    pub fn try_load(&self, path: Option<&str>, mode: DlMode) -> Result<ModuleHandle, DlError> {
        let result = self.registry.load(&self.host, path);
        let mut entry = self
            .entry("load")
            .with_module(path.unwrap_or("<process>"))
            .with_details(serde_json::json!({ "dl_mode": format!("{mode:?}") }));
        if let Ok(handle) = &result {
            entry = entry.with_handle(handle);
        }
        self.finish(entry, &result);
        result
    }

    pub fn try_lookup(&self, handle: ModuleHandle, name: &str) -> Result<usize, DlError> {
        let result = lookup::lookup(
            &self.host,
            handle,
            name,
            self.config.mode.validates_handles(),
        );
        let mut entry = self.entry("lookup").with_symbol(name).with_handle(handle);
        if let Ok(address) = &result {
            entry = entry.with_address(*address);
        }
        entry.level = LogLevel::Debug;
        self.finish(entry, &result);
        result
    }

    pub fn try_unload(&self, handle: ModuleHandle) -> Result<(), DlError> {
        let result = self
            .registry
            .unload(&self.host, handle, self.config.mode.validates_handles());
        self.finish(self.entry("unload").with_handle(handle), &result);
        result
    }

    pub fn try_query_info(
        &self,
        handle: ModuleHandle,
        request: i32,
    ) -> Result<InfoRequest, DlError> {
        let result = info::query_info(request);
        let entry = self
            .entry("query_info")
            .with_handle(handle)
            .with_details(serde_json::json!({ "request": request }));
        self.finish(entry, &result);
        result
    }

    pub fn try_resolve_address(&self, address: usize) -> Result<SymbolInfo, DlError> {
        self.resolve_logged(address, None)
    }

    fn resolve_logged(
        &self,
        address: usize,
        flags: Option<AddrFlags>,
    ) -> Result<SymbolInfo, DlError> {
        let (transition, result) = self
            .resolver
            .resolve_traced(&self.host, &self.registry, address);
        self.log_transition(transition);

        let mut entry = self.entry("resolve_address").with_address(address);
        let mut details = serde_json::Map::new();
        if let Some(flags) = flags {
            details.insert("flags".into(), flags.0.into());
        }
        if let Ok(resolution) = &result {
            details.insert("displacement".into(), resolution.displacement.into());
            entry = entry.with_module(resolution.info.module_path.clone());
            if let Some(name) = &resolution.info.symbol_name {
                entry = entry.with_symbol(name.clone());
            }
        }
        if !details.is_empty() {
            entry = entry.with_details(details.into());
        }
        entry.level = LogLevel::Debug;
        self.finish(entry, &result);
        result.map(|resolution| resolution.info)
    }

    fn log_transition(&self, transition: EngineTransition) {
        let (event, failed_code) = match transition {
            EngineTransition::None => return,
            EngineTransition::Initialized => ("engine_init", None),
            EngineTransition::Refreshed => ("engine_refresh", None),
            EngineTransition::InitFailed(code) => ("engine_init", Some(code)),
            EngineTransition::RefreshFailed(code) => ("engine_refresh", Some(code)),
        };
        let mut entry = self.entry(event);
        match failed_code {
            None => entry = entry.with_outcome(Outcome::Ok),
            Some(code) => {
                entry = entry.with_details(serde_json::json!({ "code": code }));
                entry.level = LogLevel::Warn;
                entry.outcome = Some(Outcome::Failed);
            }
        }
        self.emit(entry);
    }

    // -----------------------------------------------------------------------
    // Legacy sentinel-returning operations
    // -----------------------------------------------------------------------

    /// `dlopen`. `None` on failure.
    pub fn load(&self, path: Option<&str>, mode: i32) -> Option<ModuleHandle> {
        self.settle(self.try_load(path, DlMode::from(mode)))
    }

    /// `dlsym`. `None` on failure.
    pub fn lookup(&self, handle: ModuleHandle, name: &str) -> Option<usize> {
        self.settle(self.try_lookup(handle, name))
    }

    /// `dlvsym`. The version is ignored: one definition per name.
    pub fn lookup_versioned(&self, handle: ModuleHandle, name: &str, _version: &str) -> Option<usize> {
        self.lookup(handle, name)
    }

    /// `dlclose`. `false` on failure.
    pub fn unload(&self, handle: ModuleHandle) -> bool {
        self.settle(self.try_unload(handle)).is_some()
    }

    /// `dlinfo`. `0` for recognized requests, `-1` otherwise.
    pub fn query_info(&self, handle: ModuleHandle, request: i32) -> i32 {
        match self.settle(self.try_query_info(handle, request)) {
            Some(_) => 0,
            None => -1,
        }
    }

    /// `dladdr`. `None` on failure.
    pub fn resolve_address(&self, address: usize) -> Option<SymbolInfo> {
        self.settle(self.try_resolve_address(address))
    }

    /// `dladdr1`. The flags are logged; no link-map or symbol-entry detail
    /// is produced.
    pub fn resolve_address_extended(&self, address: usize, flags: AddrFlags) -> Option<SymbolInfo> {
        self.settle(self.resolve_logged(address, Some(flags)))
    }

    /// `dlerror`. One-shot.
    pub fn take_last_error(&self) -> Option<String> {
        self.errors.take()
    }
}

/// Attach the host loader's own text to a failed entry's details.
fn with_host_detail(mut entry: LogEntry, err: &DlError) -> LogEntry {
    let Some(detail) = err.host_detail() else {
        return entry;
    };
    match &mut entry.details {
        Some(serde_json::Value::Object(map)) => {
            map.insert("host_detail".into(), detail.into());
        }
        _ => entry.details = Some(serde_json::json!({ "host_detail": detail })),
    }
    entry
}
