//! Inspection tooling for the dlfcn shim.
//!
//! Builds JSON reports of what the shim answers on a live host:
//! - symbol resolution and the address round trip back to a name
//! - the host module table as the address resolver sees it
//! - nearest-symbol answers for raw addresses

#![forbid(unsafe_code)]

use dlshim_core::{DlContext, DlError, DlMode, HostLoader, SymbolEngine, SymbolInfo};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid address {0:?}: expected hex (0x...) or decimal")]
    InvalidAddress(String),
    #[error("host module table unavailable, code {0}")]
    ModuleTable(i64),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Error as reported through `dlerror`, plus its taxonomy kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub kind: &'static str,
    pub message: String,
}

impl From<&DlError> for ErrorRecord {
    fn from(err: &DlError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// `resolve` subcommand output.
#[derive(Debug, Clone, Serialize)]
pub struct ResolveReport {
    pub module: Option<String>,
    pub symbol: String,
    pub handle: Option<String>,
    pub address: Option<String>,
    pub resolved: Option<SymbolInfo>,
    /// The address maps back to a symbol starting exactly there.
    pub round_trip: bool,
    pub error: Option<ErrorRecord>,
}

/// `addr` subcommand output.
#[derive(Debug, Clone, Serialize)]
pub struct AddressReport {
    pub address: String,
    pub resolved: Option<SymbolInfo>,
    pub error: Option<ErrorRecord>,
}

/// One row of the `modules` subcommand output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleRow {
    pub path: String,
    pub base: String,
    pub size: usize,
    pub load_bias: String,
    pub handle: Option<String>,
}

fn hex(value: usize) -> String {
    format!("{value:#x}")
}

/// Parse `0x`-prefixed hex or plain decimal. Underscores are ignored.
pub fn parse_address(text: &str) -> Result<usize, HarnessError> {
    let cleaned: String = text.trim().chars().filter(|&c| c != '_').collect();
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(digits) => usize::from_str_radix(digits, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|_| HarnessError::InvalidAddress(text.to_owned()))
}

/// Load `module` (or use the process image), look up `symbol`, then resolve
/// the address back. The module is unloaded again before returning.
pub fn resolve_symbol<H: HostLoader, E: SymbolEngine>(
    ctx: &DlContext<H, E>,
    module: Option<&str>,
    symbol: &str,
) -> ResolveReport {
    let mut report = ResolveReport {
        module: module.map(str::to_owned),
        symbol: symbol.to_owned(),
        handle: None,
        address: None,
        resolved: None,
        round_trip: false,
        error: None,
    };

    let handle = match ctx.try_load(module, DlMode::Now) {
        Ok(handle) => handle,
        Err(err) => {
            report.error = Some((&err).into());
            return report;
        }
    };
    report.handle = Some(handle.to_string());

    match ctx
        .try_lookup(handle, symbol)
        .and_then(|address| Ok((address, ctx.try_resolve_address(address)?)))
    {
        Ok((address, info)) => {
            report.address = Some(hex(address));
            report.round_trip = info.symbol_address == Some(address);
            report.resolved = Some(info);
        }
        Err(err) => report.error = Some((&err).into()),
    }

    if let Err(err) = ctx.try_unload(handle) {
        report.error.get_or_insert_with(|| (&err).into());
    }
    report
}

pub fn resolve_address<H: HostLoader, E: SymbolEngine>(
    ctx: &DlContext<H, E>,
    address: usize,
) -> AddressReport {
    let (resolved, error) = match ctx.try_resolve_address(address) {
        Ok(info) => (Some(info), None),
        Err(err) => (None, Some((&err).into())),
    };
    AddressReport {
        address: hex(address),
        resolved,
        error,
    }
}

/// The host module table in enumeration order, paths in `/` form.
pub fn module_rows<H: HostLoader>(host: &H) -> Result<Vec<ModuleRow>, HarnessError> {
    let modules = host
        .modules()
        .map_err(|status| HarnessError::ModuleTable(status.code))?;
    let native = host.native_separator();
    Ok(modules
        .into_iter()
        .map(|m| ModuleRow {
            path: dlshim_core::path::to_portable(&m.path, native),
            base: hex(m.base),
            size: m.size,
            load_bias: hex(m.load_bias),
            handle: m.handle.map(hex),
        })
        .collect())
}

/// Pretty JSON for stdout.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, HarnessError> {
    Ok(serde_json::to_string_pretty(value)?)
}
