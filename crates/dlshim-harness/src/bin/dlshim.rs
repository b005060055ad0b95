//! CLI entrypoint for inspecting the dlfcn shim on the running host.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use dlshim_abi::host::LinuxHost;
use dlshim_core::{DlContext, ElfSymbolEngine, SafetyLevel, ShimConfig};
use dlshim_harness::{module_rows, parse_address, resolve_address, resolve_symbol, to_json};

/// Inspect what the dlfcn shim answers on this host.
#[derive(Debug, Parser)]
#[command(name = "dlshim")]
#[command(about = "Inspect dlopen/dlsym/dladdr behaviour of the dlfcn shim")]
struct Cli {
    /// Handle validation mode (overrides DLSHIM_MODE).
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Append JSONL structured logs here (overrides DLSHIM_LOG).
    #[arg(long)]
    log: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Strict,
    Hardened,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a module, look up a symbol, and resolve its address back.
    Resolve {
        /// Module path (`/`-separated). Omit to search the process image.
        #[arg(long)]
        module: Option<String>,
        /// Symbol name.
        #[arg(long)]
        symbol: String,
    },
    /// Print the host module table.
    Modules,
    /// Resolve a raw address to its module and nearest symbol.
    Addr {
        /// Address, `0x`-prefixed hex or decimal.
        address: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = ShimConfig::from_env();
    if let Some(mode) = cli.mode {
        config = config.with_mode(match mode {
            Mode::Strict => SafetyLevel::Strict,
            Mode::Hardened => SafetyLevel::Hardened,
        });
    }
    if let Some(log) = cli.log {
        config.log_path = Some(log);
    }
    let ctx = DlContext::new(LinuxHost::new(), ElfSymbolEngine::default(), config);

    let (json, failed) = match cli.command {
        Command::Resolve { module, symbol } => {
            let report = resolve_symbol(&ctx, module.as_deref(), &symbol);
            (to_json(&report)?, report.error.is_some())
        }
        Command::Modules => (to_json(&module_rows(ctx.host())?)?, false),
        Command::Addr { address } => {
            let report = resolve_address(&ctx, parse_address(&address)?);
            (to_json(&report)?, report.error.is_some())
        }
    };

    println!("{json}");
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
