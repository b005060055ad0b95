//! Process-wide shim context for the C boundary.
//!
//! The context is built on first use from the environment
//! (`DLSHIM_MODE`, `DLSHIM_ERROR_SCOPE`, `DLSHIM_LOG`) and lives until the
//! process exits.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use dlshim_core::{DlContext, ElfSymbolEngine, ShimConfig};

use crate::host::LinuxHost;

pub type ShimContext = DlContext<LinuxHost, ElfSymbolEngine>;

// Context lifecycle states.
const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

// UNINIT -> INITIALIZING -> READY. Losers of the race spin until READY;
// building the context never calls back into the shim, so the winner
// always finishes.
static CONTEXT_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static CONTEXT_PTR: AtomicPtr<ShimContext> = AtomicPtr::new(std::ptr::null_mut());

/// The process context, created on first call.
pub fn context() -> &'static ShimContext {
    loop {
        match CONTEXT_STATE.load(Ordering::Acquire) {
            STATE_READY => {
                // SAFETY: once READY, CONTEXT_PTR is valid and never changes.
                return unsafe { &*CONTEXT_PTR.load(Ordering::Acquire) };
            }
            STATE_UNINIT
                if CONTEXT_STATE
                    .compare_exchange(
                        STATE_UNINIT,
                        STATE_INITIALIZING,
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    )
                    .is_ok() =>
            {
                let context = Box::new(DlContext::new(
                    LinuxHost::new(),
                    ElfSymbolEngine::default(),
                    ShimConfig::from_env(),
                ));
                let ptr = Box::into_raw(context);
                CONTEXT_PTR.store(ptr, Ordering::Release);
                CONTEXT_STATE.store(STATE_READY, Ordering::Release);
                // SAFETY: leaked above; lives for the rest of the process.
                return unsafe { &*ptr };
            }
            _ => std::thread::yield_now(),
        }
    }
}

/// Run an entry-point body, mapping a panic to `failure`.
pub(crate) fn guard<R>(name: &str, failure: R, body: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(_) => {
            let message = format!("internal error in {name}");
            if let Some(ctx) = ready_context() {
                ctx.errors().report_message(message);
            }
            failure
        }
    }
}

fn ready_context() -> Option<&'static ShimContext> {
    (CONTEXT_STATE.load(Ordering::Acquire) == STATE_READY)
        // SAFETY: see `context`.
        .then(|| unsafe { &*CONTEXT_PTR.load(Ordering::Acquire) })
}
