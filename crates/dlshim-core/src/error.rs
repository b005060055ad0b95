//! Error taxonomy and the one-shot error channel behind `dlerror`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::ErrorScope;
use crate::dlfcn::ModuleHandle;

/// Size of the message buffer, terminator included.
pub const MAX_ERROR_LEN: usize = 1024;

/// Every failure the shim can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DlError {
    /// `detail` is the host loader's own text; logged, never shown.
    #[error("could not load {path} due to code {code}")]
    LoadFailure {
        path: String,
        code: i64,
        detail: Option<String>,
    },
    #[error("could not unload {handle}, code {code}")]
    UnloadFailure {
        handle: ModuleHandle,
        code: i64,
        detail: Option<String>,
    },
    #[error("could not find {name}")]
    SymbolNotFound { name: String },
    #[error("could not find {name} in {handle}")]
    SymbolNotFoundIn { name: String, handle: ModuleHandle },
    #[error("could not enumerate modules while looking for {name}, code {code}")]
    ModuleTableUnavailable { name: String, code: i64 },
    #[error("could not find module of {address:#x}, code {code}")]
    ModuleNotFound { address: usize, code: i64 },
    #[error("could not initialize symbol engine, code {code}")]
    SymbolEngineInitFailure { code: i64 },
    #[error("could not find symbol of {address:#x}, code {code}")]
    SymbolEngineQueryFailure { address: usize, code: i64 },
    #[error("unknown dlinfo operation {request}")]
    UnknownInfoRequest { request: i32 },
    #[error("invalid handle {handle}")]
    InvalidHandle { handle: ModuleHandle },
    #[error("could not find {name}: RTLD_NEXT is not supported")]
    UnsupportedHandle { name: String },
}

impl DlError {
    /// Stable taxonomy name, used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoadFailure { .. } => "LoadFailure",
            Self::UnloadFailure { .. } => "UnloadFailure",
            Self::SymbolNotFound { .. }
            | Self::SymbolNotFoundIn { .. }
            | Self::ModuleTableUnavailable { .. }
            | Self::UnsupportedHandle { .. } => "SymbolNotFound",
            Self::ModuleNotFound { .. } => "ModuleNotFound",
            Self::SymbolEngineInitFailure { .. } => "SymbolEngineInitFailure",
            Self::SymbolEngineQueryFailure { .. } => "SymbolEngineQueryFailure",
            Self::UnknownInfoRequest { .. } => "UnknownInfoRequest",
            Self::InvalidHandle { .. } => "InvalidHandle",
        }
    }

    /// Host-provided diagnostic text, if the host gave any.
    pub fn host_detail(&self) -> Option<&str> {
        match self {
            Self::LoadFailure { detail, .. } | Self::UnloadFailure { detail, .. } => {
                detail.as_deref()
            }
            _ => None,
        }
    }
}

/// Cut `message` to fit a `MAX_ERROR_LEN` buffer with its terminator.
pub fn bound_message(mut message: String) -> String {
    let limit = MAX_ERROR_LEN - 1;
    if message.len() > limit {
        let mut end = limit;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD_SLOTS: RefCell<HashMap<u64, String>> = RefCell::new(HashMap::new());
}

/// At most one pending message; reading it clears it.
///
/// With [`ErrorScope::Process`] every thread shares the slot and the last
/// writer wins. With [`ErrorScope::Thread`] each thread sees only its own
/// failures.
pub struct ErrorChannel {
    id: u64,
    scope: ErrorScope,
    slot: Mutex<Option<String>>,
}

impl ErrorChannel {
    pub fn new(scope: ErrorScope) -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            scope,
            slot: Mutex::new(None),
        }
    }

    /// Store `error`, discarding any unread message.
    pub fn report(&self, error: &DlError) {
        self.report_message(error.to_string());
    }

    pub fn report_message(&self, message: String) {
        let message = bound_message(message);
        match self.scope {
            ErrorScope::Process => *self.slot.lock() = Some(message),
            ErrorScope::Thread => THREAD_SLOTS.with(|slots| {
                slots.borrow_mut().insert(self.id, message);
            }),
        }
    }

    /// Take the pending message, leaving the channel empty.
    pub fn take(&self) -> Option<String> {
        match self.scope {
            ErrorScope::Process => self.slot.lock().take(),
            ErrorScope::Thread => THREAD_SLOTS.with(|slots| slots.borrow_mut().remove(&self.id)),
        }
    }

    /// Whether a message is waiting (for the calling thread, in thread scope).
    pub fn has_error(&self) -> bool {
        match self.scope {
            ErrorScope::Process => self.slot.lock().is_some(),
            ErrorScope::Thread => THREAD_SLOTS.with(|slots| slots.borrow().contains_key(&self.id)),
        }
    }
}

impl Drop for ErrorChannel {
    fn drop(&mut self) {
        if self.scope == ErrorScope::Thread {
            // Only the dropping thread's entry is reachable; others die with their threads.
            let _ = THREAD_SLOTS.try_with(|slots| slots.borrow_mut().remove(&self.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_is_one_shot() {
        let ch = ErrorChannel::new(ErrorScope::Process);
        ch.report(&DlError::SymbolNotFound { name: "foo".into() });
        assert!(ch.has_error());
        assert_eq!(ch.take().as_deref(), Some("could not find foo"));
        assert_eq!(ch.take(), None);
        assert!(!ch.has_error());
    }

    #[test]
    fn last_write_wins() {
        let ch = ErrorChannel::new(ErrorScope::Process);
        ch.report(&DlError::SymbolNotFound { name: "first".into() });
        ch.report(&DlError::UnknownInfoRequest { request: 42 });
        assert_eq!(ch.take().as_deref(), Some("unknown dlinfo operation 42"));
        assert_eq!(ch.take(), None);
    }

    #[test]
    fn messages_are_bounded() {
        let ch = ErrorChannel::new(ErrorScope::Process);
        ch.report(&DlError::SymbolNotFound {
            name: "x".repeat(4 * MAX_ERROR_LEN),
        });
        let msg = ch.take().unwrap();
        assert_eq!(msg.len(), MAX_ERROR_LEN - 1);
        assert!(msg.starts_with("could not find xxx"));
    }

    #[test]
    fn bounding_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_LEN);
        let bounded = bound_message(long);
        assert!(bounded.len() <= MAX_ERROR_LEN - 1);
        assert!(bounded.chars().all(|c| c == 'é'));
    }

    #[test]
    fn process_scope_is_shared_across_threads() {
        let ch = std::sync::Arc::new(ErrorChannel::new(ErrorScope::Process));
        let writer = std::sync::Arc::clone(&ch);
        std::thread::spawn(move || {
            writer.report(&DlError::UnknownInfoRequest { request: 11 });
        })
        .join()
        .unwrap();
        assert_eq!(ch.take().as_deref(), Some("unknown dlinfo operation 11"));
    }

    #[test]
    fn thread_scope_isolates_threads() {
        let ch = std::sync::Arc::new(ErrorChannel::new(ErrorScope::Thread));
        let writer = std::sync::Arc::clone(&ch);
        std::thread::spawn(move || {
            writer.report(&DlError::UnknownInfoRequest { request: 11 });
            assert!(writer.has_error());
        })
        .join()
        .unwrap();
        assert_eq!(ch.take(), None);

        ch.report(&DlError::SymbolNotFound { name: "mine".into() });
        assert_eq!(ch.take().as_deref(), Some("could not find mine"));
        assert_eq!(ch.take(), None);
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        let handle = ModuleHandle::from_raw(0x10);
        assert_eq!(
            DlError::SymbolNotFoundIn { name: "a".into(), handle }.kind(),
            "SymbolNotFound"
        );
        assert_eq!(
            DlError::ModuleNotFound { address: 1, code: 0 }.kind(),
            "ModuleNotFound"
        );
        assert_eq!(
            DlError::UnknownInfoRequest { request: 99 }.kind(),
            "UnknownInfoRequest"
        );
    }

    #[test]
    fn scoped_lookup_message_names_symbol_and_handle() {
        let err = DlError::SymbolNotFoundIn {
            name: "cos".into(),
            handle: ModuleHandle::from_raw(0xabc0),
        };
        assert_eq!(err.to_string(), "could not find cos in 0xabc0");
    }
}
