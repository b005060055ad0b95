//! Separator translation between the caller's portable `/` form and the
//! host's native form.

/// Separator used by callers of the POSIX interface.
pub const PORTABLE_SEPARATOR: char = '/';

/// Rewrite every `/` in `path` to `native`.
pub fn to_native(path: &str, native: char) -> String {
    if native == PORTABLE_SEPARATOR {
        return path.to_owned();
    }
    path.replace(PORTABLE_SEPARATOR, &native.to_string())
}

/// Rewrite every `native` separator in `path` to `/`.
pub fn to_portable(path: &str, native: char) -> String {
    if native == PORTABLE_SEPARATOR {
        return path.to_owned();
    }
    path.replace(native, "/")
}
