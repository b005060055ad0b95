//! Helper macros for ABI function generation.

/// Generate an exported `extern "C"` entry point.
///
/// ```ignore
/// abi_fn! {
///     /// Doc comment for the function.
///     fn dlshim_thing(arg: *const c_char) -> c_int = -1; {
///         // body, already inside an `unsafe` block
///     }
/// }
/// ```
///
/// The expression after `=` is returned if the body panics; the panic is
/// caught at the boundary by [`crate::runtime::guard`]. `return` inside the
/// body leaves the entry point as usual.
macro_rules! abi_fn {
    (
        $(#[$meta:meta])*
        fn $name:ident( $($arg:ident : $argty:ty),* $(,)? ) -> $ret:ty = $fail:expr;
        $body:block
    ) => {
        $(#[$meta])*
        #[unsafe(no_mangle)]
        #[allow(unused_unsafe)]
        pub unsafe extern "C" fn $name( $($arg : $argty),* ) -> $ret {
            $crate::runtime::guard(stringify!($name), $fail, || unsafe { $body })
        }
    };
}

pub(crate) use abi_fn;
