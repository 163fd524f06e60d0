//! Fatal error reporting.
//!
//! Scheduler invariant violations are never returned to the caller; they stop
//! the system at the point of detection.

#[doc(hidden)]
#[macro_export]
macro_rules! k_panic {
    ($($arg:tt)*) => ({
        if cfg!(any(debug_assertions, not(all(target_arch = "arm", target_os = "none")))) {
            panic!($($arg)*);
        }
        else {
            $crate::kpanic::halt(format_args!($($arg)*))
        }
    });
}

#[doc(hidden)]
#[macro_export]
macro_rules! k_assert {
    ($cond:expr) => ({
        if !$cond {
            $crate::k_panic!(concat!("assertion failed: ", stringify!($cond)));
        }
    });
    ($cond:expr, $($arg:tt)+) => ({
        if !$cond {
            $crate::k_panic!($($arg)+);
        }
    });
}

#[doc(hidden)]
pub fn halt(args: core::fmt::Arguments) -> !
{
    log::error!("kernel halted: {}", args);

    loop {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        cortex_m::asm::bkpt();
    }
}

pub(crate) trait KUnwrap<T>
{
    fn k_unwrap(self) -> T;
}

impl<T> KUnwrap<T> for Option<T>
{
    fn k_unwrap(self) -> T
    {
        match self {
            Some(v) => v,
            None => k_panic!("Unwrapping on `None`")
        }
    }
}
