#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, trace, warn};

#[cfg(not(feature = "tracing"))]
mod imp {
    /// Swallow a log statement while still type checking its
    /// arguments.
    macro_rules! noop {
        ($($args:tt)*) => {{
            if false {
                let _args = format!($($args)*);
            }
        }};
    }

    // The macros are named distinctly and only renamed on export, so
    // that `warn` does not clash with the built-in attribute.
    macro_rules! noop_debug {
        ($($args:tt)*) => {
            $crate::log::noop!($($args)*)
        };
    }

    macro_rules! noop_trace {
        ($($args:tt)*) => {
            $crate::log::noop!($($args)*)
        };
    }

    macro_rules! noop_warn {
        ($($args:tt)*) => {
            $crate::log::noop!($($args)*)
        };
    }

    pub(crate) use {noop, noop_debug, noop_trace, noop_warn};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use imp::{noop, noop_debug as debug, noop_trace as trace, noop_warn as warn};
