//! Internal invariant checks.
//!
//! Checks are only evaluated when the crate is compiled with `ENABLE_ASSERT=1`. A failed check
//! prints the message with a backtrace and exits the process.

macro_rules! barrier_assert {
    ($evaluate:expr, $($message:tt)+) => {
        if option_env!("ENABLE_ASSERT") == Some("1") && !($evaluate) {
            let message = format!($($message)+);
            log::error!("barrier invariant violated: {message}");
            eprintln!(
                "assert failed: \"{message}\"\n{}",
                std::backtrace::Backtrace::force_capture()
            );
            std::process::exit(1);
        }
    };
}

pub(crate) use barrier_assert;
