//! Kernel logging.

pub mod logger;

pub use logger::{init as init_logger, try_get_logger, Level, Logger};

/// Log at a given level through the global logger, if one is installed.
#[macro_export]
macro_rules! klog {
    ($lvl:expr, $($arg:tt)*) => {{
        if let Some(logger) = $crate::log::try_get_logger() {
            logger.log($lvl, core::format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::Level::Info, $($arg)*) };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::Level::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::klog!($crate::log::Level::Error, $($arg)*) };
}
