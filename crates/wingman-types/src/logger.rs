// Logging macros shared by every workspace crate.
//
// Messages carry a bracketed component tag, e.g. `sys_info!("[DOWNLOAD] ...")`.
// The binaries decide where the records end up (log4rs file + stderr).

#[macro_export]
macro_rules! sys_debug {
    ($($arg:tt)*) => {
        $crate::__log::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! sys_info {
    ($($arg:tt)*) => {
        $crate::__log::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! sys_warn {
    ($($arg:tt)*) => {
        $crate::__log::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! sys_error {
    ($($arg:tt)*) => {
        $crate::__log::error!($($arg)*)
    };
}
