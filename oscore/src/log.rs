#[cfg(feature = "log")]
macro_rules! oscore_log {
    (info, $($arg:expr),*) => { log::info!($($arg),*); };
    (debug, $($arg:expr),*) => { log::debug!($($arg),*); };
}

#[cfg(not(feature = "log"))]
macro_rules! oscore_log {
    ($level:ident, $($arg:expr),*) => { $( let _ = $arg; )* }
}

macro_rules! oscore_info {
    ($($arg:expr),*) => (oscore_log!(info, $($arg),*));
}

macro_rules! oscore_debug {
    ($($arg:expr),*) => (oscore_log!(debug, $($arg),*));
}
