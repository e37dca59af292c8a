//! Macros to ease conditional code based on enabled features.

#![allow(unused_macros)]

/// The `os-poll` feature is enabled.
macro_rules! cfg_os_poll {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "os-poll")]
            $item
        )*
    }
}

/// The `os-poll` feature is disabled.
macro_rules! cfg_not_os_poll {
    ($($item:item)*) => {
        $(
            #[cfg(not(feature = "os-poll"))]
            $item
        )*
    }
}

/// The `tls` feature is enabled.
macro_rules! cfg_tls {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "tls")]
            $item
        )*
    }
}
