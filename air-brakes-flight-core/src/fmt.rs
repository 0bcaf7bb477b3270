#![macro_use]
#![allow(unused_macros)]

// Logging shims: forward to `log` on the host, to `defmt` on target builds.

macro_rules! log_trace {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "log")]
            ::log::trace!($s $(, $x)*);

            #[cfg(all(feature = "defmt", not(feature = "log")))]
            ::defmt::trace!($s $(, $x)*);
        }
    };
}

macro_rules! log_debug {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "log")]
            ::log::debug!($s $(, $x)*);

            #[cfg(all(feature = "defmt", not(feature = "log")))]
            ::defmt::debug!($s $(, $x)*);
        }
    };
}

macro_rules! log_info {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "log")]
            ::log::info!($s $(, $x)*);

            #[cfg(all(feature = "defmt", not(feature = "log")))]
            ::defmt::info!($s $(, $x)*);
        }
    };
}

macro_rules! log_warn {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "log")]
            ::log::warn!($s $(, $x)*);

            #[cfg(all(feature = "defmt", not(feature = "log")))]
            ::defmt::warn!($s $(, $x)*);
        }
    };
}

/// Warn at most once every `$every` calls of the enclosing counter.
/// Used for per-tick fault conditions so a stuck sensor does not flood the log.
macro_rules! log_warn_every {
    ($counter:expr, $every:expr, $s:literal $(, $x:expr)* $(,)?) => {
        {
            let n: u32 = $counter;
            if n % $every == 0 {
                log_warn!($s $(, $x)*);
            }
        }
    };
}
